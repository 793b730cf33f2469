//! The pool configuration and its access token.
//!
//! The configuration is read by every request but changed rarely. Each independent request tree
//! holds a reader token from its first stage to completion, and changing the configuration waits
//! for all readers to leave, so a request never sees the device table change under it.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use blkptr::Txg;
use disk::Device;

/// The pool configuration.
pub struct PoolConfig {
    /// The device table, indexed by the `vdev` field of locations.
    pub devices: Vec<Arc<dyn Device>>,
    /// The generation currently being committed.
    pub syncing_txg: Txg,
    /// The commit pass of `syncing_txg`.
    ///
    /// Passes are counted from 1.
    pub sync_pass: u32,
}

impl PoolConfig {
    /// Look up a device.
    pub fn device(&self, vdev: u32) -> Option<&Arc<dyn Device>> {
        self.devices.get(vdev as usize)
    }
}

/// The token holders.
#[derive(Default)]
struct Holders {
    /// The number of reader tokens handed out.
    readers: usize,
    /// Is a writer active?
    writer: bool,
}

/// The configuration together with its reader/writer token.
pub struct ConfigLock {
    holders: Mutex<Holders>,
    /// Signaled whenever a holder leaves.
    changed: Condvar,
    config: RwLock<PoolConfig>,
}

impl ConfigLock {
    pub fn new(config: PoolConfig) -> ConfigLock {
        ConfigLock {
            holders: Mutex::new(Holders::default()),
            changed: Condvar::new(),
            config: RwLock::new(config),
        }
    }

    /// Take a reader token.
    ///
    /// This blocks while a writer is active.
    pub fn enter(this: &Arc<ConfigLock>) -> ConfigToken {
        let mut holders = this.holders.lock();
        while holders.writer {
            this.changed.wait(&mut holders);
        }
        holders.readers += 1;

        ConfigToken {
            lock: this.clone(),
        }
    }

    /// Read the configuration.
    ///
    /// This does not take a token; it only guarantees a consistent snapshot for the duration of
    /// the guard.
    pub fn read(&self) -> RwLockReadGuard<PoolConfig> {
        self.config.read()
    }

    /// Change the configuration.
    ///
    /// This waits for every reader token to be returned.
    pub fn write<F: FnOnce(&mut PoolConfig)>(&self, f: F) {
        {
            let mut holders = self.holders.lock();
            while holders.writer || holders.readers > 0 {
                self.changed.wait(&mut holders);
            }
            holders.writer = true;
        }

        {
            let mut config: RwLockWriteGuard<PoolConfig> = self.config.write();
            f(&mut config);
        }

        self.holders.lock().writer = false;
        self.changed.notify_all();
    }

    /// The number of reader tokens currently held.
    #[cfg(test)]
    pub fn readers(&self) -> usize {
        self.holders.lock().readers
    }
}

/// A reader token.
///
/// The token is returned when dropped.
pub struct ConfigToken {
    lock: Arc<ConfigLock>,
}

impl Drop for ConfigToken {
    fn drop(&mut self) {
        let mut holders = self.lock.holders.lock();
        holders.readers = match holders.readers.checked_sub(1) {
            Some(readers) => readers,
            None => panic!("configuration token returned twice"),
        };
        drop(holders);

        self.lock.changed.notify_all();
    }
}
