//! Pipeline configuration.

use std::time::Duration;

use Error;

/// The largest number of device retries a single request may ever be granted.
///
/// Values of `Options::max_retries` above this are clamped.
pub const RETRY_CEILING: u32 = 3;

/// Pipeline options.
///
/// These are fixed for the lifetime of a `Pipeline`. The pool configuration (devices, syncing
/// generation) is separate and may change at runtime.
#[derive(Debug, Clone)]
pub struct Options {
    /// The number of worker threads.
    pub workers: usize,
    /// The number of times a failed device operation is retried.
    ///
    /// Only transient (`Kind::Io`) errors on requests targeting a single location are retried.
    pub max_retries: u32,
    /// The minimal time between two reopen probes of the same device.
    ///
    /// A device which keeps failing is only probed this often, rather than on every failed
    /// request.
    pub probe_interval: Duration,
    /// The commit pass from which blocks rewritten in the generation they were born in are no
    /// longer compressed.
    pub sync_pass_dont_compress: u32,
    /// The commit pass from which same-generation blocks of unchanged physical size are rewritten
    /// in place instead of reallocated.
    pub sync_pass_rewrite: u32,
    /// Physical size at or above which writes are split into gang blocks without consulting the
    /// allocator.
    ///
    /// This exists to exercise the gang path.
    pub force_gang_threshold: Option<usize>,
    /// The smallest extent a gang member is shrunk to.
    ///
    /// This must be a power of two.
    pub min_extent: usize,
    /// The largest logical block size accepted.
    pub max_block_size: usize,
}

impl Options {
    /// Check the options for consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(err!(Implementation, "the pipeline needs at least one worker"));
        }
        if !self.min_extent.is_power_of_two() {
            return Err(err!(Implementation, "minimal extent {} is not a power of two", self.min_extent));
        }
        if self.max_block_size < self.min_extent {
            return Err(err!(Implementation, "maximal block size {} below minimal extent {}",
                            self.max_block_size, self.min_extent));
        }
        if self.max_block_size > u32::max_value() as usize {
            return Err(err!(Implementation, "maximal block size {} does not fit a block pointer",
                            self.max_block_size));
        }

        Ok(())
    }

    /// The effective retry limit.
    pub fn retry_limit(&self) -> u32 {
        if self.max_retries > RETRY_CEILING {
            RETRY_CEILING
        } else {
            self.max_retries
        }
    }
}

impl Default for Options {
    fn default() -> Options {
        Options {
            workers: 4,
            max_retries: 1,
            probe_interval: Duration::from_secs(60),
            sync_pass_dont_compress: 5,
            sync_pass_rewrite: 2,
            force_gang_threshold: None,
            min_extent: 512,
            max_block_size: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn retries_clamped() {
        let mut options = Options::default();
        assert_eq!(options.retry_limit(), 1);

        options.max_retries = 10;
        assert_eq!(options.retry_limit(), RETRY_CEILING);
    }

    #[test]
    fn invalid() {
        let mut options = Options::default();
        options.min_extent = 500;
        assert!(options.validate().is_err());

        let mut options = Options::default();
        options.workers = 0;
        assert!(options.validate().is_err());

        let mut options = Options::default();
        options.max_block_size = 256;
        assert!(options.validate().is_err());
    }
}
