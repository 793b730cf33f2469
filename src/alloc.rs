//! Space allocation.
//!
//! The pipeline does not decide where blocks go; it asks an `Allocator`. `SpaceMap` is a simple
//! first-fit implementation over free extent maps, one per device.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use blkptr::{BlockPointer, Location, Txg};
use Error;

/// A space allocator.
///
/// Implementations serialize their own state; the pipeline calls them from any thread.
pub trait Allocator: Send + Sync {
    /// Allocate `copies` extents of (at least) `size` bytes each, on distinct devices.
    ///
    /// If no single extent of the given size can be found, an `OutOfSpace` error is returned, and
    /// nothing is allocated.
    fn allocate(&self, size: usize, copies: usize, txg: Txg) -> Result<Vec<Location>, Error>;
    /// Free the physical locations of a block pointer.
    ///
    /// Freeing space which is not allocated is an `Implementation` error, and leaves the
    /// allocator untouched.
    fn free(&self, bp: &BlockPointer, txg: Txg) -> Result<(), Error>;
    /// Mark the physical locations of an already written block pointer as allocated.
    fn claim(&self, bp: &BlockPointer, txg: Txg) -> Result<(), Error>;
    /// The alignment of every extent handed out.
    ///
    /// Devices with larger sectors cannot be used with this allocator.
    fn granularity(&self) -> u64;
}

/// The space map of a single device.
#[derive(Default)]
struct Map {
    /// Free extents, offset to length.
    free: BTreeMap<u64, u64>,
    /// Allocated extents, offset to length.
    allocated: BTreeMap<u64, u64>,
}

impl Map {
    /// Take the first free extent of `size` bytes.
    fn take_first(&mut self, size: u64) -> Option<u64> {
        let (offset, len) = self.free.iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&offset, &len)| (offset, len))?;

        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.allocated.insert(offset, size);

        Some(offset)
    }

    /// Find the free extent containing `[offset, offset + size)`.
    fn free_extent(&self, offset: u64, size: u64) -> Option<(u64, u64)> {
        self.free.range(..offset + 1).next_back()
            .map(|(&start, &len)| (start, len))
            .filter(|&(start, len)| offset + size <= start + len)
    }

    /// Take a specific range out of the free map.
    fn take_range(&mut self, offset: u64, size: u64) {
        if let Some((start, len)) = self.free_extent(offset, size) {
            self.free.remove(&start);
            if offset > start {
                self.free.insert(start, offset - start);
            }
            if start + len > offset + size {
                self.free.insert(offset + size, start + len - offset - size);
            }
            self.allocated.insert(offset, size);
        }
    }

    /// Return an extent to the free map, coalescing with its neighbours.
    fn release(&mut self, mut offset: u64, mut size: u64) {
        self.allocated.remove(&offset);

        // Merge with the preceding extent.
        let prev = self.free.range(..offset).next_back().map(|(&start, &len)| (start, len));
        if let Some((start, len)) = prev {
            if start + len == offset {
                self.free.remove(&start);
                offset = start;
                size += len;
            }
        }
        // Merge with the following extent.
        if let Some(len) = self.free.remove(&(offset + size)) {
            size += len;
        }

        self.free.insert(offset, size);
    }
}

struct State {
    /// The per-device maps.
    maps: Vec<Map>,
    /// The device the next allocation starts at.
    rotor: usize,
}

/// A first-fit allocator.
///
/// Copies are spread round-robin over the devices. An optional extent ceiling limits the size of
/// any single extent, which is what forces large writes into gang blocks.
pub struct SpaceMap {
    state: Mutex<State>,
    /// The allocation granularity.
    granularity: u64,
    /// The largest extent handed out.
    max_extent: Option<u64>,
}

impl SpaceMap {
    /// Create a space map over devices of the given capacities (in bytes).
    ///
    /// Extents are rounded up to `granularity`, which must be a power of two.
    pub fn new(capacities: &[u64], granularity: u64) -> SpaceMap {
        assert!(granularity.is_power_of_two(), "allocation granularity must be a power of two");

        SpaceMap {
            state: Mutex::new(State {
                maps: capacities.iter().map(|&cap| {
                    let mut map = Map::default();
                    let usable = cap & !(granularity - 1);
                    if usable > 0 {
                        map.free.insert(0, usable);
                    }
                    map
                }).collect(),
                rotor: 0,
            }),
            granularity: granularity,
            max_extent: None,
        }
    }

    /// Refuse single extents larger than `max` bytes.
    pub fn max_extent(mut self, max: u64) -> SpaceMap {
        self.max_extent = Some(max);
        self
    }

    /// The number of allocated bytes over all devices.
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().maps.iter().map(|map| map.allocated.values().sum::<u64>()).sum()
    }

    /// Is this exact location allocated?
    pub fn is_allocated(&self, loc: &Location) -> bool {
        self.state.lock().maps.get(loc.vdev as usize)
            .and_then(|map| map.allocated.get(&loc.offset))
            .map_or(false, |&size| size == loc.asize as u64)
    }

    /// Round up to the granularity.
    fn round(&self, size: usize) -> u64 {
        (size as u64 + self.granularity - 1) & !(self.granularity - 1)
    }

    /// Check that every location of `bp` is a valid device index.
    fn check_devices(state: &State, bp: &BlockPointer) -> Result<(), Error> {
        match bp.locations.iter().find(|loc| loc.vdev as usize >= state.maps.len()) {
            Some(loc) => Err(err!(Implementation, "location {} names an unknown device", loc)),
            None => Ok(()),
        }
    }
}

impl Allocator for SpaceMap {
    fn allocate(&self, size: usize, copies: usize, _txg: Txg) -> Result<Vec<Location>, Error> {
        let asize = self.round(size);
        if asize == 0 || asize > u32::max_value() as u64 {
            return Err(err!(Implementation, "cannot allocate {} bytes", size));
        }
        if let Some(max) = self.max_extent {
            if asize > max {
                return Err(err!(OutOfSpace, "extent of {} bytes exceeds the ceiling of {}", asize, max));
            }
        }

        let mut state = self.state.lock();
        let devices = state.maps.len();
        if copies == 0 || copies > devices {
            return Err(err!(Implementation, "cannot place {} copies on {} devices", copies, devices));
        }

        let start = state.rotor;
        let mut locations: Vec<Location> = Vec::with_capacity(copies);
        for n in 0..devices {
            if locations.len() == copies {
                break;
            }

            let vdev = (start + n) % devices;
            if let Some(offset) = state.maps[vdev].take_first(asize) {
                locations.push(Location {
                    vdev: vdev as u32,
                    offset: offset,
                    asize: asize as u32,
                    gang: false,
                });
            }
        }

        if locations.len() < copies {
            // Roll back the partial allocation.
            for loc in &locations {
                state.maps[loc.vdev as usize].release(loc.offset, asize);
            }
            return Err(err!(OutOfSpace, "no {} free extents of {} bytes", copies, asize));
        }

        state.rotor = (start + 1) % devices;
        Ok(locations)
    }

    fn free(&self, bp: &BlockPointer, _txg: Txg) -> Result<(), Error> {
        let mut state = self.state.lock();
        SpaceMap::check_devices(&state, bp)?;

        // Validate everything before touching anything.
        for loc in &bp.locations {
            if state.maps[loc.vdev as usize].allocated.get(&loc.offset) != Some(&(loc.asize as u64)) {
                return Err(err!(Implementation, "freeing unallocated extent {}", loc));
            }
        }

        for loc in &bp.locations {
            state.maps[loc.vdev as usize].release(loc.offset, loc.asize as u64);
        }

        Ok(())
    }

    fn claim(&self, bp: &BlockPointer, _txg: Txg) -> Result<(), Error> {
        let mut state = self.state.lock();
        SpaceMap::check_devices(&state, bp)?;

        for loc in &bp.locations {
            if state.maps[loc.vdev as usize].free_extent(loc.offset, loc.asize as u64).is_none() {
                return Err(err!(Implementation, "claiming extent {} which is not free", loc));
            }
        }

        for loc in &bp.locations {
            state.maps[loc.vdev as usize].take_range(loc.offset, loc.asize as u64);
        }

        Ok(())
    }

    fn granularity(&self) -> u64 {
        self.granularity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Kind;

    fn bp(locations: Vec<Location>) -> BlockPointer {
        BlockPointer::physical(locations, 512, 1)
    }

    #[test]
    fn first_fit() {
        let map = SpaceMap::new(&[4096], 512);

        let a = map.allocate(1000, 1, 1).unwrap();
        let b = map.allocate(512, 1, 1).unwrap();
        assert_eq!(a[0].offset, 0);
        assert_eq!(a[0].asize, 1024);
        assert_eq!(b[0].offset, 1024);
        assert_eq!(map.allocated_bytes(), 1536);

        map.free(&bp(a), 1).unwrap();
        let c = map.allocate(512, 1, 1).unwrap();
        assert_eq!(c[0].offset, 0);
    }

    #[test]
    fn coalesce() {
        let map = SpaceMap::new(&[2048], 512);
        let locs: Vec<_> = (0..4).map(|_| map.allocate(512, 1, 1).unwrap()).collect();
        assert!(map.allocate(512, 1, 1).is_err());

        map.free(&bp(locs[1].clone()), 1).unwrap();
        map.free(&bp(locs[3].clone()), 1).unwrap();
        map.free(&bp(locs[2].clone()), 1).unwrap();
        map.free(&bp(locs[0].clone()), 1).unwrap();

        // Everything merged back into one extent.
        assert_eq!(map.allocate(2048, 1, 1).unwrap()[0].offset, 0);
    }

    #[test]
    fn copies_on_distinct_devices() {
        let map = SpaceMap::new(&[4096, 4096, 4096], 512);

        let locs = map.allocate(512, 3, 1).unwrap();
        let mut vdevs: Vec<_> = locs.iter().map(|loc| loc.vdev).collect();
        vdevs.sort();
        assert_eq!(vdevs, [0, 1, 2]);

        assert_eq!(map.allocate(512, 4, 1).unwrap_err().kind, Kind::Implementation);
    }

    #[test]
    fn partial_allocation_rolls_back() {
        let map = SpaceMap::new(&[4096, 1024], 512);

        assert_eq!(map.allocate(2048, 2, 1).unwrap_err().kind, Kind::OutOfSpace);
        assert_eq!(map.allocated_bytes(), 0);
    }

    #[test]
    fn ceiling() {
        let map = SpaceMap::new(&[1 << 20], 512).max_extent(65536);

        assert_eq!(map.allocate(65537, 1, 1).unwrap_err().kind, Kind::OutOfSpace);
        assert!(map.allocate(65536, 1, 1).is_ok());
    }

    #[test]
    fn double_free() {
        let map = SpaceMap::new(&[4096], 512);
        let locs = map.allocate(512, 1, 1).unwrap();

        map.free(&bp(locs.clone()), 1).unwrap();
        assert_eq!(map.free(&bp(locs), 1).unwrap_err().kind, Kind::Implementation);
        assert_eq!(map.allocated_bytes(), 0);
    }

    #[test]
    fn claim() {
        let map = SpaceMap::new(&[4096], 512);
        let loc = Location { vdev: 0, offset: 1024, asize: 512, gang: false };

        map.claim(&bp(vec![loc]), 1).unwrap();
        assert!(map.is_allocated(&loc));
        assert_eq!(map.claim(&bp(vec![loc]), 1).unwrap_err().kind, Kind::Implementation);

        // The space around the claimed extent is still usable.
        assert_eq!(map.allocate(1024, 1, 1).unwrap()[0].offset, 0);
        assert_eq!(map.allocate(2048, 1, 1).unwrap()[0].offset, 1536);
    }
}
