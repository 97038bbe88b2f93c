// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-host-bridge tracking of address ranges handed out to device BARs.
//!
//! Boot-time placement follows firmware behavior: a running cursor per range,
//! advanced past each assignment and size-aligned at the next request.
//! Hotplug requests rescan from the start of the range so holes left by
//! unplugged devices can be reused.  This can leave sizable alignment gaps,
//! but it keeps assignments reproducible against the firmware allocator it
//! models.

use std::collections::BTreeMap;

use slog::{debug, warn};
use strum::{EnumCount, FromRepr};
use thiserror::Error;

use super::{BarN, Bdf};
use crate::migrate::MigrateStateError;

/// The address ranges a host bridge carves its I/O and memory windows into.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromRepr, EnumCount)]
#[repr(u32)]
pub enum ResourceType {
    Io = 0,
    Mmio32,
    Mmio64,
    Mem32,
    Mem64,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    /// No free aligned region of the requested size remains in the range.
    /// Non-fatal to the allocator; the device placement fails.
    #[error("no free {rtype:?} region of size {size:#x}")]
    Exhausted { rtype: ResourceType, size: u64 },
}

/// Key under which a reserved region is recorded.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum RegionKey {
    /// Statically reserved window (e.g. an MSI window), never auto-placed.
    Reserved(u32),
    /// BAR region tied to a device function.
    Bar { bdf: Bdf, bar: BarN },
}

#[derive(Copy, Clone, Debug)]
struct Region {
    rtype: ResourceType,
    addr: u64,
    size: u64,
}

#[derive(Copy, Clone, Debug)]
struct Range {
    start: u64,
    size: u64,
    search_start: u64,
}

impl Range {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

pub struct PciResources {
    name: String,
    log: slog::Logger,
    iospace_size: u64,
    memspace_size: u64,
    ranges: [Option<Range>; ResourceType::COUNT],
    regions: BTreeMap<RegionKey, Region>,
}

impl PciResources {
    pub fn new(
        name: &str,
        log: &slog::Logger,
        iospace_size: u64,
        memspace_size: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            log: log.new(slog::o!("pci-resources" => name.to_string())),
            iospace_size,
            memspace_size,
            ranges: [None; ResourceType::COUNT],
            regions: BTreeMap::new(),
        }
    }

    /// One-time setup of the I/O-space window.
    ///
    /// # Panics
    ///
    /// If `rtype` is not [`ResourceType::Io`], the range was already added,
    /// or it does not fit within the bridge's I/O space.
    pub fn add_io_range(&mut self, rtype: ResourceType, base: u64, size: u64) {
        assert_eq!(rtype, ResourceType::Io);
        self.init_range(rtype, base, size, self.iospace_size);
    }

    /// One-time setup of a memory window.
    ///
    /// # Panics
    ///
    /// If `rtype` is [`ResourceType::Io`], the range was already added, or it
    /// does not fit within the bridge's memory space.
    pub fn add_mem_range(&mut self, rtype: ResourceType, base: u64, size: u64) {
        assert_ne!(rtype, ResourceType::Io);
        self.init_range(rtype, base, size, self.memspace_size);
    }

    fn init_range(
        &mut self,
        rtype: ResourceType,
        base: u64,
        size: u64,
        space_size: u64,
    ) {
        assert!(
            base.checked_add(size).is_some_and(|end| end <= space_size),
            "{}: {:?} range {:#x}+{:#x} exceeds space size {:#x}",
            self.name,
            rtype,
            base,
            size,
            space_size
        );
        assert!(
            self.ranges[rtype as usize].is_none(),
            "{}: {:?} range already added",
            self.name,
            rtype
        );
        self.ranges[rtype as usize] =
            Some(Range { start: base, size, search_start: base });
    }

    fn range(&self, rtype: ResourceType) -> Range {
        self.ranges[rtype as usize]
            .unwrap_or_else(|| panic!("{}: {:?} range not added", self.name, rtype))
    }

    /// First reserved region in `rtype` overlapping `[addr, addr + size)`,
    /// preferring the one extending furthest so the caller can skip past the
    /// whole cluster at once.
    fn overlap(&self, rtype: ResourceType, addr: u64, size: u64) -> Option<Region> {
        self.regions
            .values()
            .filter(|r| r.rtype == rtype)
            .filter(|r| r.addr < addr + size && addr < r.addr + r.size)
            .max_by_key(|r| r.addr + r.size)
            .copied()
    }

    fn insert(&mut self, key: RegionKey, region: Region) {
        assert!(
            self.overlap(region.rtype, region.addr, region.size).is_none(),
            "{}: region {:?} overlaps an existing reservation",
            self.name,
            key
        );
        let old = self.regions.insert(key, region);
        assert!(old.is_none(), "{}: region {:?} already reserved", self.name, key);
    }

    /// Finds and records a size-aligned free region for a device BAR,
    /// returning its address.
    ///
    /// Boot-time requests (`!hotplugged`) start from the range's running
    /// cursor; hotplug requests rescan from the start of the range.  An
    /// aligned start of zero is bumped to `size` so no region is ever placed
    /// at address zero.
    pub fn request_bar_region(
        &mut self,
        rtype: ResourceType,
        size: u64,
        hotplugged: bool,
        bdf: Bdf,
        bar: BarN,
    ) -> Result<u64, ResourceError> {
        assert!(size.is_power_of_two(), "BAR size {:#x} not a power of two", size);
        let range = self.range(rtype);

        let mut start = if hotplugged { range.start } else { range.search_start };
        if start == 0 {
            start = size;
        }

        let mut addr = align_up(start, size);
        loop {
            if addr.checked_add(size).map_or(true, |end| end > range.end()) {
                warn!(
                    self.log,
                    "can't find free region";
                    "rtype" => ?rtype,
                    "size" => %format_args!("{size:#x}"),
                    "bdf" => %bdf,
                    "bar" => ?bar,
                );
                return Err(ResourceError::Exhausted { rtype, size });
            }
            match self.overlap(rtype, addr, size) {
                Some(r) => addr = align_up(r.addr + r.size, size),
                None => break,
            }
        }

        self.insert(RegionKey::Bar { bdf, bar }, Region { rtype, addr, size });
        self.ranges[rtype as usize].as_mut().unwrap().search_start = addr + size;
        debug!(
            self.log,
            "BAR region assigned";
            "rtype" => ?rtype,
            "addr" => %format_args!("{addr:#x}"),
            "size" => %format_args!("{size:#x}"),
            "bdf" => %bdf,
            "bar" => ?bar,
        );
        Ok(addr)
    }

    /// Records a statically placed region under a caller-chosen id.
    ///
    /// # Panics
    ///
    /// If the region overlaps an existing reservation, the id is already in
    /// use, or it falls outside the range.  These are caller bugs: static
    /// windows are placed by construction, not searched for.
    pub fn reserve_region(
        &mut self,
        rtype: ResourceType,
        addr: u64,
        size: u64,
        id: u32,
    ) {
        let range = self.range(rtype);
        assert!(
            addr >= range.start
                && addr.checked_add(size).is_some_and(|end| end <= range.end()),
            "{}: reservation {:#x}+{:#x} outside {:?} range",
            self.name,
            addr,
            size,
            rtype
        );
        self.insert(RegionKey::Reserved(id), Region { rtype, addr, size });
    }

    /// Releases a region recorded by [`Self::reserve_region`].
    ///
    /// # Panics
    ///
    /// If no region is reserved under `id`.
    pub fn release_region(&mut self, id: u32) {
        let key = RegionKey::Reserved(id);
        self.regions
            .remove(&key)
            .unwrap_or_else(|| panic!("{}: release of unreserved id {:#x}", self.name, id));
    }

    /// Releases a region recorded by [`Self::request_bar_region`].
    ///
    /// # Panics
    ///
    /// If no region is reserved for `(bdf, bar)`.
    pub fn release_bar_region(&mut self, bdf: Bdf, bar: BarN) {
        let key = RegionKey::Bar { bdf, bar };
        self.regions.remove(&key).unwrap_or_else(|| {
            panic!("{}: release of unreserved BAR {}/{:?}", self.name, bdf, bar)
        });
    }

    /// Drops every reservation in one pass.  Ranges and their search cursors
    /// are left in place.
    pub fn reset(&mut self) {
        self.regions.clear();
    }

    /// Address and size reserved under `key`, if any.
    pub fn region(&self, key: RegionKey) -> Option<(u64, u64)> {
        self.regions.get(&key).map(|r| (r.addr, r.size))
    }

    pub fn export(&self) -> migrate::ResourcesStateV1 {
        migrate::ResourcesStateV1 {
            search_start: self.ranges.map(|r| r.map(|r| r.search_start)),
            regions: self
                .regions
                .iter()
                .map(|(key, region)| migrate::RegionV1 {
                    key: match *key {
                        RegionKey::Reserved(id) => {
                            migrate::RegionKeyV1::Reserved { id }
                        }
                        RegionKey::Bar { bdf, bar } => migrate::RegionKeyV1::Bar {
                            bdf: bdf.raw(),
                            bar: bar as u8,
                        },
                    },
                    rtype: region.rtype as u32,
                    addr: region.addr,
                    size: region.size,
                })
                .collect(),
        }
    }

    pub fn import(
        &mut self,
        state: migrate::ResourcesStateV1,
    ) -> Result<(), MigrateStateError> {
        let mut staged = Self {
            name: self.name.clone(),
            log: self.log.clone(),
            iospace_size: self.iospace_size,
            memspace_size: self.memspace_size,
            ranges: self.ranges,
            regions: BTreeMap::new(),
        };
        for (idx, cursor) in state.search_start.iter().enumerate() {
            match (&mut staged.ranges[idx], cursor) {
                (Some(range), Some(cursor)) => range.search_start = *cursor,
                (None, Some(_)) => {
                    return Err(MigrateStateError::ImportFailed(format!(
                        "search cursor for absent range {}",
                        idx
                    )));
                }
                (_, None) => {}
            }
        }
        for region in state.regions {
            let rtype =
                ResourceType::from_repr(region.rtype).ok_or_else(|| {
                    MigrateStateError::ImportFailed(format!(
                        "invalid resource type {}",
                        region.rtype
                    ))
                })?;
            let range = staged.ranges[rtype as usize].ok_or_else(|| {
                MigrateStateError::ImportFailed(format!(
                    "region in absent range {:?}",
                    rtype
                ))
            })?;
            let in_range = region.addr >= range.start
                && region
                    .addr
                    .checked_add(region.size)
                    .is_some_and(|end| end <= range.end());
            if !in_range {
                return Err(MigrateStateError::ImportFailed(format!(
                    "region {:#x}+{:#x} outside {:?} range",
                    region.addr, region.size, rtype
                )));
            }
            let key = match region.key {
                migrate::RegionKeyV1::Reserved { id } => RegionKey::Reserved(id),
                migrate::RegionKeyV1::Bar { bdf, bar } => RegionKey::Bar {
                    bdf: Bdf::from_raw(bdf),
                    bar: BarN::from_repr(bar).ok_or_else(|| {
                        MigrateStateError::ImportFailed(format!(
                            "invalid BAR index {}",
                            bar
                        ))
                    })?,
                },
            };
            if staged.overlap(rtype, region.addr, region.size).is_some()
                || staged.regions.contains_key(&key)
            {
                return Err(MigrateStateError::ImportFailed(format!(
                    "region {:?} overlaps or duplicates another",
                    key
                )));
            }
            staged.regions.insert(
                key,
                Region { rtype, addr: region.addr, size: region.size },
            );
        }
        self.ranges = staged.ranges;
        self.regions = staged.regions;
        Ok(())
    }
}

pub mod migrate {
    use serde::{Deserialize, Serialize};
    use strum::EnumCount;

    use super::ResourceType;

    #[derive(Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
    pub enum RegionKeyV1 {
        Reserved { id: u32 },
        Bar { bdf: u16, bar: u8 },
    }

    #[derive(Deserialize, Serialize)]
    pub struct RegionV1 {
        pub key: RegionKeyV1,
        pub rtype: u32,
        pub addr: u64,
        pub size: u64,
    }

    #[derive(Deserialize, Serialize)]
    pub struct ResourcesStateV1 {
        pub search_start: [Option<u64>; ResourceType::COUNT],
        pub regions: Vec<RegionV1>,
    }
}
