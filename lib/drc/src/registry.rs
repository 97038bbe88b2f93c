// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Index-keyed lookup of connectors, owned by the hosting bridge or machine
//! context.  Guest calls reference connectors by raw index, so every
//! connector is registered at creation and stays reachable for the life of
//! the registry; only the attached-device link on the connector itself
//! cycles.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::connector::{Drc, DrcIndex, DrcType};

pub struct DrcRegistry {
    inner: Mutex<BTreeMap<u32, Arc<Drc>>>,
}

impl DrcRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(BTreeMap::new()) }
    }

    /// Registers a connector under its derived index.
    ///
    /// # Panics
    ///
    /// If a connector with the same index (same `(type, id)`) was already
    /// registered.  Slot numbering is fixed at construction time, so a
    /// collision is a caller bug.
    pub fn insert(&self, drc: Arc<Drc>) {
        let mut inner = self.inner.lock().unwrap();
        let index = drc.index().get();
        let old = inner.insert(index, drc);
        assert!(old.is_none(), "duplicate connector index {:#x}", index);
    }

    /// Creates a connector and registers it in one step.
    pub fn create(
        &self,
        dtype: DrcType,
        id: u32,
        log: &slog::Logger,
    ) -> Arc<Drc> {
        let drc = Drc::new(dtype, id, log);
        self.insert(Arc::clone(&drc));
        drc
    }

    pub fn by_index(&self, index: u32) -> Option<Arc<Drc>> {
        self.inner.lock().unwrap().get(&index).map(Arc::clone)
    }

    pub fn by_id(&self, dtype: DrcType, id: u32) -> Option<Arc<Drc>> {
        self.by_index(DrcIndex::new(dtype, id).get())
    }
}

impl Default for DrcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn lookup() {
        let registry = DrcRegistry::new();
        let log = test_log();
        let drc = registry.create(DrcType::Pci, 0x20, &log);
        registry.create(DrcType::Cpu, 0x20, &log);

        let by_index = registry.by_index(drc.index().get()).unwrap();
        assert_eq!(by_index.index(), drc.index());

        let by_id = registry.by_id(DrcType::Pci, 0x20).unwrap();
        assert_eq!(by_id.index(), drc.index());

        // same id, different type: distinct connectors
        let cpu = registry.by_id(DrcType::Cpu, 0x20).unwrap();
        assert_ne!(cpu.index(), drc.index());

        assert!(registry.by_id(DrcType::Lmb, 0x20).is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate connector index")]
    fn duplicate_insert() {
        let registry = DrcRegistry::new();
        let log = test_log();
        registry.create(DrcType::Pci, 1, &log);
        registry.create(DrcType::Pci, 1, &log);
    }
}
