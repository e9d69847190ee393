//! Process-wide hook bookkeeping
//!
//! One map from hooked function address to its record. Hook installation
//! and removal are writers; `trampoline_of` is called from hook functions
//! on the hot path and must never block behind another reader, hence the
//! reader/writer lock.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::addr::IntAddr;

use super::{Prolog, Strategy};

/// global registry singleton
static REGISTRY: RwLock<Option<HookRegistry>> = RwLock::new(None);

/// bookkeeping for one installed hook
#[derive(Debug, Clone)]
pub struct HookRecord {
    /// bytes the hook overwrote
    pub original: Prolog,
    /// bytes the hook wrote in
    pub installed: Prolog,
    /// executable slot holding the relocated prolog
    pub trampoline: IntAddr,
    pub strategy: Strategy,
}

impl HookRecord {
    /// a record is valid iff it has a non-null trampoline
    pub fn is_valid(&self) -> bool {
        self.trampoline != 0
    }
}

/// map from hooked address to record
#[derive(Default)]
pub struct HookRegistry {
    records: HashMap<IntAddr, HookRecord>,
}

impl HookRegistry {
    fn insert(&mut self, target: IntAddr, record: HookRecord) -> bool {
        if !record.is_valid() || self.records.contains_key(&target) {
            return false;
        }
        self.records.insert(target, record);
        true
    }

    fn lookup(&self, target: IntAddr) -> Option<&HookRecord> {
        self.records.get(&target)
    }

    fn remove(&mut self, target: IntAddr) -> Option<HookRecord> {
        self.records.remove(&target)
    }
}

/// register a hook; fails on an occupied address or an invalid record
pub fn insert(target: IntAddr, record: HookRecord) -> bool {
    let mut guard = REGISTRY.write().unwrap();
    guard.get_or_insert_with(HookRegistry::default).insert(target, record)
}

/// fetch a copy of the record for `target`
pub fn lookup(target: IntAddr) -> Option<HookRecord> {
    let guard = REGISTRY.read().unwrap();
    guard.as_ref().and_then(|reg| reg.lookup(target).cloned())
}

/// trampoline address for `target`, if hooked
pub fn trampoline_of(target: IntAddr) -> Option<IntAddr> {
    let guard = REGISTRY.read().unwrap();
    guard
        .as_ref()
        .and_then(|reg| reg.lookup(target).map(|record| record.trampoline))
}

/// remove and return the record for `target`
pub fn remove(target: IntAddr) -> Option<HookRecord> {
    let mut guard = REGISTRY.write().unwrap();
    guard.as_mut().and_then(|reg| reg.remove(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(trampoline: IntAddr) -> HookRecord {
        HookRecord {
            original: Prolog::default(),
            installed: Prolog::default(),
            trampoline,
            strategy: Strategy::NearRel32,
        }
    }

    #[test]
    fn test_insert_lookup_remove() {
        let target = 0xDEAD_0000usize;

        assert!(insert(target, record(0x4000)));
        assert_eq!(trampoline_of(target), Some(0x4000));
        assert!(lookup(target).unwrap().is_valid());

        // double insert on the same address fails
        assert!(!insert(target, record(0x5000)));
        assert_eq!(trampoline_of(target), Some(0x4000));

        assert_eq!(remove(target).unwrap().trampoline, 0x4000);
        assert!(lookup(target).is_none());
        assert!(remove(target).is_none());
    }

    #[test]
    fn test_invalid_record_rejected() {
        let target = 0xBEEF_0000usize;
        assert!(!insert(target, record(0)));
        assert!(lookup(target).is_none());
    }
}
