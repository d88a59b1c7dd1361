//! Dedup merge of lister outputs into one inventory per layer.
//!
//! Records are keyed by [`InventoryKey`] (`name#version`). The first record
//! observed for a key is kept and later ones are dropped without error; no
//! other field is reconciled because name and version are the full identity.
//! An [`Inventory`] is itself a record set, so merges nest:
//! `merge([merge([a, b]), c]) == merge([a, merge([b, c])]) == merge([a, b, c])`.

use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, Entry};
use std::collections::BTreeMap;

use crate::model::{InventoryKey, PackageRecord};

/// Deduplicated set of package records for one layer, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    records: BTreeMap<InventoryKey, PackageRecord>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record` unless its key is already present.
    ///
    /// Returns `true` if the record was kept.
    pub fn insert(&mut self, record: PackageRecord) -> bool {
        match self.records.entry(record.key()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, key: &InventoryKey) -> Option<&PackageRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, name: &str, version: &str) -> bool {
        self.records.contains_key(&InventoryKey::new(name, version))
    }

    pub fn keys(&self) -> impl Iterator<Item = &InventoryKey> {
        self.records.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<PackageRecord> {
        self.records.into_values().collect()
    }
}

impl Extend<PackageRecord> for Inventory {
    fn extend<T: IntoIterator<Item = PackageRecord>>(&mut self, iter: T) {
        for record in iter {
            self.insert(record);
        }
    }
}

impl FromIterator<PackageRecord> for Inventory {
    fn from_iter<T: IntoIterator<Item = PackageRecord>>(iter: T) -> Self {
        let mut inventory = Inventory::new();
        inventory.extend(iter);
        inventory
    }
}

impl IntoIterator for Inventory {
    type Item = PackageRecord;
    type IntoIter = btree_map::IntoValues<InventoryKey, PackageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}

/// Merges record sets in order into a single inventory, first observation
/// of each key winning.
pub fn merge<I, S>(record_sets: I) -> Inventory
where
    I: IntoIterator<Item = S>,
    S: IntoIterator<Item = PackageRecord>,
{
    record_sets.into_iter().flatten().collect()
}
