//! The per-session identity map.
//!
//! Keyed by `(table, primary-key hash)` and holding weak references, so a
//! row lives exactly as long as something outside the map uses it. Dead
//! entries are swept every [`SWEEP_EVERY`] registrations to bound table
//! growth in long-lived sessions.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, Weak};

use beanmodel_core::Value;

use crate::row_state::{RowState, SharedRow};

/// Dead weak entries are swept after this many registrations.
pub const SWEEP_EVERY: usize = 64;

/// Hash a primary-key map into the identity-map key.
///
/// Column names participate so that `{a: 1, b: 2}` and `{a: 2, b: 1}` hash
/// apart; values are tag-then-content hashed.
pub fn key_hash(pk: &BTreeMap<String, Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (name, value) in pk {
        name.hash(&mut hasher);
        hash_value(value, &mut hasher);
    }
    hasher.finish()
}

fn hash_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Float(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Text(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            5u8.hash(hasher);
            b.hash(hasher);
        }
    }
}

/// Weak map from `(table, pk hash)` to the live [`RowState`].
///
/// At most one live row exists per key: loads consult the map before
/// allocating, and registration replaces any dead entry.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<(String, u64), Weak<RwLock<RowState>>>,
    registrations: usize,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a row, sweeping dead entries periodically.
    pub fn register(&mut self, table: &str, hash: u64, row: &SharedRow) {
        self.entries
            .insert((table.to_string(), hash), Arc::downgrade(row));
        self.registrations += 1;
        if self.registrations % SWEEP_EVERY == 0 {
            self.sweep();
        }
    }

    /// Look up a live row.
    pub fn get(&self, table: &str, hash: u64) -> Option<SharedRow> {
        self.entries
            .get(&(table.to_string(), hash))
            .and_then(Weak::upgrade)
    }

    /// Drop a row, typically on delete.
    pub fn remove(&mut self, table: &str, hash: u64) {
        self.entries.remove(&(table.to_string(), hash));
    }

    /// Move a row to a new key after its primary key changed.
    pub fn rekey(&mut self, table: &str, old: u64, new: u64) {
        if let Some(weak) = self.entries.remove(&(table.to_string(), old)) {
            self.entries.insert((table.to_string(), new), weak);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        tracing::trace!(
            swept = before - self.entries.len(),
            remaining = self.entries.len(),
            "identity map sweep"
        );
    }
}
