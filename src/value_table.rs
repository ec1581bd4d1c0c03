//! Replicated key/value storage.
//!
//! Values are grouped into named tables. A table's position in the keyspace is
//! the hash of its name, so the peers closest to that hash hold its replicas.
//! Everything here is soft state: entries age out unless rewritten, and the
//! writer republishes what it owns.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::trace;

use crate::config::ValueConfig;
use crate::constants::TOTAL_KEY;
use crate::dht::DhtError;
use crate::peer::{distance, hash_peerid, PeerHash};

#[derive(Debug, Clone)]
pub struct ValueEntry {
    pub value: Bytes,
    pub update_time: u64,
    pub key_hash: PeerHash,
}

#[derive(Debug)]
struct ValueTable {
    hash: PeerHash,
    values: HashMap<String, ValueEntry>,
    last_update: u64,
}

impl ValueTable {
    fn new(name: &str) -> Self {
        Self {
            hash: hash_peerid(name),
            values: HashMap::new(),
            last_update: 0,
        }
    }
}

pub struct DistributedValueTable {
    tables: HashMap<String, ValueTable>,
    owned: BTreeMap<String, BTreeMap<String, Bytes>>,
    value_timeout: u64,
    max_tables: usize,
}

impl DistributedValueTable {
    pub fn new(config: &ValueConfig) -> Self {
        Self {
            tables: HashMap::new(),
            owned: BTreeMap::new(),
            value_timeout: config.value_timeout.as_millis() as u64,
            max_tables: config.max_tables.max(1),
        }
    }

    /// Checks a table/key pair. `TOTAL_KEY` is only accepted for reads.
    pub fn validate(table: &str, key: &str, read: bool) -> Result<(), DhtError> {
        if table.is_empty() {
            return Err(DhtError::InvalidArgs("empty table name".into()));
        }
        if key.is_empty() {
            return Err(DhtError::InvalidArgs("empty key".into()));
        }
        if !read && key == TOTAL_KEY {
            return Err(DhtError::InvalidArgs(format!("{TOTAL_KEY} is not writable")));
        }
        Ok(())
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Stores a value, replacing any previous one under the same key.
    pub fn update_value(
        &mut self,
        table: &str,
        key: &str,
        value: Bytes,
        now: u64,
    ) -> Result<(), DhtError> {
        Self::validate(table, key, false)?;

        let entry = self
            .tables
            .entry(table.to_string())
            .or_insert_with(|| ValueTable::new(table));
        entry.values.insert(
            key.to_string(),
            ValueEntry {
                value,
                update_time: now,
                key_hash: hash_peerid(key),
            },
        );
        entry.last_update = entry.last_update.max(now);
        Ok(())
    }

    /// Stores a value written by the local peer and remembers it for republishing.
    pub fn save_owned(
        &mut self,
        table: &str,
        key: &str,
        value: Bytes,
        now: u64,
    ) -> Result<(), DhtError> {
        self.update_value(table, key, value.clone(), now)?;
        self.owned
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// A single key, or the whole table for [`TOTAL_KEY`]. `None` when nothing matches.
    pub fn find_value(&self, table: &str, key: &str) -> Option<BTreeMap<String, Bytes>> {
        let entries = &self.tables.get(table)?.values;
        if key == TOTAL_KEY {
            if entries.is_empty() {
                return None;
            }
            return Some(
                entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect(),
            );
        }
        let entry = entries.get(key)?;
        Some(BTreeMap::from([(key.to_string(), entry.value.clone())]))
    }

    /// Removes the local copy and the ownership record. Returns true if
    /// either existed.
    pub fn delete_value(&mut self, table: &str, key: &str) -> bool {
        let mut removed = false;
        if let Some(t) = self.tables.get_mut(table) {
            removed |= t.values.remove(key).is_some();
            if t.values.is_empty() {
                self.tables.remove(table);
            }
        }
        if let Some(owned) = self.owned.get_mut(table) {
            removed |= owned.remove(key).is_some();
            if owned.is_empty() {
                self.owned.remove(table);
            }
        }
        removed
    }

    /// Table names sorted by XOR distance between their hash and `target`.
    pub fn find_closest_values(
        &self,
        target: PeerHash,
        count: usize,
        max_distance: Option<u32>,
    ) -> Vec<&str> {
        let mut names: Vec<(u32, &str)> = self
            .tables
            .iter()
            .map(|(name, t)| (distance(t.hash, target), name.as_str()))
            .filter(|(d, _)| max_distance.map_or(true, |max| *d <= max))
            .collect();
        names.sort();
        names.truncate(count);
        names.into_iter().map(|(_, n)| n).collect()
    }

    /// Values written locally, as `(table, key, value)`.
    pub fn owned_values(&self) -> impl Iterator<Item = (&str, &str, &Bytes)> {
        self.owned.iter().flat_map(|(table, keys)| {
            keys.iter()
                .map(move |(key, value)| (table.as_str(), key.as_str(), value))
        })
    }

    /// Ages out stale data. Returns the number of entries removed.
    ///
    /// Over the table cap, whole stale tables go first, then the least
    /// recently updated ones. After that stale keys are dropped individually.
    pub fn knock_out(&mut self, now: u64) -> usize {
        let timeout = self.value_timeout;
        let is_stale = |time: u64| now.saturating_sub(time) > timeout;
        let mut removed = 0;

        if self.tables.len() > self.max_tables {
            let stale: Vec<String> = self
                .tables
                .iter()
                .filter(|(_, t)| is_stale(t.last_update))
                .map(|(name, _)| name.clone())
                .collect();
            for name in stale {
                if let Some(t) = self.tables.remove(&name) {
                    removed += t.values.len();
                }
            }
        }

        if self.tables.len() > self.max_tables {
            let mut by_age: Vec<(u64, String)> = self
                .tables
                .iter()
                .map(|(name, t)| (t.last_update, name.clone()))
                .collect();
            by_age.sort();
            let excess = self.tables.len() - self.max_tables;
            for (_, name) in by_age.into_iter().take(excess) {
                if let Some(t) = self.tables.remove(&name) {
                    removed += t.values.len();
                }
            }
        }

        self.tables.retain(|_, t| {
            let before = t.values.len();
            t.values.retain(|_, e| !is_stale(e.update_time));
            removed += before - t.values.len();
            !t.values.is_empty()
        });

        if removed > 0 {
            trace!("knocked out {} stale values", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn table(max_tables: usize) -> DistributedValueTable {
        DistributedValueTable::new(&ValueConfig {
            value_timeout: Duration::from_millis(1000),
            max_tables,
            ..Default::default()
        })
    }

    #[test]
    fn test_precise_and_total_lookup() {
        let mut dvt = table(16);
        dvt.update_value("T", "K", Bytes::from_static(b"V"), 1).unwrap();
        dvt.update_value("T", "K2", Bytes::from_static(b"W"), 1).unwrap();

        let one = dvt.find_value("T", "K").unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one["K"], Bytes::from_static(b"V"));

        let all = dvt.find_value("T", TOTAL_KEY).unwrap();
        assert_eq!(all.len(), 2);

        assert!(dvt.find_value("T", "missing").is_none());
        assert!(dvt.find_value("other", TOTAL_KEY).is_none());
    }

    #[test]
    fn test_total_key_not_writable() {
        let mut dvt = table(16);
        assert!(dvt
            .update_value("T", TOTAL_KEY, Bytes::new(), 1)
            .is_err());
        assert!(dvt.update_value("", "k", Bytes::new(), 1).is_err());
        assert!(dvt.update_value("T", "", Bytes::new(), 1).is_err());
    }

    #[test]
    fn test_stale_keys_age_out() {
        let mut dvt = table(16);
        dvt.update_value("T", "old", Bytes::from_static(b"1"), 100).unwrap();
        dvt.update_value("T", "new", Bytes::from_static(b"2"), 900).unwrap();

        assert_eq!(dvt.knock_out(1500), 1);
        assert!(dvt.find_value("T", "old").is_none());
        assert!(dvt.find_value("T", "new").is_some());

        assert_eq!(dvt.knock_out(5000), 1);
        assert!(dvt.is_empty());
    }

    #[test]
    fn test_table_cap_drops_stale_tables_first() {
        let mut dvt = table(2);
        dvt.update_value("stale", "k", Bytes::new(), 10).unwrap();
        dvt.update_value("a", "k", Bytes::new(), 1800).unwrap();
        dvt.update_value("b", "k", Bytes::new(), 1900).unwrap();

        dvt.knock_out(2000);
        assert_eq!(dvt.table_count(), 2);
        assert!(dvt.find_value("stale", "k").is_none());

        dvt.update_value("c", "k", Bytes::new(), 2000).unwrap();
        dvt.knock_out(2000);
        assert_eq!(dvt.table_count(), 2);
        assert!(dvt.find_value("a", "k").is_none());
    }

    #[test]
    fn test_owned_values_and_delete() {
        let mut dvt = table(16);
        dvt.save_owned("T", "K", Bytes::from_static(b"V"), 1).unwrap();
        assert_eq!(dvt.owned_values().count(), 1);

        assert!(dvt.delete_value("T", "K"));
        assert_eq!(dvt.owned_values().count(), 0);
        assert!(dvt.find_value("T", "K").is_none());
        assert!(!dvt.delete_value("T", "K"));
    }

    #[test]
    fn test_closest_tables() {
        let mut dvt = table(64);
        for i in 0..20 {
            dvt.update_value(&format!("t{i}"), "k", Bytes::new(), 1).unwrap();
        }
        let target = hash_peerid("t7");
        let closest = dvt.find_closest_values(target, 5, None);
        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0], "t7");

        let dists: Vec<u32> = closest.iter().map(|n| hash_peerid(n) ^ target).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(dvt.find_closest_values(target, 5, Some(0)), vec!["t7"]);
    }
}
