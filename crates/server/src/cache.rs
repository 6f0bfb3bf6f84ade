use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::query::CachedQuery;
use crate::store::StoreError;

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

const SONG_PREFIX: &str = "song\x1f";
const QUERY_PREFIX: &str = "query\x1f";
const TAGS_KEY: &str = "tags";

/// Kinds of change an update made, used to decide which cached results to drop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateTypes(u8);

impl UpdateTypes {
    pub const METADATA: UpdateTypes = UpdateTypes(1);
    pub const RATING: UpdateTypes = UpdateTypes(1 << 1);
    pub const TAGS: UpdateTypes = UpdateTypes(1 << 2);
    pub const PLAYS: UpdateTypes = UpdateTypes(1 << 3);

    pub fn contains(self, other: UpdateTypes) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for UpdateTypes {
    type Output = UpdateTypes;

    fn bitor(self, rhs: UpdateTypes) -> UpdateTypes {
        UpdateTypes(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateTypes {
    fn bitor_assign(&mut self, rhs: UpdateTypes) {
        self.0 |= rhs.0;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Song(u64),
    Tags,
    Query(String),
}

impl CacheKey {
    pub fn as_string(&self) -> String {
        match self {
            CacheKey::Song(id) => format!("{}{}", SONG_PREFIX, id),
            CacheKey::Tags => TAGS_KEY.to_string(),
            CacheKey::Query(hash) => format!("{}{}", QUERY_PREFIX, hash),
        }
    }
}

/// One level of the cache. Values are opaque encoded bytes.
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    /// Stores `value` only if nothing is cached under `key`. Returns true if stored.
    fn add_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, CacheError>;
    /// Atomically stores `value` if `key` is absent and evicts it otherwise.
    /// Returns true if the value was stored.
    fn add_or_evict(&self, key: &str, value: &[u8]) -> Result<bool, CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Default)]
pub struct MemoryTier {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn add_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    fn add_or_evict(&self, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// Persistent tier in its own database file, so cache writes never wait on catalog writers.
#[derive(Clone)]
pub struct RedbTier {
    db: Arc<Database>,
}

impl RedbTier {
    pub fn new(db: Arc<Database>) -> Result<Self, CacheError> {
        let write_txn = db.begin_write().map_err(StoreError::from)?;
        {
            let _ = write_txn.open_table(CACHE_TABLE).map_err(StoreError::from)?;
        }
        write_txn.commit().map_err(StoreError::from)?;
        Ok(Self { db })
    }
}

impl CacheTier for RedbTier {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let read_txn = self.db.begin_read().map_err(StoreError::from)?;
        let table = read_txn.open_table(CACHE_TABLE).map_err(StoreError::from)?;
        let value = table
            .get(key)
            .map_err(StoreError::from)?
            .map(|value| value.value().to_vec());
        Ok(value)
    }

    fn add_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        let write_txn = self.db.begin_write().map_err(StoreError::from)?;
        let added = {
            let mut table = write_txn.open_table(CACHE_TABLE).map_err(StoreError::from)?;
            let present = table.get(key).map_err(StoreError::from)?.is_some();
            if !present {
                table.insert(key, value).map_err(StoreError::from)?;
            }
            !present
        };
        write_txn.commit().map_err(StoreError::from)?;
        Ok(added)
    }

    fn add_or_evict(&self, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        let write_txn = self.db.begin_write().map_err(StoreError::from)?;
        let added = {
            let mut table = write_txn.open_table(CACHE_TABLE).map_err(StoreError::from)?;
            let evicted = table.remove(key).map_err(StoreError::from)?.is_some();
            if !evicted {
                table.insert(key, value).map_err(StoreError::from)?;
            }
            !evicted
        };
        write_txn.commit().map_err(StoreError::from)?;
        Ok(added)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let write_txn = self.db.begin_write().map_err(StoreError::from)?;
        {
            let mut table = write_txn.open_table(CACHE_TABLE).map_err(StoreError::from)?;
            table.remove(key).map_err(StoreError::from)?;
        }
        write_txn.commit().map_err(StoreError::from)?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let read_txn = self.db.begin_read().map_err(StoreError::from)?;
        let table = read_txn.open_table(CACHE_TABLE).map_err(StoreError::from)?;
        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(StoreError::from)? {
            let entry = entry.map_err(StoreError::from)?;
            let key = entry.0.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    fn clear(&self) -> Result<(), CacheError> {
        let keys = self.keys_with_prefix("")?;
        let write_txn = self.db.begin_write().map_err(StoreError::from)?;
        {
            let mut table = write_txn.open_table(CACHE_TABLE).map_err(StoreError::from)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(StoreError::from)?;
            }
        }
        write_txn.commit().map_err(StoreError::from)?;
        Ok(())
    }
}

/// Cache levels from fastest to slowest. Failures are logged and treated as misses.
#[derive(Clone)]
pub struct Cache {
    tiers: Vec<Arc<dyn CacheTier>>,
}

impl Cache {
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>) -> Self {
        Self { tiers }
    }

    /// Looks through the tiers in order, copying a hit into the faster tiers it missed.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let key = key.as_string();
        for (index, tier) in self.tiers.iter().enumerate() {
            let bytes = match tier.get(&key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Cache get of {:?} from {} failed: {}", key, tier.name(), err);
                    continue;
                }
            };
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    for faster in &self.tiers[..index] {
                        if let Err(err) = faster.add_if_absent(&key, &bytes) {
                            warn!("Cache fill of {:?} in {} failed: {}", key, faster.name(), err);
                        }
                    }
                    return Some(value);
                }
                Err(err) => {
                    warn!("Dropping undecodable {:?} from {}: {}", key, tier.name(), err);
                    if let Err(err) = tier.delete(&key) {
                        warn!("Cache eviction of {:?} from {} failed: {}", key, tier.name(), err);
                    }
                }
            }
        }
        None
    }

    /// Reader path: store a value that was just loaded, never replacing a newer one.
    pub fn fill<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let Some(bytes) = self.encode(key, value) else {
            return;
        };
        let key = key.as_string();
        for tier in &self.tiers {
            if let Err(err) = tier.add_if_absent(&key, &bytes) {
                warn!("Cache fill of {:?} in {} failed: {}", key, tier.name(), err);
            }
        }
    }

    pub fn evict(&self, key: &CacheKey) {
        let key = key.as_string();
        for tier in &self.tiers {
            if let Err(err) = tier.delete(&key) {
                warn!("Cache eviction of {:?} from {} failed: {}", key, tier.name(), err);
            }
        }
    }

    /// Writer path after commit: store the fresh value unless a reader refilled
    /// the entry meanwhile, in which case drop it.
    pub fn write_after<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let Some(bytes) = self.encode(key, value) else {
            self.evict(key);
            return;
        };
        let key = key.as_string();
        for tier in &self.tiers {
            match tier.add_or_evict(&key, &bytes) {
                Ok(true) => {}
                Ok(false) => debug!("Evicted concurrently cached {:?} from {}", key, tier.name()),
                Err(err) => warn!("Cache write of {:?} to {} failed: {}", key, tier.name(), err),
            }
        }
    }

    /// Drops cached query results the update may have changed, and the tag list
    /// when tags or metadata changed.
    pub fn flush_for_update(&self, updates: UpdateTypes) {
        if updates.is_empty() {
            return;
        }
        for tier in &self.tiers {
            let keys = match tier.keys_with_prefix(QUERY_PREFIX) {
                Ok(keys) => keys,
                Err(err) => {
                    warn!("Listing cached queries in {} failed: {}", tier.name(), err);
                    continue;
                }
            };
            for key in keys {
                let stale = match tier.get(&key) {
                    Ok(Some(bytes)) => serde_json::from_slice::<CachedQuery>(&bytes)
                        .map(|cached| cached.query.results_invalidated(updates))
                        .unwrap_or(true),
                    Ok(None) => false,
                    Err(_) => true,
                };
                if stale {
                    if let Err(err) = tier.delete(&key) {
                        warn!("Cache eviction of {:?} from {} failed: {}", key, tier.name(), err);
                    }
                }
            }
            if updates.contains(UpdateTypes::TAGS) || updates.contains(UpdateTypes::METADATA) {
                if let Err(err) = tier.delete(TAGS_KEY) {
                    warn!("Cache eviction of tags from {} failed: {}", tier.name(), err);
                }
            }
        }
    }

    /// Empties every tier, or only the first when `only_fastest` is set.
    pub fn flush(&self, only_fastest: bool) -> Result<(), CacheError> {
        let count = if only_fastest { 1 } else { self.tiers.len() };
        for tier in self.tiers.iter().take(count) {
            tier.clear()?;
        }
        Ok(())
    }

    fn encode<T: Serialize>(&self, key: &CacheKey, value: &T) -> Option<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("Failed to encode cache value for {:?}: {}", key, err);
                None
            }
        }
    }
}

#[derive(Debug)]
pub enum CacheError {
    Store(StoreError),
    Json(serde_json::Error),
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Store(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json(err)
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Store(err) => write!(f, "cache store error: {}", err),
            CacheError::Json(err) => write!(f, "cache json error: {}", err),
        }
    }
}

impl std::error::Error for CacheError {}
