//! Key-value port shared by the response cache and the budget guard.
//!
//! All breaker and cache state is expressed through four operations so that several
//! invoker instances can share it. No client-side locking happens above this port.

use crate::error::{TaleError, TaleResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// Distributed key-value store consumed by the core.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> TaleResult<Option<String>>;

    /// Store `value`; `ttl = None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaleResult<()>;

    async fn delete(&self, key: &str) -> TaleResult<()>;

    /// Atomically add one and return the new value. A missing or expired counter starts at 1
    /// and gets `ttl`; later increments keep the original expiry (fixed window).
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> TaleResult<i64>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// In-process store. Expiry is lazy and measured on tokio's clock.
#[derive(Debug, Default)]
pub struct MemoryKv {
    slots: DashMap<String, Slot>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| !s.value().expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> TaleResult<Option<String>> {
        let now = Instant::now();
        let found = self.slots.get(key).map(|s| s.value().clone());
        match found {
            Some(slot) if slot.expired(now) => {
                self.slots.remove_if(key, |_, s| s.expired(now));
                Ok(None)
            }
            Some(slot) => Ok(Some(slot.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaleResult<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> TaleResult<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> TaleResult<i64> {
        let now = Instant::now();
        let fresh = || Slot {
            value: "0".to_string(),
            expires_at: ttl.map(|t| now + t),
        };
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(fresh);
        if slot.expired(now) {
            *slot = fresh();
        }
        let next = slot
            .value
            .parse::<i64>()
            .map_err(|e| TaleError::Store(format!("counter {key} is not an integer: {e}")))?
            + 1;
        slot.value = next.to_string();
        Ok(next)
    }
}

const SLED_DEFAULT_PATH: &str = "./data/tale_kv";

#[derive(Serialize, Deserialize)]
struct StoredValue {
    v: String,
    /// Absolute expiry, unix millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

impl StoredValue {
    fn live(&self, now_ms: i64) -> bool {
        self.exp.map_or(true, |exp| now_ms < exp)
    }
}

fn expiry_ms(now_ms: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| now_ms + t.as_millis() as i64)
}

/// Sled-backed durable store for single-node deployments.
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    /// Open the store at `path` (default `./data/tale_kv`).
    pub fn open(path: Option<impl AsRef<Path>>) -> TaleResult<Self> {
        let p = path
            .map(|x| x.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new(SLED_DEFAULT_PATH).to_path_buf());
        let db = sled::open(p)?;
        Ok(Self { db })
    }

    fn decode(bytes: &[u8]) -> TaleResult<StoredValue> {
        serde_json::from_slice(bytes).map_err(|e| TaleError::Store(e.to_string()))
    }
}

#[async_trait]
impl KvStore for SledKv {
    async fn get(&self, key: &str) -> TaleResult<Option<String>> {
        let Some(raw) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        let stored = Self::decode(&raw)?;
        if stored.live(chrono::Utc::now().timestamp_millis()) {
            Ok(Some(stored.v))
        } else {
            self.db.remove(key.as_bytes())?;
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaleResult<()> {
        let stored = StoredValue {
            v: value.to_string(),
            exp: expiry_ms(chrono::Utc::now().timestamp_millis(), ttl),
        };
        let bytes = serde_json::to_vec(&stored).map_err(|e| TaleError::Store(e.to_string()))?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> TaleResult<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> TaleResult<i64> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let updated = self.db.update_and_fetch(key.as_bytes(), |old| {
            let current = old
                .and_then(|raw| serde_json::from_slice::<StoredValue>(raw).ok())
                .filter(|s| s.live(now_ms));
            let next = match current {
                Some(s) => StoredValue {
                    v: (s.v.parse::<i64>().unwrap_or(0) + 1).to_string(),
                    exp: s.exp,
                },
                None => StoredValue {
                    v: "1".to_string(),
                    exp: expiry_ms(now_ms, ttl),
                },
            };
            serde_json::to_vec(&next).ok()
        })?;
        let raw = updated.ok_or_else(|| TaleError::Store(format!("counter {key} vanished")))?;
        Self::decode(&raw)?
            .v
            .parse::<i64>()
            .map_err(|e| TaleError::Store(e.to_string()))
    }
}
