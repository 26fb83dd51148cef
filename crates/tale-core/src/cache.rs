//! Response cache over the key-value port.
//!
//! Keys are a fast 32-bit rolling hash of the prompt text namespaced by operation
//! (`story_<hash>`). Colliding prompts share a slot; this is an accepted approximation.
//! Cache trouble is logged and treated as a miss.

use crate::kv::KvStore;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default write-through TTL for successful invocations.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Rolling `h * 31 + c` hash over UTF-16 code units, wrapping at 32 bits.
pub fn prompt_hash(text: &str) -> i32 {
    text.encode_utf16().fold(0i32, |h, c| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(c))
    })
}

/// Cache key for a logical operation and its prompt, e.g. `story_1234`.
pub fn cache_key(operation: &str, prompt: &str) -> String {
    format!("{}_{}", operation, prompt_hash(prompt).unsigned_abs())
}

#[derive(Clone)]
pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    namespace: String,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
        }
    }

    fn slot(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(&self.slot(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(target: "tale::cache", key, "cache read failed: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(v) => {
                debug!(target: "tale::cache", key, "cache hit");
                Some(v)
            }
            Err(e) => {
                warn!(target: "tale::cache", key, "discarding undecodable cache entry: {}", e);
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target: "tale::cache", key, "cache encode failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.kv.set(&self.slot(key), &raw, Some(ttl)).await {
            warn!(target: "tale::cache", key, "cache write failed: {}", e);
        }
    }
}
