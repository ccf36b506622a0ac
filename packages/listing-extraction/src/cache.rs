//! Content-addressed response cache.
//!
//! Keys are SHA-256 digests of the modality tag, the model and the
//! canonicalized input, so identical inputs hit regardless of incidental
//! whitespace. Only idempotent inputs are cacheable: text, and image sets
//! whose every image carries a content digest. Voice is never cached.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::types::field::{normalize_text, Modality};
use crate::types::partial::PartialExtraction;
use crate::types::request::ImageRef;

/// Stable cache key (hex-encoded SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a text input. Whitespace is collapsed and case is kept.
    pub fn for_text(model: &str, text: &str) -> Self {
        let canonical = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Self::digest(Modality::Text, model, [canonical.as_str()])
    }

    /// Key for an ordered image set, or `None` if any image lacks a digest.
    pub fn for_images(model: &str, images: &[ImageRef]) -> Option<Self> {
        let digests = images
            .iter()
            .map(|image| image.content_digest.as_deref().map(normalize_text))
            .collect::<Option<Vec<_>>>()?;
        if digests.is_empty() {
            return None;
        }
        Some(Self::digest(
            Modality::Image,
            model,
            digests.iter().map(String::as_str),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digest<'a>(modality: Modality, model: &str, parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(modality.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache for modality results.
///
/// Implementations must be safe under concurrent reads and writes.
#[async_trait]
pub trait ExtractionCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<PartialExtraction>;

    async fn put(&self, key: CacheKey, value: PartialExtraction, ttl: Duration);
}

struct Entry {
    value: PartialExtraction,
    expires_at: Instant,
    inserted_at: Instant,
}

/// In-process cache with per-entry TTL and a size bound.
///
/// When full, expired entries are purged first, then the oldest entry is
/// evicted.
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ExtractionCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<PartialExtraction> {
        let now = Instant::now();
        {
            let entries = self.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: drop it so it stops counting toward the bound.
        self.write().remove(key);
        None
    }

    async fn put(&self, key: CacheKey, value: PartialExtraction, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.write();

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            entries.retain(|_, entry| entry.expires_at > now);

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    debug!(key = %oldest, "Evicting oldest cache entry");
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                inserted_at: now,
            },
        );
    }
}
