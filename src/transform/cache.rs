//! Cache of instrumented scripts keyed by content hash.
//!
//! Plugin sources rarely change between jobs, so the orchestrator transforms
//! each (budget, source) pair once and shares the result. Because the
//! transformation is deterministic, a cached entry is indistinguishable from
//! a fresh one.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::error::TransformError;
use crate::metrics;

use super::{CodeTransformer, CompiledScript};

/// SHA-256 of a script, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hash of a source under a given budget; the budget is part of the
    /// instrumented output, so it is part of the key.
    pub fn for_script(source: &str, budget: Duration) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(budget.as_millis().to_le_bytes());
        hasher.update(source.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct CacheEntry {
    script: Arc<CompiledScript>,
    last_accessed: Instant,
}

/// Hit/miss counters for a [`TransformCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe LRU cache of [`CompiledScript`]s.
///
/// Transform errors are not cached; a broken plugin is re-parsed for each
/// job that references it, which keeps the error position in every report.
pub struct TransformCache {
    entries: RwLock<HashMap<ContentHash, CacheEntry>>,
    stats: RwLock<CacheStats>,
    max_entries: usize,
}

impl TransformCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the instrumented script for `source`, transforming it on a miss.
    pub fn get_or_transform(
        &self,
        transformer: &CodeTransformer,
        source: &str,
    ) -> Result<Arc<CompiledScript>, TransformError> {
        let hash = ContentHash::for_script(source, transformer.budget());

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get_mut(&hash) {
                entry.last_accessed = Instant::now();
                let script = Arc::clone(&entry.script);
                drop(entries);
                self.stats.write().unwrap_or_else(PoisonError::into_inner).hits += 1;
                metrics::record_transform_cache(true);
                return Ok(script);
            }
        }

        let script = Arc::new(transformer.compile(source)?);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.max_entries && !entries.contains_key(&hash) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(hash, _)| hash.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                stats.evictions += 1;
            }
        }
        entries.insert(
            hash,
            CacheEntry {
                script: Arc::clone(&script),
                last_accessed: Instant::now(),
            },
        );
        stats.misses += 1;
        metrics::record_transform_cache(false);
        Ok(script)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = *self.stats.read().unwrap_or_else(PoisonError::into_inner);
        stats.entries = self.len();
        stats
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for TransformCache {
    fn default() -> Self {
        Self::new(256)
    }
}
