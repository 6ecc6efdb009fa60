//! Per-session prepared statement cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::types::Oid;

/// Statements are reused only when both the text and the parameter OIDs match:
/// the server fixes parameter types at Parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl StatementKey {
    pub fn new(query: &str, param_types: Vec<Oid>) -> Self {
        Self {
            query: query.to_string(),
            param_types,
        }
    }
}

/// A statement the server has parsed under `name`.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name (e.g., "__binpq_1")
    pub name: String,
    pub key: StatementKey,
}

/// O(1) LRU cache of prepared statements.
///
/// Evicted names are returned to the caller, which owns closing them on the
/// server.
pub struct StatementCache {
    cache: LruCache<StatementKey, Arc<PreparedStatement>>,
    next_id: u32,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, key: &StatementKey) -> Option<Arc<PreparedStatement>> {
        self.cache.get(key).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, key: &StatementKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a statement. Returns the name of the statement evicted to make
    /// room, if any.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<String> {
        let key = statement.key.clone();
        match self.cache.push(key.clone(), statement) {
            Some((evicted_key, evicted)) if evicted_key != key => Some(evicted.name.clone()),
            _ => None,
        }
    }

    /// Generate a unique statement name for this session.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id = self.next_id.wrapping_add(1);
        format!("__binpq_{}", self.next_id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}
