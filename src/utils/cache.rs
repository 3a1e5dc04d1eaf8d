//! Read-through identity cache

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::traits::*;
use crate::types::*;

/// Caches identity lookups in front of an [`IdentitySource`].
///
/// Misses fall through to the source; negative results are not cached. When
/// the cache is full it is emptied before the next insert.
pub struct IdentityCache<S: IdentitySource> {
    source: S,
    entries: RwLock<HashMap<Uuid, Identity>>,
    capacity: usize,
}

impl<S: IdentitySource> IdentityCache<S> {
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl<S: IdentitySource> IdentityDirectory for IdentityCache<S> {
    async fn lookup(&self, id: Uuid) -> VoucherResult<Option<Identity>> {
        let cached = self.entries.read().get(&id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let fetched = self.source.fetch_identity(id).await?;
        if let Some(identity) = &fetched {
            let mut entries = self.entries.write();
            if entries.len() >= self.capacity {
                entries.clear();
            }
            entries.insert(id, identity.clone());
        }
        Ok(fetched)
    }

    fn invalidate(&self, id: Uuid) {
        self.entries.write().remove(&id);
    }
}
