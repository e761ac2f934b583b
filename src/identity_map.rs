//! Mapping from recorded object ids to live objects
//!
//! One ordered table per [`Category`]. Entries are created only by a
//! successful create-reconciliation and removed only by a destroy
//! reconciliation or end-of-run cleanup; the map itself never talks to the
//! live API or emits warnings, the reconciler does.

use std::collections::BTreeMap;
use crate::error::LiveError;
use crate::live::{AllocationHandle, BufferHandle, DefragContextHandle, ImageHandle, PoolHandle};
use crate::traits::LiveAllocator;
use crate::types::{Category, HandleId};

/// Resource bound to an allocation by a create-buffer/create-image call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

/// A live object owned by an identity map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveObject {
    Pool(PoolHandle),
    Allocation {
        allocation: AllocationHandle,
        resource: Option<BoundResource>,
    },
    DefragmentationContext(DefragContextHandle),
}

impl LiveObject {
    /// Plain allocation without a bound resource
    pub fn allocation(allocation: AllocationHandle) -> Self {
        LiveObject::Allocation {
            allocation,
            resource: None,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            LiveObject::Pool(_) => Category::Pool,
            LiveObject::Allocation { .. } => Category::Allocation,
            LiveObject::DefragmentationContext(_) => Category::DefragmentationContext,
        }
    }

    pub fn as_pool(&self) -> Option<PoolHandle> {
        match self {
            LiveObject::Pool(pool) => Some(*pool),
            _ => None,
        }
    }

    pub fn as_allocation(&self) -> Option<AllocationHandle> {
        match self {
            LiveObject::Allocation { allocation, .. } => Some(*allocation),
            _ => None,
        }
    }

    /// Release the object through the live API.
    ///
    /// Only ending a defragmentation context can fail.
    pub fn destroy<A: LiveAllocator + ?Sized>(self, live: &mut A) -> Result<(), LiveError> {
        match self {
            LiveObject::Pool(pool) => live.destroy_pool(pool),
            LiveObject::Allocation { allocation, resource } => match resource {
                Some(BoundResource::Buffer(buffer)) => live.destroy_buffer(buffer, allocation),
                Some(BoundResource::Image(image)) => live.destroy_image(image, allocation),
                None => live.free_memory(allocation),
            },
            LiveObject::DefragmentationContext(context) => {
                live.defragmentation_end(context)?;
            }
        }
        Ok(())
    }
}

/// Per-category id tables
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    pools: BTreeMap<HandleId, LiveObject>,
    allocations: BTreeMap<HandleId, LiveObject>,
    defragmentation_contexts: BTreeMap<HandleId, LiveObject>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, category: Category) -> &BTreeMap<HandleId, LiveObject> {
        match category {
            Category::Pool => &self.pools,
            Category::Allocation => &self.allocations,
            Category::DefragmentationContext => &self.defragmentation_contexts,
        }
    }

    fn table_mut(&mut self, category: Category) -> &mut BTreeMap<HandleId, LiveObject> {
        match category {
            Category::Pool => &mut self.pools,
            Category::Allocation => &mut self.allocations,
            Category::DefragmentationContext => &mut self.defragmentation_contexts,
        }
    }

    /// Store `object` under `id` in its category, returning whatever the id
    /// held before. The new object always wins.
    pub fn register(&mut self, id: HandleId, object: LiveObject) -> Option<LiveObject> {
        debug_assert!(!id.is_null(), "null ids are never registered");
        self.table_mut(object.category()).insert(id, object)
    }

    pub fn lookup(&self, category: Category, id: HandleId) -> Option<&LiveObject> {
        self.table(category).get(&id)
    }

    pub fn remove(&mut self, category: Category, id: HandleId) -> Option<LiveObject> {
        self.table_mut(category).remove(&id)
    }

    pub fn contains(&self, category: Category, id: HandleId) -> bool {
        self.table(category).contains_key(&id)
    }

    pub fn len(&self, category: Category) -> usize {
        self.table(category).len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
            && self.allocations.is_empty()
            && self.defragmentation_contexts.is_empty()
    }

    pub fn resolve_pool(&self, id: HandleId) -> Option<PoolHandle> {
        self.lookup(Category::Pool, id)?.as_pool()
    }

    pub fn resolve_allocation(&self, id: HandleId) -> Option<AllocationHandle> {
        self.lookup(Category::Allocation, id)?.as_allocation()
    }

    /// Live handles of every registered allocation, in recorded-id order
    pub fn allocation_handles(&self) -> Vec<AllocationHandle> {
        self.allocations.values().filter_map(LiveObject::as_allocation).collect()
    }

    /// Remove every entry, ordered so that dependents go first:
    /// defragmentation contexts, then allocations, then pools.
    pub fn drain(&mut self) -> Vec<(HandleId, LiveObject)> {
        let mut drained = Vec::with_capacity(
            self.pools.len() + self.allocations.len() + self.defragmentation_contexts.len(),
        );
        drained.extend(std::mem::take(&mut self.defragmentation_contexts));
        drained.extend(std::mem::take(&mut self.allocations));
        drained.extend(std::mem::take(&mut self.pools));
        drained
    }
}
