//! Name-keyed side-table of weak buffer references.
//!
//! Long-running acquisition loops reuse named buffers instead of
//! reallocating every iteration. The registry never extends a buffer's
//! lifetime: entries hold `Weak` references, expiration is simply the
//! strong count dropping to zero, and an expired lookup is the normal
//! "miss, please recreate" path — not an error.
//!
//! Keys are arbitrary caller-chosen strings with no enforced namespacing;
//! collisions silently overwrite.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::RclResult;

type Entry = Weak<dyn Any + Send + Sync>;

/// Process-wide name → weak-reference map for buffer reuse.
///
/// One registry serves buffers of any element type; a lookup under the
/// wrong type is treated as a miss.
#[derive(Default)]
pub struct BufferRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a weak reference under `name`, overwriting any previous entry.
    pub fn register<B: Any + Send + Sync>(&self, name: &str, buffer: &Arc<B>) {
        let as_any: Arc<dyn Any + Send + Sync> = Arc::clone(buffer) as _;
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::downgrade(&as_any));
    }

    /// Fetch a strong reference if the entry is still alive and of type `B`.
    pub fn get<B: Any + Send + Sync>(&self, name: &str) -> Option<Arc<B>> {
        let weak = self.entries.lock().unwrap().get(name)?.clone();
        weak.upgrade()?.downcast::<B>().ok()
    }

    /// Fetch `name`, creating and registering through `create` on a miss.
    ///
    /// The creation itself runs outside the registry lock (it is typically
    /// a device allocation); if another caller registered a live entry in
    /// the meantime, that entry wins and the fresh buffer is dropped.
    pub fn get_or_create<B, F>(&self, name: &str, create: F) -> RclResult<Arc<B>>
    where
        B: Any + Send + Sync,
        F: FnOnce() -> RclResult<Arc<B>>,
    {
        if let Some(existing) = self.get::<B>(name) {
            return Ok(existing);
        }
        let fresh = create()?;
        let mut entries = self.entries.lock().unwrap();
        if let Some(raced) = entries
            .get(name)
            .and_then(|w| w.upgrade())
            .and_then(|a| a.downcast::<B>().ok())
        {
            return Ok(raced);
        }
        let as_any: Arc<dyn Any + Send + Sync> = Arc::clone(&fresh) as _;
        entries.insert(name.to_string(), Arc::downgrade(&as_any));
        Ok(fresh)
    }

    /// Sweep entries whose referent has been dropped; returns how many
    /// were removed. Safe at any cadence; purely bookkeeping.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, weak| weak.strong_count() > 0);
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("buffer registry: swept {removed} expired entries");
        }
        removed
    }

    /// Number of entries, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
