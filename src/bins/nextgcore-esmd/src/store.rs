//! ESM Session Store
//!
//! Ordered index of per-UE ESM contexts. Each context sits behind its own
//! mutex so that events for one UE are serialised while different UEs are
//! served in parallel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::{EsmContext, MmeUeS1apId};
use crate::error::EsmError;

/// Shared handle on one UE's ESM context
pub type SessionHandle = Arc<Mutex<EsmContext>>;

/// Lock a session for the duration of one event
pub fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, EsmContext> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Insertion collision; carries the session already stored
#[derive(Clone)]
pub struct DuplicateSubscriber {
    pub ue_id: MmeUeS1apId,
    pub existing: SessionHandle,
}

impl fmt::Debug for DuplicateSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicateSubscriber")
            .field("ue_id", &self.ue_id)
            .finish_non_exhaustive()
    }
}

impl From<DuplicateSubscriber> for EsmError {
    fn from(dup: DuplicateSubscriber) -> Self {
        EsmError::DuplicateSubscriber(dup.ue_id)
    }
}

/// Session Context Store
#[derive(Default)]
pub struct SessionStore {
    contexts: RwLock<BTreeMap<MmeUeS1apId, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<MmeUeS1apId, SessionHandle>> {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<MmeUeS1apId, SessionHandle>> {
        self.contexts.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the ESM context of a UE
    pub fn get(&self, ue_id: MmeUeS1apId) -> Option<SessionHandle> {
        self.read().get(&ue_id).cloned()
    }

    /// Add a new ESM context. An existing entry for the same UE is never
    /// overwritten.
    pub fn insert(&self, ctx: EsmContext) -> Result<SessionHandle, DuplicateSubscriber> {
        let ue_id = ctx.ue_id();
        let mut contexts = self.write();

        if let Some(existing) = contexts.get(&ue_id) {
            log::warn!("ESM context already exists (ue_id={})", ue_id);
            return Err(DuplicateSubscriber {
                ue_id,
                existing: existing.clone(),
            });
        }

        let handle = Arc::new(Mutex::new(ctx));
        contexts.insert(ue_id, handle.clone());
        log::debug!("ESM context added (ue_id={}, total={})", ue_id, contexts.len());
        Ok(handle)
    }

    /// Get the context of a UE, creating it with `create` if absent
    pub fn get_or_create(&self, ue_id: MmeUeS1apId, create: impl FnOnce() -> EsmContext) -> SessionHandle {
        let mut contexts = self.write();
        contexts
            .entry(ue_id)
            .or_insert_with(|| {
                log::debug!("ESM context created (ue_id={})", ue_id);
                Arc::new(Mutex::new(create()))
            })
            .clone()
    }

    /// Detach a context from the store. The caller releases its timers and
    /// PDN connections.
    pub fn remove(&self, ue_id: MmeUeS1apId) -> Option<SessionHandle> {
        let removed = self.write().remove(&ue_id);
        if removed.is_some() {
            log::debug!("ESM context removed (ue_id={})", ue_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// UE identifiers in ascending order
    pub fn ue_ids(&self) -> Vec<MmeUeS1apId> {
        self.read().keys().copied().collect()
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_and_get() {
        let store = SessionStore::new();
        assert!(store.is_empty());
        assert!(store.get(1).is_none());

        store.insert(EsmContext::new(1, 4)).unwrap();
        let handle = store.get(1).unwrap();
        assert_eq!(lock_session(&handle).ue_id(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insert_duplicate_keeps_existing() {
        let store = SessionStore::new();
        let original = store.insert(EsmContext::new(7, 4)).unwrap();
        lock_session(&original).is_emergency = true;

        let dup = store.insert(EsmContext::new(7, 2)).unwrap_err();
        assert_eq!(dup.ue_id, 7);
        assert!(Arc::ptr_eq(&dup.existing, &original));
        assert!(lock_session(&store.get(7).unwrap()).is_emergency());
        assert_eq!(lock_session(&original).max_pdn_connections(), 4);

        let err: EsmError = dup.into();
        assert_eq!(err, EsmError::DuplicateSubscriber(7));
    }

    #[test]
    fn test_remove() {
        let store = SessionStore::new();
        store.insert(EsmContext::new(3, 4)).unwrap();

        let removed = store.remove(3).unwrap();
        assert_eq!(lock_session(&removed).ue_id(), 3);
        assert!(store.get(3).is_none());
        assert!(store.remove(3).is_none());
    }

    #[test]
    fn test_ue_ids_ordered() {
        let store = SessionStore::new();
        for ue_id in [30, 10, 20] {
            store.insert(EsmContext::new(ue_id, 4)).unwrap();
        }
        assert_eq!(store.ue_ids(), vec![10, 20, 30]);
    }

    #[test]
    fn test_get_or_create() {
        let store = SessionStore::new();
        let a = store.get_or_create(5, || EsmContext::new(5, 4));
        let b = store.get_or_create(5, || EsmContext::new(5, 1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(lock_session(&b).max_pdn_connections(), 4);
    }

    #[test]
    fn test_concurrent_insert_distinct_keys() {
        let store = Arc::new(SessionStore::new());
        let handles: Vec<_> = (1..=8)
            .map(|ue_id| {
                let store = store.clone();
                thread::spawn(move || {
                    store.insert(EsmContext::new(ue_id, 4)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
        assert_eq!(store.ue_ids(), (1..=8).collect::<Vec<_>>());
    }
}
