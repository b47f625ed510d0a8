//! UE Context Store
//!
//! Keyed collections mapping every UE identity to one UE context. All indices
//! live behind a single `RwLock` so a lookup never observes a half-applied
//! re-key. Each context sits behind its own `Mutex`.
//!
//! Lock order: a caller may hold a UE `Mutex` and then take the store lock
//! (`update_keys`, `remove`). Lookups release the store lock before the caller
//! locks the returned context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bearer;
use crate::context::{EnbUeKey, EpsGuti, MmeUeS1apId, UeContext, INVALID_MME_UE_S1AP_ID};
use crate::error::StoreError;

/// Shared reference to a UE context
pub type UeRef = Arc<Mutex<UeContext>>;

/// Lock a UE context, recovering from a poisoned mutex
pub fn lock_ue(ue: &UeRef) -> MutexGuard<'_, UeContext> {
    ue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The full key set of a context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeKeys {
    pub enb_ue_key: Option<EnbUeKey>,
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub imsi: Option<String>,
    pub mme_s11_teid: u32,
    pub guti: Option<EpsGuti>,
}

impl UeKeys {
    pub fn of(ue: &UeContext) -> Self {
        Self {
            enb_ue_key: ue.enb_ue_key,
            mme_ue_s1ap_id: ue.mme_ue_s1ap_id,
            imsi: ue.imsi.clone(),
            mme_s11_teid: ue.mme_s11_teid,
            guti: ue.guti,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    contexts: HashMap<MmeUeS1apId, UeRef>,
    by_enb_ue_key: HashMap<EnbUeKey, MmeUeS1apId>,
    by_imsi: HashMap<String, MmeUeS1apId>,
    by_s11_teid: HashMap<u32, MmeUeS1apId>,
    by_guti: HashMap<EpsGuti, MmeUeS1apId>,
}

impl StoreInner {
    /// Check that `keys` can be bound to `owner` without displacing another context
    fn check_free(&self, keys: &UeKeys, owner: Option<MmeUeS1apId>) -> Result<(), StoreError> {
        let conflicts = |bound: Option<&MmeUeS1apId>| match bound {
            Some(id) => owner != Some(*id),
            None => false,
        };

        if keys.mme_ue_s1ap_id == INVALID_MME_UE_S1AP_ID {
            return Err(StoreError::DuplicateKey("invalid mme_ue_s1ap_id".to_string()));
        }
        if owner != Some(keys.mme_ue_s1ap_id) && self.contexts.contains_key(&keys.mme_ue_s1ap_id) {
            return Err(StoreError::DuplicateKey(format!(
                "mme_ue_s1ap_id {}",
                keys.mme_ue_s1ap_id
            )));
        }
        if let Some(key) = &keys.enb_ue_key {
            if conflicts(self.by_enb_ue_key.get(key)) {
                return Err(StoreError::DuplicateKey(key.to_string()));
            }
        }
        if let Some(imsi) = &keys.imsi {
            if conflicts(self.by_imsi.get(imsi)) {
                return Err(StoreError::DuplicateKey(format!("imsi {}", imsi)));
            }
        }
        if keys.mme_s11_teid != 0 && conflicts(self.by_s11_teid.get(&keys.mme_s11_teid)) {
            return Err(StoreError::DuplicateKey(format!("s11 teid {:#x}", keys.mme_s11_teid)));
        }
        if let Some(guti) = &keys.guti {
            if conflicts(self.by_guti.get(guti)) {
                return Err(StoreError::DuplicateKey(format!("guti {}", guti)));
            }
        }
        Ok(())
    }

    fn unbind(&mut self, keys: &UeKeys) {
        if let Some(key) = &keys.enb_ue_key {
            self.by_enb_ue_key.remove(key);
        }
        if let Some(imsi) = &keys.imsi {
            self.by_imsi.remove(imsi);
        }
        if keys.mme_s11_teid != 0 {
            self.by_s11_teid.remove(&keys.mme_s11_teid);
        }
        if let Some(guti) = &keys.guti {
            self.by_guti.remove(guti);
        }
    }

    fn bind(&mut self, keys: &UeKeys) {
        let id = keys.mme_ue_s1ap_id;
        if let Some(key) = keys.enb_ue_key {
            self.by_enb_ue_key.insert(key, id);
        }
        if let Some(imsi) = &keys.imsi {
            self.by_imsi.insert(imsi.clone(), id);
        }
        if keys.mme_s11_teid != 0 {
            self.by_s11_teid.insert(keys.mme_s11_teid, id);
        }
        if let Some(guti) = keys.guti {
            self.by_guti.insert(guti, id);
        }
    }

    fn resolve(&self, id: Option<&MmeUeS1apId>) -> Option<UeRef> {
        id.and_then(|id| self.contexts.get(id)).cloned()
    }
}

/// UE Context Store
pub struct UeContextStore {
    inner: RwLock<StoreInner>,
    next_mme_ue_s1ap_id: AtomicU32,
}

impl UeContextStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            next_mme_ue_s1ap_id: AtomicU32::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A zeroed context with no MME-UE-S1AP-ID
    pub fn create_context(&self) -> UeContext {
        UeContext::default()
    }

    /// Next free MME-UE-S1AP-ID, skipping the invalid value and ids still bound
    pub fn allocate_mme_ue_s1ap_id(&self) -> MmeUeS1apId {
        let inner = self.read();
        loop {
            let id = self.next_mme_ue_s1ap_id.fetch_add(1, Ordering::SeqCst);
            if id != INVALID_MME_UE_S1AP_ID && !inner.contexts.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a context under its MME-UE-S1AP-ID and every secondary key it carries
    pub fn insert(&self, mut ue: UeContext) -> Result<UeRef, StoreError> {
        let keys = UeKeys::of(&ue);
        let mut inner = self.write();
        inner.check_free(&keys, None)?;

        ue.indexed = true;
        let id = keys.mme_ue_s1ap_id;
        let ue_ref = Arc::new(Mutex::new(ue));
        inner.contexts.insert(id, ue_ref.clone());
        inner.bind(&keys);
        log::debug!("[{}] UE context added (total {})", id, inner.contexts.len());
        Ok(ue_ref)
    }

    pub fn lookup_by_local_ref(&self, id: MmeUeS1apId) -> Option<UeRef> {
        self.read().contexts.get(&id).cloned()
    }

    pub fn lookup_by_enb_ue_key(&self, key: &EnbUeKey) -> Option<UeRef> {
        let inner = self.read();
        inner.resolve(inner.by_enb_ue_key.get(key))
    }

    pub fn lookup_by_subscriber_id(&self, imsi: &str) -> Option<UeRef> {
        let inner = self.read();
        inner.resolve(inner.by_imsi.get(imsi))
    }

    pub fn lookup_by_tunnel_id(&self, teid: u32) -> Option<UeRef> {
        let inner = self.read();
        inner.resolve(inner.by_s11_teid.get(&teid))
    }

    pub fn lookup_by_temporary_id(&self, guti: &EpsGuti) -> Option<UeRef> {
        let inner = self.read();
        inner.resolve(inner.by_guti.get(guti))
    }

    /// Re-index `ue` under `keys` atomically.
    ///
    /// Any key bound to a different context fails with `DuplicateKey` and
    /// leaves both the store and the context untouched.
    pub fn update_keys(&self, ue: &mut UeContext, keys: UeKeys) -> Result<(), StoreError> {
        let old = UeKeys::of(ue);
        if !ue.indexed {
            ue.enb_ue_key = keys.enb_ue_key;
            ue.mme_ue_s1ap_id = keys.mme_ue_s1ap_id;
            ue.imsi = keys.imsi;
            ue.mme_s11_teid = keys.mme_s11_teid;
            ue.guti = keys.guti;
            return Ok(());
        }

        let mut inner = self.write();
        inner.check_free(&keys, Some(old.mme_ue_s1ap_id))?;

        inner.unbind(&old);
        if keys.mme_ue_s1ap_id != old.mme_ue_s1ap_id {
            if let Some(ue_ref) = inner.contexts.remove(&old.mme_ue_s1ap_id) {
                inner.contexts.insert(keys.mme_ue_s1ap_id, ue_ref);
            }
        }
        inner.bind(&keys);

        ue.enb_ue_key = keys.enb_ue_key;
        ue.mme_ue_s1ap_id = keys.mme_ue_s1ap_id;
        ue.imsi = keys.imsi;
        ue.mme_s11_teid = keys.mme_s11_teid;
        ue.guti = keys.guti;
        Ok(())
    }

    /// Remove a context from every index and release everything it owns.
    /// Returns false if the context was already removed.
    pub fn remove(&self, ue: &mut UeContext) -> bool {
        if !ue.indexed {
            return false;
        }
        let keys = UeKeys::of(ue);
        {
            let mut inner = self.write();
            inner.unbind(&keys);
            inner.contexts.remove(&keys.mme_ue_s1ap_id);
            log::debug!(
                "[{}] UE context removed (total {})",
                keys.mme_ue_s1ap_id,
                inner.contexts.len()
            );
        }
        ue.indexed = false;

        ue.timers.stop_all();
        ue.abort_all_procedures();
        bearer::free_all(ue);
        true
    }

    pub fn len(&self) -> usize {
        self.read().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().contexts.is_empty()
    }

    pub fn iter_ids(&self) -> Vec<MmeUeS1apId> {
        let mut ids: Vec<_> = self.read().contexts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for UeContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UeContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UeContextStore").field("len", &self.len()).finish()
    }
}
