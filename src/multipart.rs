//! Multipart Upload Registry: maps a gateway-minted logical upload id to the
//! ordered pair of backend upload ids it resolves to on each replica.
//!
//! Purely process-local state. Callers are responsible for holding the
//! upload-id namespace lock around any read-modify-write sequence; the
//! registry itself only guarantees that concurrent accesses don't corrupt
//! its own map.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ids::UploadId;

#[derive(Default)]
pub struct MultipartRegistry {
    entries: Mutex<HashMap<UploadId, Vec<String>>>,
}

impl MultipartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly minted logical upload id against its backend
    /// upload ids, one per replica index, in order.
    pub fn insert(&self, id: UploadId, backend_upload_ids: Vec<String>) {
        self.entries.lock().insert(id, backend_upload_ids);
    }

    pub fn get(&self, id: &UploadId) -> Option<Vec<String>> {
        self.entries.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &UploadId) -> Option<Vec<String>> {
        self.entries.lock().remove(id)
    }

    pub fn contains(&self, id: &UploadId) -> bool {
        self.entries.lock().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = MultipartRegistry::new();
        let id = UploadId::new();
        registry.insert(id.clone(), vec!["back-0".into(), "back-1".into()]);
        assert_eq!(registry.get(&id), Some(vec!["back-0".into(), "back-1".into()]));
    }

    #[test]
    fn remove_deletes_entry() {
        let registry = MultipartRegistry::new();
        let id = UploadId::new();
        registry.insert(id.clone(), vec!["back-0".into(), "back-1".into()]);
        assert_eq!(registry.remove(&id), Some(vec!["back-0".into(), "back-1".into()]));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn unknown_id_is_absent() {
        let registry = MultipartRegistry::new();
        assert_eq!(registry.get(&UploadId::new()), None);
    }
}
