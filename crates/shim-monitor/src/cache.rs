//! In-memory index of sandboxes this node currently knows about: which
//! shim socket serves which sandbox id, and the CRI metadata (uid, name,
//! namespace) used to label that sandbox's scraped metrics.

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CriMetadata {
    pub uid: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct SandboxEntry {
    pub socket: PathBuf,
    pub cri: Option<CriMetadata>,
}

#[derive(Default)]
pub struct SandboxCache {
    sandboxes: HashMap<String, SandboxEntry>,
}

impl SandboxCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the filesystem watcher when a shim socket appears.
    pub fn observe_socket(&mut self, sandbox_id: &str, socket: PathBuf) {
        self.sandboxes
            .entry(sandbox_id.to_string())
            .or_insert_with(|| SandboxEntry { socket: socket.clone(), cri: None })
            .socket = socket;
    }

    /// Called by the filesystem watcher when a shim socket disappears.
    pub fn forget_socket(&mut self, sandbox_id: &str) {
        self.sandboxes.remove(sandbox_id);
    }

    /// Called by the CRI refresher once it has fresh pod sandbox metadata.
    pub fn set_cri_metadata(&mut self, sandbox_id: &str, meta: CriMetadata) {
        if let Some(entry) = self.sandboxes.get_mut(sandbox_id) {
            entry.cri = Some(meta);
        }
    }

    pub fn entries(&self) -> Vec<(String, SandboxEntry)> {
        self.sandboxes
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    pub fn get(&self, sandbox_id: &str) -> Option<&SandboxEntry> {
        self.sandboxes.get(sandbox_id)
    }

    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_then_set_metadata_then_forget() {
        let mut cache = SandboxCache::new();
        cache.observe_socket("sbx1", PathBuf::from("kata-shim-sbx1"));
        assert_eq!(cache.len(), 1);

        cache.set_cri_metadata(
            "sbx1",
            CriMetadata {
                uid: "u1".into(),
                name: "pod-1".into(),
                namespace: "default".into(),
            },
        );
        assert_eq!(cache.get("sbx1").unwrap().cri.as_ref().unwrap().name, "pod-1");

        cache.forget_socket("sbx1");
        assert!(cache.is_empty());
    }

    #[test]
    fn metadata_for_unknown_sandbox_is_a_noop() {
        let mut cache = SandboxCache::new();
        cache.set_cri_metadata("missing", CriMetadata::default());
        assert!(cache.is_empty());
    }
}
