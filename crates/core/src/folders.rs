use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::config::DAM_ROOT;

/// Folders known to exist during this run.
///
/// Each folder gets one `OnceCell`; concurrent ensures of the same folder
/// wait on a single create call. A failed create leaves the cell empty so the
/// next task tries again.
#[derive(Debug, Default)]
pub struct FolderRegistry {
    cells: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl FolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cell(&self, folder: &str) -> Arc<OnceCell<()>> {
        let mut cells = self.cells.lock().expect("folder registry mutex poisoned");
        cells
            .entry(folder.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

/// Every folder from the first one below the DAM root down to `destination`.
///
/// `/content` and `/content/dam` always exist and are never returned.
pub fn folder_chain(destination: &str) -> Vec<String> {
    let (mut current, rest) = match destination.strip_prefix(DAM_ROOT) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => (DAM_ROOT.to_string(), rest),
        _ => (String::new(), destination),
    };

    let mut chain = Vec::new();
    for segment in rest.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        chain.push(current.clone());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_starts_below_dam_root() {
        assert_eq!(
            folder_chain("/content/dam/gen/2026/10"),
            vec![
                "/content/dam/gen".to_string(),
                "/content/dam/gen/2026".to_string(),
                "/content/dam/gen/2026/10".to_string(),
            ]
        );
        assert!(folder_chain("/content/dam").is_empty());
        assert!(folder_chain("/content/dam/").is_empty());
    }

    #[test]
    fn chain_outside_dam_covers_every_prefix() {
        assert_eq!(
            folder_chain("/var/seed"),
            vec!["/var".to_string(), "/var/seed".to_string()]
        );
        assert_eq!(
            folder_chain("/content/damage"),
            vec!["/content".to_string(), "/content/damage".to_string()]
        );
    }

    #[tokio::test]
    async fn cells_are_shared_per_folder() {
        let registry = FolderRegistry::new();
        let a1 = registry.cell("/content/dam/a");
        let a2 = registry.cell("/content/dam/a");
        assert!(Arc::ptr_eq(&a1, &a2));

        assert!(!Arc::ptr_eq(&a1, &registry.cell("/content/dam/b")));

        let failed: Result<(), ()> = a1.get_or_try_init(|| async { Err(()) }).await.copied();
        assert!(failed.is_err());
        assert!(!a2.initialized());
        a1.get_or_init(|| async {}).await;
        assert!(a2.initialized());
    }
}
