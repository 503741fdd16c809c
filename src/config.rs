use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Storage layout shared by every collaborator. All state lives under a
/// single root: containers in `apps/vx-containers/<uuid>/`, proxy redirects
/// in `proxy/redirects.json`.
#[derive(Debug, Clone)]
pub struct VertexConfig {
    storage_path: PathBuf,
}

impl VertexConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();
        let storage_path = std::path::absolute(&storage_path).unwrap_or(storage_path);
        Self { storage_path }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn containers_path(&self) -> PathBuf {
        self.storage_path.join("apps").join("vx-containers")
    }

    pub fn container_path(&self, uuid: Uuid) -> PathBuf {
        self.containers_path().join(uuid.to_string())
    }

    pub fn proxy_path(&self) -> PathBuf {
        self.storage_path.join("proxy")
    }
}
