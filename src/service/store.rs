use std::fs;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{Result, VertexError};
use crate::service::Service;

const SERVICE_PATH: &str = ".vertex/service.yml";

/// Reads and writes the per-container service manifest at
/// `<containers>/<uuid>/.vertex/service.yml`.
#[derive(Debug, Clone)]
pub struct ServiceStore {
    containers_path: PathBuf,
}

impl ServiceStore {
    pub fn new(containers_path: impl Into<PathBuf>) -> Self {
        Self {
            containers_path: containers_path.into(),
        }
    }

    fn manifest_path(&self, uuid: Uuid) -> PathBuf {
        self.containers_path.join(uuid.to_string()).join(SERVICE_PATH)
    }

    pub fn load(&self, uuid: Uuid) -> Result<Service> {
        let path = self.manifest_path(uuid);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VertexError::ManifestNotFound(uuid));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_yaml::from_str(&data)?)
    }

    /// The manifest as an untyped document, with fields this build does not
    /// know about preserved.
    pub fn load_raw(&self, uuid: Uuid) -> Result<serde_yaml::Value> {
        let path = self.manifest_path(uuid);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VertexError::ManifestNotFound(uuid));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, uuid: Uuid, service: &Service) -> Result<()> {
        let path = self.manifest_path(uuid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_yaml::to_string(service)?)?;
        Ok(())
    }
}
