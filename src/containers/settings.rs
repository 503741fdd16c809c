use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::containers::{Container, InstallMethod};
use crate::error::Result;

const SETTINGS_PATH: &str = ".vertex/container_settings.json";

/// User-tunable state persisted alongside the manifest. Everything is
/// optional; a missing file decodes as defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_on_startup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub databases: HashMap<String, Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_method: Option<InstallMethod>,
}

/// Reads and writes `.vertex/container_settings.json`. Setters mutate the
/// in-memory container first, then persist the whole document; a crash
/// between the two is recovered on the next load from disk.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    containers_path: PathBuf,
}

impl SettingsStore {
    pub fn new(containers_path: impl Into<PathBuf>) -> Self {
        Self {
            containers_path: containers_path.into(),
        }
    }

    fn settings_path(&self, uuid: Uuid) -> PathBuf {
        self.containers_path.join(uuid.to_string()).join(SETTINGS_PATH)
    }

    pub fn load(&self, uuid: Uuid) -> Result<ContainerSettings> {
        let path = self.settings_path(uuid);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ContainerSettings::default());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, uuid: Uuid, settings: &ContainerSettings) -> Result<()> {
        let path = self.settings_path(uuid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-to-temp then rename, so a crash never leaves a torn file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    // Setters persist while still holding the settings lock; documents on
    // disk always reflect some serialized order of mutations.

    pub async fn set_launch_on_startup(&self, container: &Container, value: bool) -> Result<()> {
        let mut settings = container.settings.write().await;
        settings.launch_on_startup = Some(value);
        self.save(container.uuid, &settings)
    }

    pub async fn set_display_name(&self, container: &Container, value: String) -> Result<()> {
        let mut settings = container.settings.write().await;
        settings.display_name = Some(value);
        self.save(container.uuid, &settings)
    }

    pub async fn set_tags(&self, container: &Container, tags: Vec<String>) -> Result<()> {
        let mut settings = container.settings.write().await;
        settings.tags = tags;
        self.save(container.uuid, &settings)
    }

    pub async fn set_databases(
        &self,
        container: &Container,
        databases: HashMap<String, Uuid>,
    ) -> Result<()> {
        let mut settings = container.settings.write().await;
        settings.databases = databases;
        self.save(container.uuid, &settings)
    }

    pub async fn set_version(&self, container: &Container, version: String) -> Result<()> {
        let mut settings = container.settings.write().await;
        settings.version = Some(version);
        self.save(container.uuid, &settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::service::Service;
    use std::collections::BTreeMap;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        (dir, store)
    }

    fn container_for(store: &SettingsStore) -> Container {
        let uuid = Uuid::new_v4();
        Container::new(
            uuid,
            store.containers_path.join(uuid.to_string()),
            Service::default(),
            ContainerSettings::default(),
            BTreeMap::new(),
            InstallMethod::Native,
            EventBus::new(),
        )
    }

    #[test]
    fn missing_file_loads_defaults() {
        let (_dir, store) = store();
        let settings = store.load(Uuid::new_v4()).unwrap();
        assert_eq!(settings, ContainerSettings::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let uuid = Uuid::new_v4();
        let mut databases = HashMap::new();
        databases.insert("postgres".to_string(), Uuid::new_v4());

        let settings = ContainerSettings {
            display_name: Some("My App".to_string()),
            launch_on_startup: Some(true),
            version: Some("v1.2.3".to_string()),
            tags: vec!["web".to_string()],
            databases,
            install_method: Some(InstallMethod::Dockerfile),
        };

        store.save(uuid, &settings).unwrap();
        assert_eq!(store.load(uuid).unwrap(), settings);
    }

    #[test]
    fn json_encode_is_idempotent() {
        let settings = ContainerSettings {
            display_name: Some("App".to_string()),
            launch_on_startup: Some(false),
            install_method: Some(InstallMethod::Native),
            ..Default::default()
        };

        let once = serde_json::to_string(&settings).unwrap();
        let decoded: ContainerSettings = serde_json::from_str(&once).unwrap();
        let twice = serde_json::to_string(&decoded).unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn set_launch_on_startup_persists_and_reloads() {
        let (_dir, store) = store();
        let container = container_for(&store);

        store.set_launch_on_startup(&container, true).await.unwrap();

        assert_eq!(
            container.settings.read().await.launch_on_startup,
            Some(true)
        );
        assert_eq!(
            store.load(container.uuid).unwrap().launch_on_startup,
            Some(true)
        );
    }

    #[tokio::test]
    async fn set_display_name_persists_and_reloads() {
        let (_dir, store) = store();
        let container = container_for(&store);

        store
            .set_display_name(&container, "Renamed".to_string())
            .await
            .unwrap();

        assert_eq!(
            container.settings.read().await.display_name.as_deref(),
            Some("Renamed")
        );
        assert_eq!(
            store.load(container.uuid).unwrap().display_name.as_deref(),
            Some("Renamed")
        );
    }

    #[tokio::test]
    async fn set_tags_persists_and_reloads() {
        let (_dir, store) = store();
        let container = container_for(&store);
        let tags = vec!["web".to_string(), "db".to_string()];

        store.set_tags(&container, tags.clone()).await.unwrap();

        assert_eq!(container.settings.read().await.tags, tags);
        assert_eq!(store.load(container.uuid).unwrap().tags, tags);
    }

    #[tokio::test]
    async fn set_databases_persists_and_reloads() {
        let (_dir, store) = store();
        let container = container_for(&store);
        let mut databases = HashMap::new();
        databases.insert("postgres".to_string(), Uuid::new_v4());

        store
            .set_databases(&container, databases.clone())
            .await
            .unwrap();

        assert_eq!(container.settings.read().await.databases, databases);
        assert_eq!(store.load(container.uuid).unwrap().databases, databases);
    }

    #[tokio::test]
    async fn set_version_persists_and_reloads() {
        let (_dir, store) = store();
        let container = container_for(&store);

        store
            .set_version(&container, "v2.0.1".to_string())
            .await
            .unwrap();

        assert_eq!(
            container.settings.read().await.version.as_deref(),
            Some("v2.0.1")
        );
        assert_eq!(
            store.load(container.uuid).unwrap().version.as_deref(),
            Some("v2.0.1")
        );
    }

    #[tokio::test]
    async fn successive_setters_accumulate_in_the_document() {
        let (_dir, store) = store();
        let container = container_for(&store);

        store
            .set_display_name(&container, "App".to_string())
            .await
            .unwrap();
        store.set_launch_on_startup(&container, true).await.unwrap();
        store
            .set_tags(&container, vec!["web".to_string()])
            .await
            .unwrap();

        let loaded = store.load(container.uuid).unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("App"));
        assert_eq!(loaded.launch_on_startup, Some(true));
        assert_eq!(loaded.tags, vec!["web".to_string()]);
    }

    #[test]
    fn no_leftover_temp_file_after_save() {
        let (_dir, store) = store();
        let uuid = Uuid::new_v4();
        store.save(uuid, &ContainerSettings::default()).unwrap();

        let tmp = store.settings_path(uuid).with_extension("json.tmp");
        assert!(!tmp.exists());
    }
}
