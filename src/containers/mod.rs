mod downloader;
mod env;
mod logs;
mod registry;
mod settings;
mod supervisor;

pub use downloader::{Downloader, InstallSource};
pub use env::EnvStore;
pub use logs::{LogKind, LogLine, LogSink};
pub use registry::Registry;
pub use settings::{ContainerSettings, SettingsStore};
pub use supervisor::Supervisor;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{container_topic, Event, EventBus, TOPIC_CONTAINERS};
use crate::service::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Off,
    Building,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Off => "off",
            ContainerStatus::Building => "building",
            ContainerStatus::Starting => "starting",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopping => "stopping",
            ContainerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    DockerImage,
    Dockerfile,
    Native,
}

impl InstallMethod {
    pub fn is_docker(self) -> bool {
        matches!(self, InstallMethod::DockerImage | InstallMethod::Dockerfile)
    }
}

/// Handle on whatever is actually executing the container. Owned by the
/// runner that started it; released before the status leaves `running`.
pub enum RuntimeHandle {
    Idle,
    Docker {
        id: String,
    },
    Native {
        pid: i32,
        exited: watch::Receiver<bool>,
        cancel: CancellationToken,
    },
}

/// A managed service instance. Shared as `Arc<Container>`; all mutable
/// pieces carry their own lock, and state-changing operations additionally
/// serialize on `ops`.
pub struct Container {
    pub uuid: Uuid,
    /// On-disk root, `<containers>/<uuid>/`. The directory name is the
    /// UUID string.
    pub root: PathBuf,
    pub service: RwLock<Service>,
    pub settings: RwLock<ContainerSettings>,
    pub env: RwLock<BTreeMap<String, String>>,
    pub logs: LogSink,
    pub runtime: Mutex<RuntimeHandle>,
    /// Per-container operation mutex: install/start/stop/uninstall hold it
    /// for their whole duration.
    pub ops: Mutex<()>,
    status: RwLock<ContainerStatus>,
    install_method: RwLock<InstallMethod>,
    update_available: RwLock<bool>,
    bus: EventBus,
}

impl Container {
    pub fn new(
        uuid: Uuid,
        root: PathBuf,
        service: Service,
        settings: ContainerSettings,
        env: BTreeMap<String, String>,
        install_method: InstallMethod,
        bus: EventBus,
    ) -> Self {
        let logs = LogSink::new(uuid, root.join(".vertex").join("logs"), bus.clone());
        Self {
            uuid,
            root,
            service: RwLock::new(service),
            settings: RwLock::new(settings),
            env: RwLock::new(env),
            logs,
            runtime: Mutex::new(RuntimeHandle::Idle),
            ops: Mutex::new(()),
            status: RwLock::new(ContainerStatus::Off),
            install_method: RwLock::new(install_method),
            update_available: RwLock::new(false),
            bus,
        }
    }

    pub async fn status(&self) -> ContainerStatus {
        *self.status.read().await
    }

    /// Publishes the transition on the container topic and mirrors it on
    /// the catalog topic. Same-status writes are suppressed so retries do
    /// not spam subscribers.
    pub async fn set_status(&self, status: ContainerStatus) {
        {
            let mut current = self.status.write().await;
            if *current == status {
                return;
            }
            *current = status;
        }
        let event = Event::StatusChanged {
            uuid: self.uuid,
            status,
        };
        self.bus.publish(&container_topic(self.uuid), event.clone());
        self.bus.publish(TOPIC_CONTAINERS, event);
    }

    pub async fn install_method(&self) -> InstallMethod {
        *self.install_method.read().await
    }

    pub async fn set_install_method(&self, method: InstallMethod) {
        *self.install_method.write().await = method;
    }

    pub async fn update_available(&self) -> bool {
        *self.update_available.read().await
    }

    pub async fn set_update_available(&self, available: bool) {
        *self.update_available.write().await = available;
    }

    pub fn docker_container_name(&self) -> String {
        format!("VERTEX_CONTAINER_{}", self.uuid)
    }

    pub fn docker_image_name(&self) -> String {
        format!("vertex_image_{}", self.uuid)
    }

    pub async fn display_name(&self) -> String {
        let settings = self.settings.read().await;
        match &settings.display_name {
            Some(name) => name.clone(),
            None => self.service.read().await.name.clone(),
        }
    }
}
