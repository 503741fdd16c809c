use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::VertexConfig;
use crate::containers::{
    Container, ContainerStatus, Downloader, EnvStore, InstallMethod, InstallSource, Registry,
    RuntimeHandle, SettingsStore,
};
use crate::error::{Result, VertexError};
use crate::events::EventBus;
use crate::runner::{DockerInfo, DockerRunner, NativeRunner};
use crate::service::{Service, ServiceStore, MAX_SUPPORTED_VERSION};

/// Orchestrates install → start → stop → uninstall across the two runners.
/// Owns the state-machine transitions; every state-changing operation holds
/// the container's op mutex for its whole duration.
pub struct Supervisor {
    config: VertexConfig,
    registry: Arc<Registry>,
    services: ServiceStore,
    settings: SettingsStore,
    envs: EnvStore,
    downloader: Downloader,
    docker: DockerRunner,
    native: NativeRunner,
    bus: EventBus,
}

impl Supervisor {
    pub fn new(config: VertexConfig, registry: Arc<Registry>, bus: EventBus) -> Result<Self> {
        let containers_path = config.containers_path();
        std::fs::create_dir_all(&containers_path)?;

        Ok(Self {
            services: ServiceStore::new(&containers_path),
            settings: SettingsStore::new(&containers_path),
            envs: EnvStore::new(&containers_path),
            downloader: Downloader::new(),
            docker: DockerRunner::new()?,
            native: NativeRunner::new(),
            config,
            registry,
            bus,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings_store(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn service_store(&self) -> &ServiceStore {
        &self.services
    }

    /// Scans the storage root and loads every directory or symlink whose
    /// name parses as a UUID. Per-entry failures are logged and skipped;
    /// only an unreadable root is fatal.
    pub async fn load_all(&self) -> Result<()> {
        let entries = std::fs::read_dir(self.config.containers_path())?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("unreadable entry in storage root: {err}");
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(err) => {
                    warn!("cannot stat {:?}: {err}", entry.file_name());
                    continue;
                }
            };
            if !file_type.is_dir() && !file_type.is_symlink() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let uuid = match Uuid::parse_str(&name) {
                Ok(uuid) => uuid,
                Err(_) => {
                    warn!(name, "not a container directory, skipping");
                    continue;
                }
            };

            info!(container = %uuid, "found container");
            if let Err(err) = self.load(uuid).await {
                error!(container = %uuid, "failed to load container: {err}");
            }
        }
        Ok(())
    }

    /// Builds a container from its on-disk state and registers it.
    pub async fn load(&self, uuid: Uuid) -> Result<Arc<Container>> {
        let service = self.services.load(uuid)?;
        service.validate();

        let mut settings = self.settings.load(uuid)?;
        if settings.display_name.is_none() {
            settings.display_name = Some(service.name.clone());
        }

        let mut env = match self.envs.load(uuid) {
            Ok(env) => env,
            Err(err @ VertexError::MalformedEnv(_)) => {
                warn!(container = %uuid, "{err}; starting with an empty environment");
                BTreeMap::new()
            }
            Err(err) => return Err(err),
        };
        // Keys are the union of manifest-declared and previously persisted
        // variables; unknown persisted keys are never dropped.
        for def in &service.env_definitions {
            if !env.contains_key(&def.name) {
                env.insert(def.name.clone(), def.default.clone().unwrap_or_default());
            }
        }

        let install_method = settings
            .install_method
            .unwrap_or_else(|| default_install_method(&service));

        let container = Arc::new(Container::new(
            uuid,
            self.config.container_path(uuid),
            service,
            settings,
            env,
            install_method,
            self.bus.clone(),
        ));
        self.registry.set(container.clone()).await?;
        Ok(container)
    }

    /// Materializes a repository source into a fresh instance directory,
    /// loads its manifest and registers the container.
    pub async fn install(
        &self,
        source: &str,
        use_docker: bool,
        use_releases: bool,
    ) -> Result<Arc<Container>> {
        let source = InstallSource::parse(source)?;
        let uuid = Uuid::new_v4();
        let dest = self.config.container_path(uuid);

        // Docker installs build from the repository itself; published
        // releases rarely ship a Dockerfile.
        let force_clone = use_docker || !use_releases;

        if let Err(err) = self.downloader.fetch(&source, &dest, force_clone).await {
            let _ = remove_instance_dir(&dest);
            return Err(err);
        }

        let container = match self.load(uuid).await {
            Ok(container) => container,
            Err(err) => {
                let _ = remove_instance_dir(&dest);
                return Err(err);
            }
        };

        let install_method = if use_docker {
            let method = {
                let service = container.service.read().await;
                match &service.methods.docker {
                    Some(docker) if docker.dockerfile.is_some() => Some(InstallMethod::Dockerfile),
                    Some(docker) if docker.image.is_some() => Some(InstallMethod::DockerImage),
                    _ => None,
                }
            };
            match method {
                Some(method) => method,
                None => {
                    let _ = self.registry.delete(uuid).await;
                    let _ = remove_instance_dir(&dest);
                    return Err(VertexError::NoDockerMethod);
                }
            }
        } else {
            InstallMethod::Native
        };
        container.set_install_method(install_method).await;

        let settings = {
            let mut settings = container.settings.write().await;
            settings.install_method = Some(install_method);
            settings.clone()
        };
        self.settings.save(uuid, &settings)?;

        let env = container.env.read().await.clone();
        if !env.is_empty() {
            self.envs.save(uuid, &env)?;
        }

        info!(container = %uuid, name = %container.display_name().await, "installed");
        Ok(container)
    }

    pub async fn start(&self, uuid: Uuid) -> Result<()> {
        let container = self.registry.get(uuid).await?;
        let _ops = container.ops.lock().await;

        let status = container.status().await;
        if matches!(
            status,
            ContainerStatus::Building
                | ContainerStatus::Starting
                | ContainerStatus::Running
                | ContainerStatus::Stopping
        ) {
            return Err(VertexError::InvalidState { uuid, status });
        }

        let result = match container.install_method().await {
            InstallMethod::Native => self.native.start(&container).await,
            _ => self.docker.start(&container).await,
        };
        if let Err(err) = &result {
            error!(container = %uuid, "failed to start: {err}");
        }
        result
    }

    pub async fn stop(&self, uuid: Uuid) -> Result<()> {
        let container = self.registry.get(uuid).await?;
        let _ops = container.ops.lock().await;

        let status = container.status().await;
        if matches!(status, ContainerStatus::Off | ContainerStatus::Building) {
            return Err(VertexError::InvalidState { uuid, status });
        }

        self.stop_container(&container).await
    }

    async fn stop_container(&self, container: &Arc<Container>) -> Result<()> {
        container.set_status(ContainerStatus::Stopping).await;

        let result = match container.install_method().await {
            InstallMethod::Native => self.native.stop(container).await,
            _ => self.docker.stop(container).await,
        };

        match result {
            Ok(()) => {
                // Release the runtime handle before publishing `off`.
                *container.runtime.lock().await = RuntimeHandle::Idle;
                container.set_status(ContainerStatus::Off).await;
                container.logs.close().await;
                Ok(())
            }
            Err(err) => {
                error!(container = %container.uuid, "failed to stop: {err}");
                container.set_status(ContainerStatus::Error).await;
                Err(err)
            }
        }
    }

    /// Force-stops if needed, removes the runtime, the registry entry and
    /// the on-disk directory, in that order.
    pub async fn uninstall(&self, uuid: Uuid) -> Result<()> {
        let container = self.registry.get(uuid).await?;
        let _ops = container.ops.lock().await;

        if matches!(
            container.status().await,
            ContainerStatus::Running | ContainerStatus::Starting | ContainerStatus::Stopping
        ) {
            if let Err(err) = self.stop_container(&container).await {
                warn!(container = %uuid, "stop during uninstall failed, continuing: {err}");
            }
        }

        if container.install_method().await.is_docker() {
            self.docker.delete(&container).await?;
        }

        container.logs.close().await;
        self.registry.delete(uuid).await?;
        remove_instance_dir(&self.config.container_path(uuid))?;

        info!(container = %uuid, "uninstalled");
        Ok(())
    }

    /// Compares the live manifest with the latest one, structurally. Flags
    /// the container without touching its service.
    pub async fn check_for_update(&self, container: &Arc<Container>, latest: &Service) -> bool {
        let up_to_date = *container.service.read().await == *latest;
        container.set_update_available(!up_to_date).await;
        !up_to_date
    }

    /// Replaces the manifest with a newer one. Unsupported generations are
    /// skipped: success, a warning, and no mutation.
    pub async fn update(&self, container: &Arc<Container>, latest: Service) -> Result<()> {
        if latest.version > MAX_SUPPORTED_VERSION {
            warn!(
                container = %container.uuid,
                version = latest.version,
                "service version is not supported, skipping update"
            );
            return Ok(());
        }

        info!(container = %container.uuid, version = latest.version, "upgrading service");
        {
            let mut service = container.service.write().await;
            *service = latest.clone();
        }
        self.services.save(container.uuid, &latest)?;
        container.set_update_available(false).await;
        Ok(())
    }

    /// Replaces the container's environment; in-memory first, then disk.
    pub async fn set_env(&self, uuid: Uuid, variables: BTreeMap<String, String>) -> Result<()> {
        let container = self.registry.get(uuid).await?;
        let _ops = container.ops.lock().await;

        *container.env.write().await = variables.clone();
        self.envs.save(uuid, &variables)
    }

    pub async fn info(&self, uuid: Uuid) -> Result<DockerInfo> {
        let container = self.registry.get(uuid).await?;
        self.docker.info(&container).await
    }

    /// Starts every container marked launch-on-startup.
    pub async fn start_enabled(&self) {
        for container in self.registry.get_all().await {
            let enabled = container
                .settings
                .read()
                .await
                .launch_on_startup
                .unwrap_or(false);
            if enabled {
                info!(container = %container.uuid, "launching on startup");
                if let Err(err) = self.start(container.uuid).await {
                    error!(container = %container.uuid, "startup launch failed: {err}");
                }
            }
        }
    }

    /// Stops everything that is still running and closes every log sink.
    pub async fn shutdown(&self) {
        for container in self.registry.get_all().await {
            if matches!(
                container.status().await,
                ContainerStatus::Running | ContainerStatus::Starting
            ) {
                if let Err(err) = self.stop(container.uuid).await {
                    warn!(container = %container.uuid, "failed to stop during shutdown: {err}");
                }
            }
            container.logs.close().await;
        }
    }
}

fn default_install_method(service: &Service) -> InstallMethod {
    match &service.methods.docker {
        Some(docker) if docker.dockerfile.is_some() => InstallMethod::Dockerfile,
        Some(docker) if docker.image.is_some() => InstallMethod::DockerImage,
        _ => InstallMethod::Native,
    }
}

/// Instance directories may be symlinks (localstorage installs); remove
/// the link itself, never the target.
fn remove_instance_dir(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if meta.file_type().is_symlink() {
        std::fs::remove_file(path)?;
    } else {
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}
