use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::containers::{Container, ContainerStatus, LogKind, RuntimeHandle};
use crate::error::{Result, VertexError};
use crate::service::{DockerMethod, EnvDefinition, EnvKind};

const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct DockerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub platform: String,
}

/// Runs a container through the Docker daemon: build or pull the image,
/// create the container under its `VERTEX_CONTAINER_<uuid>` name, start it.
pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    pub fn new() -> Result<Self> {
        // The connection is lazy: no daemon is needed until a docker
        // operation actually runs.
        let docker = Docker::connect_with_socket_defaults()?;
        Ok(Self { docker })
    }

    pub async fn start(&self, container: &Arc<Container>) -> Result<()> {
        container.logs.open().await;
        container.set_status(ContainerStatus::Building).await;

        match self.start_inner(container).await {
            Ok(()) => {
                container.set_status(ContainerStatus::Running).await;
                Ok(())
            }
            Err(err) => {
                container.logs.push(LogKind::Err, err.to_string()).await;
                container.set_status(ContainerStatus::Error).await;
                Err(err)
            }
        }
    }

    async fn start_inner(&self, container: &Arc<Container>) -> Result<()> {
        let service = container.service.read().await.clone();
        let env = container.env.read().await.clone();
        let method = service.methods.docker.clone().ok_or(VertexError::NoDockerMethod)?;

        let image = if method.dockerfile.is_some() {
            let image = container.docker_image_name();
            self.build_image(container, &image).await?;
            image
        } else if let Some(image) = method.image.clone() {
            self.pull_image(container, &image).await?;
            image
        } else {
            return Err(VertexError::NoDockerMethod);
        };

        container.set_status(ContainerStatus::Starting).await;

        let id = match self.container_id(container.uuid).await? {
            Some(id) => id,
            None => {
                let name = container.docker_container_name();
                info!(container = %container.uuid, name, "container doesn't exist, creating it");
                self.create_container(container, &name, &image, &method, &service.env_definitions, &env)
                    .await?
            }
        };

        *container.runtime.lock().await = RuntimeHandle::Docker { id: id.clone() };

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Tars the instance directory (minus `.git/**`) and builds it as
    /// `vertex_image_<uuid>`, streaming build output into the log sink.
    async fn build_image(&self, container: &Arc<Container>, image: &str) -> Result<()> {
        let context = tar_build_context(&container.root)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: image,
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(msg) = stream.next().await {
            let msg = msg?;
            if let Some(err) = msg.error {
                return Err(VertexError::Runtime(err));
            }
            if let Some(line) = msg.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    container.logs.push(LogKind::Out, line).await;
                }
            }
        }

        info!(container = %container.uuid, image, "docker build: success");
        Ok(())
    }

    async fn pull_image(&self, container: &Arc<Container>, image: &str) -> Result<()> {
        info!(container = %container.uuid, image, "pulling image");

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(msg) = stream.next().await {
            let msg = msg?;
            if let Some(status) = msg.status {
                if !status.is_empty() {
                    container.logs.push(LogKind::Out, status).await;
                }
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        container: &Arc<Container>,
        name: &str,
        image: &str,
        method: &DockerMethod,
        env_definitions: &[EnvDefinition],
        env: &BTreeMap<String, String>,
    ) -> Result<String> {
        let (exposed_ports, port_bindings) = match &method.ports {
            Some(ports) => compute_port_bindings(ports, env_definitions, env),
            None => Default::default(),
        };

        let binds = match &method.volumes {
            Some(volumes) => Some(compute_volume_binds(&container.root, volumes)?),
            None => None,
        };

        let config = Config {
            image: Some(image.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds,
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            warn!(container = %container.uuid, warning, "warning while creating container");
        }
        Ok(response.id)
    }

    pub async fn stop(&self, container: &Arc<Container>) -> Result<()> {
        let id = self.container_id(container.uuid).await?.ok_or_else(|| {
            VertexError::Runtime(format!(
                "docker container {} not found",
                container.docker_container_name()
            ))
        })?;

        self.docker
            .stop_container(&id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await?;
        Ok(())
    }

    /// Removes the named container; already-absent is a success.
    pub async fn delete(&self, container: &Arc<Container>) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&container.docker_container_name(), Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn info(&self, container: &Arc<Container>) -> Result<DockerInfo> {
        let id = self.container_id(container.uuid).await?.ok_or_else(|| {
            VertexError::Runtime(format!(
                "docker container {} not found",
                container.docker_container_name()
            ))
        })?;

        let inspect = self
            .docker
            .inspect_container(&id, None::<bollard::container::InspectContainerOptions>)
            .await?;

        Ok(DockerInfo {
            id: inspect.id.unwrap_or_default(),
            name: inspect.name.unwrap_or_default(),
            image: inspect.image.unwrap_or_default(),
            platform: inspect.platform.unwrap_or_default(),
        })
    }

    /// Docker id of `VERTEX_CONTAINER_<uuid>`, if the daemon knows it.
    async fn container_id(&self, uuid: Uuid) -> Result<Option<String>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        let wanted = format!("/VERTEX_CONTAINER_{uuid}");
        for summary in containers {
            let names = summary.names.unwrap_or_default();
            if names.iter().any(|n| n == &wanted) {
                return Ok(summary.id);
            }
        }
        Ok(None)
    }
}

/// For each advertised `"port/proto"`, the host port comes from the env
/// value of the first `type = port` definition whose default equals the
/// container-side port. Ports with no pairing stay unbound.
fn compute_port_bindings(
    ports: &[String],
    env_definitions: &[EnvDefinition],
    env: &BTreeMap<String, String>,
) -> (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<PortBinding>>>,
) {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();

    for port in ports {
        let container_port = port.split('/').next().unwrap_or(port);
        let proto = port.split('/').nth(1).unwrap_or("tcp");
        let key = format!("{container_port}/{proto}");

        let paired = env_definitions.iter().find(|def| {
            def.kind == EnvKind::Port && def.default.as_deref() == Some(container_port)
        });
        let Some(def) = paired else {
            warn!(port = %port, "no port env definition pairs with this port, leaving it unbound");
            continue;
        };
        let Some(host_port) = env.get(&def.name).filter(|v| !v.is_empty()) else {
            warn!(port = %port, variable = %def.name, "port variable has no value, leaving it unbound");
            continue;
        };

        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.clone()),
            }]),
        );
    }

    (exposed, bindings)
}

/// `source → target` becomes `<root>/volumes/<source>:<target>`, creating
/// the host-side directory on the way.
fn compute_volume_binds(root: &Path, volumes: &HashMap<String, String>) -> Result<Vec<String>> {
    let mut binds = Vec::new();
    for (source, target) in volumes {
        let host = root.join("volumes").join(source);
        std::fs::create_dir_all(&host)?;
        binds.push(format!("{}:{}", host.display(), target));
    }
    binds.sort();
    Ok(binds)
}

/// Build context for the daemon: the whole instance directory except
/// `.git/**`.
fn tar_build_context(root: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(true);

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            builder.append_dir_all(PathBuf::from(&name), &path)?;
        } else {
            builder.append_path_with_name(&path, PathBuf::from(&name))?;
        }
    }

    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_def(name: &str, default: &str) -> EnvDefinition {
        EnvDefinition {
            kind: EnvKind::Port,
            name: name.to_string(),
            display_name: None,
            default: Some(default.to_string()),
            description: None,
            secret: None,
        }
    }

    #[test]
    fn port_pairing_binds_env_value_to_container_port() {
        let ports = vec!["80/tcp".to_string()];
        let defs = vec![port_def("PORT", "80")];
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "8080".to_string());

        let (exposed, bindings) = compute_port_bindings(&ports, &defs, &env);

        assert!(exposed.contains_key("80/tcp"));
        let binding = bindings.get("80/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn unpaired_port_stays_unbound() {
        let ports = vec!["80/tcp".to_string()];
        let defs = vec![port_def("OTHER", "9999")];
        let env = BTreeMap::new();

        let (exposed, bindings) = compute_port_bindings(&ports, &defs, &env);

        assert!(exposed.is_empty());
        assert!(bindings.is_empty());
    }

    #[test]
    fn first_matching_definition_wins() {
        let ports = vec!["80/tcp".to_string()];
        let defs = vec![port_def("FIRST", "80"), port_def("SECOND", "80")];
        let mut env = BTreeMap::new();
        env.insert("FIRST".to_string(), "8080".to_string());
        env.insert("SECOND".to_string(), "9090".to_string());

        let (_, bindings) = compute_port_bindings(&ports, &defs, &env);

        let binding = bindings.get("80/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn port_without_proto_defaults_to_tcp() {
        let ports = vec!["5432".to_string()];
        let defs = vec![port_def("DB_PORT", "5432")];
        let mut env = BTreeMap::new();
        env.insert("DB_PORT".to_string(), "5432".to_string());

        let (exposed, _) = compute_port_bindings(&ports, &defs, &env);
        assert!(exposed.contains_key("5432/tcp"));
    }

    #[test]
    fn volume_binds_create_host_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut volumes = HashMap::new();
        volumes.insert("data".to_string(), "/var/lib/data".to_string());

        let binds = compute_volume_binds(dir.path(), &volumes).unwrap();

        assert_eq!(binds.len(), 1);
        assert_eq!(
            binds[0],
            format!("{}:/var/lib/data", dir.path().join("volumes").join("data").display())
        );
        assert!(dir.path().join("volumes").join("data").is_dir());
    }

    #[test]
    fn build_context_excludes_git() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src").join("app"), "bin").unwrap();

        let context = tar_build_context(dir.path()).unwrap();

        let mut archive = tar::Archive::new(context.as_slice());
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();

        assert!(paths.contains(&"Dockerfile".to_string()));
        assert!(paths.contains(&"src/app".to_string()));
        assert!(!paths.iter().any(|p| p.starts_with(".git")));
    }
}
