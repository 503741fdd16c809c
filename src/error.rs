use thiserror::Error;
use uuid::Uuid;

use crate::containers::ContainerStatus;

#[derive(Debug, Error)]
pub enum VertexError {
    #[error("container {0} not found")]
    ContainerNotFound(Uuid),

    #[error("container {0} already exists")]
    ContainerAlreadyExists(Uuid),

    #[error("no manifest found for container {0}")]
    ManifestNotFound(Uuid),

    #[error("unsupported repository source: {0}")]
    InvalidSource(String),

    #[error("container {uuid} cannot do that while {status}")]
    InvalidState { uuid: Uuid, status: ContainerStatus },

    #[error("the service has no Docker install method")]
    NoDockerMethod,

    #[error("the executable {0} (or {0}.sh) was not found")]
    ExecutableNotFound(String),

    #[error("service version {0} is not supported")]
    UnsupportedVersion(u32),

    #[error("malformed line in .env: {0}")]
    MalformedEnv(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("runtime failure: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, VertexError>;
