mod store;

pub use store::ServiceStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Highest manifest generation this build understands. Newer manifests are
/// loaded as-is but never auto-upgraded.
pub const MAX_SUPPORTED_VERSION: u32 = 2;

/// Declarative description of a third-party service, read from the
/// `.vertex/service.yml` shipped inside its repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "env", skip_serializing_if = "Vec::is_empty")]
    pub env_definitions: Vec<EnvDefinition>,
    #[serde(default)]
    pub methods: ServiceMethods,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMethods {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<NativeMethod>,
}

/// Docker backing: either a Dockerfile at the repository root or a remote
/// image name. Ports are advertised container-side as `"port/proto"`;
/// volumes map a name under `volumes/` to a path inside the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerMethod {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<HashMap<String, String>>,
}

/// Native backing: an executable named after the service id at the
/// repository root. Presence of this block marks the method as supported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeMethod {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvDefinition {
    #[serde(rename = "type")]
    pub kind: EnvKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvKind {
    String,
    Port,
    Url,
    Password,
    Email,
    Number,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<Vec<DatabaseFeature>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseFeature {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

impl Service {
    /// Logs the manifest problems that are tolerated at load time: a newer
    /// generation than this build supports, and ambiguous port defaults
    /// (the first definition in manifest order wins when pairing ports).
    pub fn validate(&self) {
        if self.version > MAX_SUPPORTED_VERSION {
            warn!(
                service = %self.id,
                version = self.version,
                max = MAX_SUPPORTED_VERSION,
                "service version is newer than supported; updates are disabled"
            );
        }

        let mut seen = Vec::new();
        for def in self.env_definitions.iter().filter(|d| d.kind == EnvKind::Port) {
            if let Some(default) = &def.default {
                if seen.contains(&default) {
                    warn!(
                        service = %self.id,
                        port = %default,
                        "two port definitions share a default; the first match wins"
                    );
                } else {
                    seen.push(default);
                }
            }
        }
    }
}
