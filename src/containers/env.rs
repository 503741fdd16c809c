use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{Result, VertexError};

/// Persists per-container environment assignments as `KEY=VALUE` lines in
/// `<containers>/<uuid>/.env`. Values may not contain `=` or newlines, so
/// no quoting is needed.
#[derive(Debug, Clone)]
pub struct EnvStore {
    containers_path: PathBuf,
}

impl EnvStore {
    pub fn new(containers_path: impl Into<PathBuf>) -> Self {
        Self {
            containers_path: containers_path.into(),
        }
    }

    fn env_path(&self, uuid: Uuid) -> PathBuf {
        self.containers_path.join(uuid.to_string()).join(".env")
    }

    pub fn save(&self, uuid: Uuid, variables: &BTreeMap<String, String>) -> Result<()> {
        let mut contents = String::new();
        for (key, value) in variables {
            if key.contains('=') || key.contains('\n') || value.contains('=') || value.contains('\n')
            {
                return Err(VertexError::MalformedEnv(format!("{key}={value}")));
            }
            contents.push_str(key);
            contents.push('=');
            contents.push_str(value);
            contents.push('\n');
        }
        fs::write(self.env_path(uuid), contents)?;
        Ok(())
    }

    /// Missing file is an empty environment, not an error.
    pub fn load(&self, uuid: Uuid) -> Result<BTreeMap<String, String>> {
        let contents = match fs::read_to_string(self.env_path(uuid)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut variables = BTreeMap::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| VertexError::MalformedEnv(line.to_string()))?;
            variables.insert(key.to_string(), value.to_string());
        }
        Ok(variables)
    }
}
