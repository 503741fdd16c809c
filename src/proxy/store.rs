use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::error::Result;

const REDIRECTS_FILE: &str = "redirects.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRedirect {
    pub source: String,
    pub target: String,
}

/// Redirects keyed by id, persisted as `<storage>/proxy/redirects.json`.
/// The in-memory map is authoritative; the whole file is rewritten after
/// each mutation, under the write lock.
pub struct RedirectStore {
    proxy_path: PathBuf,
    redirects: RwLock<HashMap<Uuid, ProxyRedirect>>,
}

impl RedirectStore {
    /// A missing file is an empty map; an undecodable one is logged and
    /// replaced on the next write.
    pub fn new(proxy_path: impl Into<PathBuf>) -> Result<Self> {
        let proxy_path = proxy_path.into();
        fs::create_dir_all(&proxy_path)?;

        let file = proxy_path.join(REDIRECTS_FILE);
        let redirects = match fs::read(&file) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(redirects) => redirects,
                Err(err) => {
                    error!("failed to decode {REDIRECTS_FILE}: {err}");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            proxy_path,
            redirects: RwLock::new(redirects),
        })
    }

    pub fn get_redirects(&self) -> HashMap<Uuid, ProxyRedirect> {
        self.redirects.read().expect("redirects lock poisoned").clone()
    }

    /// Exact match against the stored sources. Sources are bare hostnames;
    /// callers strip any port from the authority first.
    pub fn get_redirect_by_host(&self, host: &str) -> Option<ProxyRedirect> {
        self.redirects
            .read()
            .expect("redirects lock poisoned")
            .values()
            .find(|r| r.source == host)
            .cloned()
    }

    /// Sources stay unique: a redirect with the same source replaces the
    /// previous one, whatever its id.
    pub fn add_redirect(&self, id: Uuid, redirect: ProxyRedirect) -> Result<()> {
        let mut redirects = self.redirects.write().expect("redirects lock poisoned");
        redirects.retain(|_, r| r.source != redirect.source);
        redirects.insert(id, redirect);
        self.write(&redirects)
    }

    pub fn remove_redirect(&self, id: Uuid) -> Result<()> {
        let mut redirects = self.redirects.write().expect("redirects lock poisoned");
        redirects.remove(&id);
        self.write(&redirects)
    }

    fn write(&self, redirects: &HashMap<Uuid, ProxyRedirect>) -> Result<()> {
        let file = self.proxy_path.join(REDIRECTS_FILE);
        fs::write(file, serde_json::to_vec_pretty(redirects)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redirect(source: &str, target: &str) -> ProxyRedirect {
        ProxyRedirect {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    #[test]
    fn starts_empty_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedirectStore::new(dir.path().join("proxy")).unwrap();
        assert!(store.get_redirects().is_empty());
    }

    #[test]
    fn add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = RedirectStore::new(dir.path()).unwrap();
            store
                .add_redirect(id, redirect("app.local", "http://127.0.0.1:8080"))
                .unwrap();
        }

        let store = RedirectStore::new(dir.path()).unwrap();
        let redirects = store.get_redirects();
        assert_eq!(redirects.len(), 1);
        assert_eq!(redirects.get(&id).unwrap().source, "app.local");
    }

    #[test]
    fn lookup_by_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedirectStore::new(dir.path()).unwrap();
        store
            .add_redirect(Uuid::new_v4(), redirect("app.local", "http://127.0.0.1:1"))
            .unwrap();

        assert_eq!(
            store.get_redirect_by_host("app.local").unwrap().target,
            "http://127.0.0.1:1"
        );
        assert!(store.get_redirect_by_host("other.local").is_none());
    }

    #[test]
    fn duplicate_source_replaces_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedirectStore::new(dir.path()).unwrap();

        store
            .add_redirect(Uuid::new_v4(), redirect("app.local", "http://127.0.0.1:1"))
            .unwrap();
        store
            .add_redirect(Uuid::new_v4(), redirect("app.local", "http://127.0.0.1:2"))
            .unwrap();

        let redirects = store.get_redirects();
        assert_eq!(redirects.len(), 1);
        assert_eq!(
            store.get_redirect_by_host("app.local").unwrap().target,
            "http://127.0.0.1:2"
        );
    }

    #[test]
    fn remove_deletes_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedirectStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();

        store
            .add_redirect(id, redirect("app.local", "http://127.0.0.1:1"))
            .unwrap();
        store.remove_redirect(id).unwrap();

        assert!(store.get_redirects().is_empty());
        assert!(store.get_redirect_by_host("app.local").is_none());
    }

    #[test]
    fn corrupt_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(REDIRECTS_FILE), b"{not json").unwrap();

        let store = RedirectStore::new(dir.path()).unwrap();
        assert!(store.get_redirects().is_empty());
    }
}
