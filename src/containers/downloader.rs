use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;
use tracing::{debug, info};

use crate::error::{Result, VertexError};
use crate::service::Service;

const RELEASE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const RELEASE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// A repository source accepted by Install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// `marketplace:<path>` — a repository path such as
    /// `github.com/vertex-center/vertex-nginx`.
    Marketplace(String),
    /// `localstorage:<abs-path>` — an existing directory on this host,
    /// linked instead of copied.
    LocalStorage(PathBuf),
    /// `git:<url>` — any git repository, cloned over https.
    Git(String),
}

impl InstallSource {
    pub fn parse(source: &str) -> Result<Self> {
        if let Some(path) = source.strip_prefix("marketplace:") {
            Ok(InstallSource::Marketplace(path.to_string()))
        } else if let Some(path) = source.strip_prefix("localstorage:") {
            Ok(InstallSource::LocalStorage(PathBuf::from(path)))
        } else if let Some(url) = source.strip_prefix("git:") {
            Ok(InstallSource::Git(url.to_string()))
        } else {
            Err(VertexError::InvalidSource(source.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Materializes a repository source into an instance directory: symlink
/// for local storage, release tarball or git clone otherwise.
pub struct Downloader {
    client: reqwest::Client,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn fetch(
        &self,
        source: &InstallSource,
        dest: &Path,
        force_clone: bool,
    ) -> Result<()> {
        match source {
            InstallSource::LocalStorage(path) => self.symlink(path, dest),
            InstallSource::Marketplace(repo) | InstallSource::Git(repo) => {
                self.download(repo, dest, force_clone).await
            }
        }
    }

    /// Links an external directory in as an instance. The manifest must be
    /// readable before we commit to the link.
    fn symlink(&self, source: &Path, dest: &Path) -> Result<()> {
        let manifest = source.join(".vertex").join("service.yml");
        let data = fs::read_to_string(&manifest).map_err(|_| {
            VertexError::InvalidSource(format!("{} is not a vertex service", source.display()))
        })?;
        let _: Service = serde_yaml::from_str(&data)?;

        std::os::unix::fs::symlink(source, dest)?;
        Ok(())
    }

    async fn download(&self, repo: &str, dest: &Path, force_clone: bool) -> Result<()> {
        if force_clone {
            debug!(repo, "force-clone enabled");
        } else if self.try_download_release(repo, dest).await? {
            return Ok(());
        } else {
            info!(repo, "no release published, falling back to git clone");
        }

        self.clone_repository(repo, dest).await
    }

    /// Downloads and unpacks the latest GitHub release whose asset name
    /// contains `<os>_<arch>`. Returns false when the repository has no
    /// usable release for this platform.
    async fn try_download_release(&self, repo: &str, dest: &Path) -> Result<bool> {
        let parts: Vec<&str> = repo.trim_start_matches("https://").split('/').collect();
        let (owner, name) = match parts.as_slice() {
            ["github.com", owner, name, ..] => (*owner, *name),
            _ => return Ok(false),
        };

        let url = format!("https://api.github.com/repos/{owner}/{name}/releases/latest");
        let response = self
            .client
            .get(&url)
            .header("User-Agent", "vertex")
            .timeout(RELEASE_LOOKUP_TIMEOUT)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let release: Release = response.error_for_status()?.json().await?;

        let platform = format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH);
        let Some(asset) = release.assets.iter().find(|a| a.name.contains(&platform)) else {
            return Ok(false);
        };

        info!(asset = %asset.name, "downloading release");
        let archive = self
            .client
            .get(&asset.browser_download_url)
            .header("User-Agent", "vertex")
            .timeout(RELEASE_DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        fs::create_dir_all(dest)?;
        untar(archive.as_ref(), dest)?;
        Ok(true)
    }

    async fn clone_repository(&self, repo: &str, dest: &Path) -> Result<()> {
        let url = git_https_url(repo);
        info!(url, "cloning repository");

        let output = tokio::process::Command::new("git")
            .arg("clone")
            .arg("--depth=1")
            .arg(&url)
            .arg(dest)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VertexError::Runtime(format!(
                "git clone of {url} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Sources address repositories scheme-less (`github.com/owner/repo`);
/// cloning always goes over https.
fn git_https_url(repo: &str) -> String {
    let stripped = repo
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    format!("https://{stripped}")
}

fn untar(data: &[u8], dest: &Path) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(data));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = dest.join(entry.path()?);

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        fs::write(&path, contents)?;
        // Release binaries must stay executable after unpacking.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_the_three_schemes() {
        assert_eq!(
            InstallSource::parse("marketplace:github.com/o/r").unwrap(),
            InstallSource::Marketplace("github.com/o/r".to_string())
        );
        assert_eq!(
            InstallSource::parse("localstorage:/srv/app").unwrap(),
            InstallSource::LocalStorage(PathBuf::from("/srv/app"))
        );
        assert_eq!(
            InstallSource::parse("git:github.com/o/r").unwrap(),
            InstallSource::Git("github.com/o/r".to_string())
        );
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(matches!(
            InstallSource::parse("ftp://example.com"),
            Err(VertexError::InvalidSource(_))
        ));
    }

    #[test]
    fn git_urls_are_rewritten_to_https() {
        assert_eq!(
            git_https_url("github.com/owner/repo"),
            "https://github.com/owner/repo"
        );
        assert_eq!(
            git_https_url("https://github.com/owner/repo"),
            "https://github.com/owner/repo"
        );
        assert_eq!(
            git_https_url("http://github.com/owner/repo"),
            "https://github.com/owner/repo"
        );
    }

    #[test]
    fn symlink_requires_a_readable_manifest() {
        let source = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let dest = dest_dir.path().join("instance");
        let downloader = Downloader::new();

        assert!(matches!(
            downloader.symlink(source.path(), &dest),
            Err(VertexError::InvalidSource(_))
        ));

        let vertex_dir = source.path().join(".vertex");
        fs::create_dir_all(&vertex_dir).unwrap();
        fs::write(vertex_dir.join("service.yml"), "id: hello\nname: Hello\n").unwrap();

        downloader.symlink(source.path(), &dest).unwrap();
        assert!(dest.join(".vertex").join("service.yml").exists());
    }

    #[test]
    fn untar_marks_files_executable() {
        let dir = tempfile::tempdir().unwrap();

        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_path("hello").unwrap();
        header.set_size(3);
        header.set_cksum();
        builder.append(&header, "hi\n".as_bytes()).unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        untar(&archive, dir.path()).unwrap();

        let meta = fs::metadata(dir.path().join("hello")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }
}
