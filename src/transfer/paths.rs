//! Local path handling for transfers
//!
//! Owns the "temporary downloads" and "temporary uploads" areas and the
//! destination staging convention. Either area may be emptied externally
//! between calls, so nothing here assumes a directory still exists.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::CloudFileDescriptor;
use crate::config::{cache_root, ConfigError, TransferConfig};

/// Suffix of the staging sibling a download is written to before the final rename.
pub const STAGING_SUFFIX: &str = ".part";

/// Prefix that hides staging siblings and keeps them off real file names.
const STAGING_PREFIX: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPaths {
    downloads: PathBuf,
    uploads: PathBuf,
}

impl TransferPaths {
    pub fn new(downloads: impl Into<PathBuf>, uploads: impl Into<PathBuf>) -> Self {
        Self {
            downloads: downloads.into(),
            uploads: uploads.into(),
        }
    }

    /// Configured areas, falling back to `<cache>/cloudbridge/{downloads,uploads}`.
    pub fn from_config(config: &TransferConfig) -> Result<Self, ConfigError> {
        let downloads = match &config.temp_downloads_dir {
            Some(dir) => dir.clone(),
            None => cache_root()?.join("downloads"),
        };
        let uploads = match &config.temp_uploads_dir {
            Some(dir) => dir.clone(),
            None => cache_root()?.join("uploads"),
        };
        Ok(Self::new(downloads, uploads))
    }

    /// Both areas under one root, as tests and embedded hosts use it.
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("downloads"), root.join("uploads"))
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    /// `<downloads>/<uuid>/<name>`; the uuid level keeps same-named files apart.
    pub fn default_download_path(&self, file: &CloudFileDescriptor) -> PathBuf {
        self.downloads
            .join(safe_component(&file.uuid))
            .join(safe_component(&file.name))
    }

    /// Fresh per-call directory for staging an in-memory upload.
    pub fn upload_staging_path(&self, name: &str) -> PathBuf {
        self.uploads
            .join(uuid::Uuid::new_v4().to_string())
            .join(safe_component(name))
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.downloads).await?;
        tokio::fs::create_dir_all(&self.uploads).await?;
        debug!(
            "Transfer areas ready: {:?}, {:?}",
            self.downloads, self.uploads
        );
        Ok(())
    }
}

/// `.<name>.<uuid v4>.part` next to `destination`, fresh on every call.
///
/// Concurrent downloads to one destination, or a sibling that happens to be
/// named `<name>.part`, never share a staging file.
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(STAGING_PREFIX);
    if let Some(file_name) = destination.file_name() {
        name.push(file_name);
    }
    name.push(".");
    name.push(uuid::Uuid::new_v4().to_string());
    name.push(STAGING_SUFFIX);
    destination.with_file_name(name)
}

/// Whether `path` names a staging file created by [`staging_path`].
pub fn is_staging_path(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .map(|n| n.starts_with(STAGING_PREFIX) && n.ends_with(STAGING_SUFFIX))
        .unwrap_or(false)
}

/// Make a remote item name usable as exactly one local path component.
///
/// Separators and NUL are replaced; `.`/`..` and empty names become `_`.
pub fn safe_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path_is_unique_hidden_sibling() {
        let dest = Path::new("/tmp/dl/report.pdf");
        let first = staging_path(dest);
        let second = staging_path(dest);
        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(Path::new("/tmp/dl")));

        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".report.pdf."));
        assert!(name.ends_with(".part"));
        assert!(is_staging_path(&first));

        // A real sibling called `<name>.part` is not mistaken for staging
        assert_ne!(first, PathBuf::from("/tmp/dl/report.pdf.part"));
        assert!(!is_staging_path(Path::new("/tmp/dl/report.pdf.part")));
        assert!(!is_staging_path(dest));
    }

    #[test]
    fn test_safe_component() {
        assert_eq!(safe_component("a.txt"), "a.txt");
        assert_eq!(safe_component("../etc/passwd"), ".._etc_passwd");
        assert_eq!(safe_component(".."), "_");
        assert_eq!(safe_component("  "), "_");
        assert_eq!(safe_component("a\\b"), "a_b");
    }

    #[test]
    fn test_default_download_path() {
        let paths = TransferPaths::new("/cache/downloads", "/cache/uploads");
        let file = CloudFileDescriptor {
            uuid: "f-1".to_string(),
            bucket: "b".to_string(),
            region: "r".to_string(),
            chunks: 1,
            version: 2,
            key: "k".to_string(),
            size: 3,
            name: "photo.jpg".to_string(),
            parent_path: None,
        };
        assert_eq!(
            paths.default_download_path(&file),
            PathBuf::from("/cache/downloads/f-1/photo.jpg")
        );
    }

    #[test]
    fn test_from_config_prefers_explicit_dirs() {
        let config = TransferConfig {
            temp_downloads_dir: Some(PathBuf::from("/x/d")),
            temp_uploads_dir: Some(PathBuf::from("/x/u")),
            ..TransferConfig::default()
        };
        let paths = TransferPaths::from_config(&config).unwrap();
        assert_eq!(paths.downloads_dir(), Path::new("/x/d"));
        assert_eq!(paths.uploads_dir(), Path::new("/x/u"));
    }

    #[tokio::test]
    async fn test_ensure_dirs_recreates_after_external_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TransferPaths::under(tmp.path());
        paths.ensure_dirs().await.unwrap();
        tokio::fs::remove_dir_all(paths.downloads_dir()).await.unwrap();
        paths.ensure_dirs().await.unwrap();
        assert!(paths.downloads_dir().is_dir());
        assert!(paths.uploads_dir().is_dir());
    }
}
