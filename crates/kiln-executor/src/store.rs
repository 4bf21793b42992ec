//! Filesystem artifact store.
//!
//! Layout: `<root>/<run_id>/<name>/…` holds the bundle files and
//! `<root>/<run_id>/<name>.json` its [`ArtifactRef`].

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::artifact::{ArtifactKey, ArtifactRef, ArtifactStore};
use kiln_core::{Error, Result, RunId};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bundle_dir(&self, run_id: &RunId, name: &str) -> PathBuf {
        self.root.join(run_id.as_str()).join(name)
    }

    fn manifest_path(&self, run_id: &RunId, name: &str) -> PathBuf {
        self.root.join(run_id.as_str()).join(format!("{}.json", name))
    }
}

/// Files under `dir`, relative and sorted. Symlinks are followed, so a
/// linked directory contributes the files inside it.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| Error::Internal(e.to_string()))?;
            files.push(rel.to_path_buf());
        }
    }
    Ok(files)
}

/// sha256 over each file's relative path and contents, in sorted order.
pub fn checksum_dir(dir: &Path, files: &[PathBuf]) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for rel in files {
        let data = fs::read(dir.join(rel))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&data);
        size += data.len() as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

fn copy_files(from: &Path, to: &Path, files: &[PathBuf]) -> Result<()> {
    for rel in files {
        let target = to.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from.join(rel), &target)?;
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidInput(format!(
            "artifact name '{}' is not a valid file name",
            name
        )));
    }
    Ok(())
}

fn publish_blocking(
    bundle_dir: PathBuf,
    manifest_path: PathBuf,
    run_id: RunId,
    name: String,
    source: PathBuf,
) -> Result<ArtifactRef> {
    if manifest_path.exists() {
        return Err(Error::Conflict(format!(
            "artifact '{}' already published for run {}",
            name, run_id
        )));
    }
    let files = list_files(&source)
        .map_err(|e| Error::Upload(format!("cannot read '{}': {}", source.display(), e)))?;
    if files.is_empty() {
        return Err(Error::Upload(format!(
            "nothing to publish in '{}'",
            source.display()
        )));
    }

    fs::create_dir_all(&bundle_dir)?;
    copy_files(&source, &bundle_dir, &files)?;
    let (checksum, size) = checksum_dir(&bundle_dir, &files)?;

    let reference = ArtifactRef {
        key: ArtifactKey { run_id, name },
        location: bundle_dir.display().to_string(),
        checksum,
        files: files
            .iter()
            .map(|f| f.to_string_lossy().replace('\\', "/"))
            .collect(),
        size,
        created_at: Utc::now(),
    };
    let json = serde_json::to_vec_pretty(&reference)
        .map_err(|e| Error::Internal(format!("serializing artifact manifest: {}", e)))?;
    fs::write(&manifest_path, json)?;
    Ok(reference)
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("store task panicked: {}", e)))?
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, run_id: &RunId, name: &str, dir: &Path) -> Result<ArtifactRef> {
        validate_name(name)?;
        let bundle_dir = self.bundle_dir(run_id, name);
        let manifest_path = self.manifest_path(run_id, name);
        let (run, bundle, source) = (run_id.clone(), name.to_string(), dir.to_path_buf());

        let reference =
            blocking(move || publish_blocking(bundle_dir, manifest_path, run, bundle, source))
                .await?;

        info!(
            run_id = %run_id,
            artifact = %name,
            files = reference.files.len(),
            size = reference.size,
            checksum = %reference.checksum,
            "Artifact published"
        );
        Ok(reference)
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>> {
        let run_dir = self.root.join(run_id.as_str());
        blocking(move || {
            if !run_dir.is_dir() {
                return Ok(Vec::new());
            }
            let mut refs = Vec::new();
            for entry in fs::read_dir(&run_dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "json") {
                    let data = fs::read(&path)?;
                    let reference: ArtifactRef = serde_json::from_slice(&data).map_err(|e| {
                        Error::Internal(format!("corrupt manifest {}: {}", path.display(), e))
                    })?;
                    refs.push(reference);
                }
            }
            refs.sort_by(|a, b| a.key.name.cmp(&b.key.name));
            Ok(refs)
        })
        .await
    }

    async fn fetch(&self, reference: &ArtifactRef, dest: &Path) -> Result<Vec<PathBuf>> {
        let location = PathBuf::from(&reference.location);
        let files: Vec<PathBuf> = reference.files.iter().map(PathBuf::from).collect();
        let expected = reference.checksum.clone();
        let dest = dest.to_path_buf();

        blocking(move || {
            if !location.is_dir() {
                return Err(Error::NotFound(format!(
                    "artifact location '{}'",
                    location.display()
                )));
            }
            let (checksum, _) = checksum_dir(&location, &files)?;
            if checksum != expected {
                return Err(Error::Internal(format!(
                    "checksum mismatch for '{}'",
                    location.display()
                )));
            }
            fs::create_dir_all(&dest)?;
            copy_files(&location, &dest, &files)?;
            Ok(files)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_id() -> RunId {
        RunId::from_revision("0123456789abcdef").unwrap()
    }

    fn staging(dir: &Path) -> PathBuf {
        let staging = dir.join("wheel_output");
        fs::create_dir_all(staging.join("extra")).unwrap();
        fs::write(staging.join("pkg-1.0.whl"), b"wheel").unwrap();
        fs::write(staging.join("extra/notes.txt"), b"notes").unwrap();
        staging
    }

    #[tokio::test]
    async fn test_publish_list_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging(dir.path());
        let store = LocalArtifactStore::new(dir.path().join("store"));
        let run = run_id();

        let reference = store.publish(&run, "opensfm-wheel", &staging).await.unwrap();
        assert_eq!(reference.files, vec!["extra/notes.txt", "pkg-1.0.whl"]);
        assert_eq!(reference.size, 10);
        assert_eq!(reference.checksum.len(), 64);

        let listed = store.list(&run).await.unwrap();
        assert_eq!(listed, vec![reference.clone()]);

        let out = dir.path().join("fetched");
        store.fetch(&reference, &out).await.unwrap();
        assert_eq!(fs::read(out.join("pkg-1.0.whl")).unwrap(), b"wheel".to_vec());
        assert_eq!(
            list_files(&out).unwrap(),
            list_files(&staging).unwrap()
        );
    }

    #[tokio::test]
    async fn test_duplicate_publish_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging(dir.path());
        let store = LocalArtifactStore::new(dir.path().join("store"));
        let run = run_id();

        store.publish(&run, "wheel", &staging).await.unwrap();
        assert!(matches!(
            store.publish(&run, "wheel", &staging).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_directory_is_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        let store = LocalArtifactStore::new(dir.path().join("store"));

        assert!(matches!(
            store.publish(&run_id(), "wheel", &empty).await,
            Err(Error::Upload(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        assert!(store.publish(&run_id(), "../escape", dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_list_unknown_run_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        assert!(store.list(&run_id()).await.unwrap().is_empty());
    }

    #[test]
    fn test_checksum_depends_on_names_and_contents() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("x.whl"), b"1").unwrap();
        fs::write(b.path().join("y.whl"), b"1").unwrap();

        let (ca, _) = checksum_dir(a.path(), &list_files(a.path()).unwrap()).unwrap();
        let (cb, _) = checksum_dir(b.path(), &list_files(b.path()).unwrap()).unwrap();
        assert_ne!(ca, cb);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_directory_is_published_as_files() {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("index.html"), b"<html>").unwrap();
        let staging = staging(dir.path());
        std::os::unix::fs::symlink(&docs, staging.join("docs")).unwrap();

        assert_eq!(
            list_files(&staging).unwrap(),
            vec![
                PathBuf::from("docs/index.html"),
                PathBuf::from("extra/notes.txt"),
                PathBuf::from("pkg-1.0.whl"),
            ]
        );

        let store = LocalArtifactStore::new(dir.path().join("store"));
        let reference = store.publish(&run_id(), "site", &staging).await.unwrap();
        assert_eq!(reference.files[0], "docs/index.html");
        assert_eq!(reference.size, 16);
    }
}
