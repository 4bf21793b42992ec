//! Tar handling for build contexts and extracted files.

use kiln_core::engine::{BuildContext, DOCKERFILE_NAME};
use kiln_core::{Error, Result};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Pack a build context: the source tree minus excludes, plus the rendered Dockerfile.
pub fn pack_context(context: &BuildContext) -> Result<Vec<u8>> {
    if !context.root.is_dir() {
        return Err(Error::Recipe(format!(
            "source root '{}' is not a directory",
            context.root.display()
        )));
    }

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let files = append_tree(&mut builder, &context.root, &context.excludes)?;

    let dockerfile = context.dockerfile.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, DOCKERFILE_NAME, dockerfile)?;

    debug!(files, "Packed build context");
    Ok(builder.into_inner()?)
}

/// Append everything under `root` in file-name order. Excluded paths are
/// pruned along with their contents; symlinks are stored as links.
fn append_tree(
    builder: &mut tar::Builder<Vec<u8>>,
    root: &Path,
    excludes: &[String],
) -> Result<usize> {
    let relative = |path: &Path| path.strip_prefix(root).unwrap_or(path).to_path_buf();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(&relative(entry.path()), excludes));

    let mut files = 0;
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel_path = relative(entry.path());
        if entry.file_type().is_dir() {
            builder.append_dir(&rel_path, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &rel_path)?;
            files += 1;
        }
    }
    Ok(files)
}

fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    excludes.iter().any(|ex| rel == Path::new(ex))
        || rel.file_name().is_some_and(|n| n == DOCKERFILE_NAME)
}

/// Unpack an archive downloaded from a container into `dest`.
///
/// The engine returns the requested directory as the archive's top-level
/// entry; it is stripped so `dist/pkg-1.0.whl` lands at `dest/pkg-1.0.whl`.
/// Returns the unpacked files relative to `dest`, sorted.
pub fn unpack_archive(archive: impl Read, dest: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(archive);
    let mut files = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| Error::Extraction(format!("invalid archive: {}", e)))?
    {
        let mut entry = entry.map_err(|e| Error::Extraction(format!("invalid archive: {}", e)))?;
        let path = entry.path()?.into_owned();

        let rel: PathBuf = path.components().skip(1).collect();
        if rel.as_os_str().is_empty() {
            continue;
        }
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Extraction(format!(
                "refusing to unpack '{}'",
                path.display()
            )));
        }

        let target = dest.join(&rel);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        if entry_type.is_file() {
            files.push(rel);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_unpack_strips_top_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("wheel_output");
        let archive = make_archive(&[("dist/pkg-1.0.whl", b"wheel-bytes")]);

        let files = unpack_archive(&archive[..], &dest).unwrap();

        assert_eq!(files, vec![PathBuf::from("pkg-1.0.whl")]);
        assert_eq!(
            fs::read(dest.join("pkg-1.0.whl")).unwrap(),
            b"wheel-bytes".to_vec()
        );
    }

    #[test]
    fn test_unpack_keeps_nested_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_archive(&[
            ("dist/b.whl", b"b"),
            ("dist/sub/a.txt", b"a"),
        ]);

        let files = unpack_archive(&archive[..], dir.path()).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("b.whl"), PathBuf::from("sub/a.txt")]
        );
    }

    #[test]
    fn test_unpack_creates_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/c");
        let archive = make_archive(&[]);
        let files = unpack_archive(&archive[..], &dest).unwrap();
        assert!(files.is_empty());
        assert!(dest.is_dir());
    }

    #[test]
    fn test_pack_context_includes_dockerfile_and_skips_excludes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("setup.py"), "print()").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(dir.path().join("opensfm")).unwrap();
        fs::write(dir.path().join("opensfm/__init__.py"), "").unwrap();

        let context = BuildContext {
            root: dir.path().to_path_buf(),
            dockerfile: "FROM ubuntu:jammy\n".to_string(),
            recipe_steps: 1,
            excludes: vec![".git".to_string()],
            build_args: HashMap::new(),
        };

        let packed = pack_context(&context).unwrap();
        let mut archive = tar::Archive::new(&packed[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();

        assert!(names.iter().any(|n| n == "setup.py"));
        assert!(names.iter().any(|n| n == "opensfm/__init__.py"));
        assert!(names.iter().any(|n| n == DOCKERFILE_NAME));
        assert!(!names.iter().any(|n| n.starts_with(".git")));
    }

    #[test]
    fn test_pack_context_is_sorted_and_prunes_nested_excludes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/big.o"), "obj").unwrap();
        fs::write(dir.path().join("b.py"), "").unwrap();
        fs::write(dir.path().join("a.py"), "").unwrap();

        let context = BuildContext {
            root: dir.path().to_path_buf(),
            dockerfile: "FROM ubuntu:jammy\n".to_string(),
            recipe_steps: 1,
            excludes: vec!["target".to_string()],
            build_args: HashMap::new(),
        };

        let packed = pack_context(&context).unwrap();
        let mut archive = tar::Archive::new(&packed[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(names, vec!["a.py", "b.py", DOCKERFILE_NAME]);
    }

    #[test]
    fn test_pack_context_missing_root() {
        let context = BuildContext {
            root: PathBuf::from("/definitely/not/here"),
            dockerfile: String::new(),
            recipe_steps: 0,
            excludes: vec![],
            build_args: HashMap::new(),
        };
        assert!(matches!(pack_context(&context), Err(Error::Recipe(_))));
    }
}
