//! Moving files between a job directory and cache blobs

use super::{Blob, Blobs, CacheEntry, CacheError};
use std::fs;
use std::path::{Component, Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    super::DEFAULT_FILE_MODE
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::other(format!(
        "cannot restore symlink {} on this platform",
        link.display()
    )))
}

fn collect_into(root: &Path, relative: &Path, blobs: &mut Blobs) -> Result<(), CacheError> {
    let full = root.join(relative);
    let metadata = fs::symlink_metadata(&full)?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(&full)?;
        blobs.insert(relative.to_path_buf(), Blob::Symlink { target });
    } else if file_type.is_dir() {
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            collect_into(root, &relative.join(entry.file_name()), blobs)?;
        }
    } else if file_type.is_file() {
        blobs.insert(
            relative.to_path_buf(),
            Blob::File {
                content: fs::read(&full)?,
                mode: file_mode(&metadata),
            },
        );
    } else {
        tracing::debug!(path = %relative.display(), "Skipping special file in cache paths");
    }

    Ok(())
}

/// Read the declared `paths` under `root` into a blob set
///
/// Directories are walked recursively. Symlinks are stored as links, not
/// followed. Missing paths are skipped.
pub fn collect_blobs(root: &Path, paths: &[PathBuf]) -> Result<Blobs, CacheError> {
    let mut blobs = Blobs::new();

    for path in paths {
        if !is_safe_relative(path) {
            return Err(CacheError::InvalidPath(path.display().to_string()));
        }
        if fs::symlink_metadata(root.join(path)).is_err() {
            tracing::debug!(path = %path.display(), "Cache path does not exist, skipping");
            continue;
        }
        collect_into(root, path, &mut blobs)?;
    }

    Ok(blobs)
}

/// Remove whatever sits at `path` so a restored blob can take its place
fn clear_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write an entry's blobs back under `root`, returning the number restored
pub fn restore_blobs(root: &Path, entry: &CacheEntry) -> Result<usize, CacheError> {
    for (path, blob) in &entry.blobs {
        if !is_safe_relative(path) {
            return Err(CacheError::InvalidPath(path.display().to_string()));
        }
        let target = root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        clear_path(&target)?;

        match blob {
            Blob::File { content, mode } => {
                fs::write(&target, content)?;
                set_file_mode(&target, *mode)?;
            }
            Blob::Symlink { target: link } => create_symlink(link, &target)?,
        }
    }
    Ok(entry.blobs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_files_and_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/app"), "bin").unwrap();
        fs::write(dir.path().join("target/.rustc_info"), "info").unwrap();
        fs::write(dir.path().join("Cargo.lock"), "lock").unwrap();

        let blobs = collect_blobs(
            dir.path(),
            &[PathBuf::from("target"), PathBuf::from("Cargo.lock")],
        )
        .unwrap();

        assert_eq!(blobs.len(), 3);
        assert!(matches!(
            &blobs[&PathBuf::from("target/debug/app")],
            Blob::File { content, .. } if content == b"bin"
        ));
        assert!(matches!(
            &blobs[&PathBuf::from("Cargo.lock")],
            Blob::File { content, .. } if content == b"lock"
        ));
    }

    #[test]
    fn test_missing_paths_are_skipped() {
        let dir = TempDir::new().unwrap();
        let blobs = collect_blobs(dir.path(), &[PathBuf::from("node_modules")]).unwrap();
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            collect_blobs(dir.path(), &[PathBuf::from("../secrets")]),
            Err(CacheError::InvalidPath(_))
        ));

        let mut blobs = Blobs::new();
        blobs.insert(PathBuf::from("/etc/passwd"), Blob::file("x"));
        let entry = CacheEntry::new("k", blobs);
        assert!(matches!(
            restore_blobs(dir.path(), &entry),
            Err(CacheError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_restore_into_fresh_directory() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("vendor/pkg")).unwrap();
        fs::write(source.path().join("vendor/pkg/lib.rs"), "pub fn f() {}").unwrap();
        let blobs = collect_blobs(source.path(), &[PathBuf::from("vendor")]).unwrap();

        let dest = TempDir::new().unwrap();
        let restored = restore_blobs(dest.path(), &CacheEntry::new("k", blobs)).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(
            fs::read_to_string(dest.path().join("vendor/pkg/lib.rs")).unwrap(),
            "pub fn f() {}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_modes_and_symlinks_survive_restore() {
        let source = TempDir::new().unwrap();
        let bin = source.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("tool"), "#!/bin/sh\necho tool\n").unwrap();
        fs::set_permissions(bin.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("tool", bin.join("alias")).unwrap();

        let blobs = collect_blobs(source.path(), &[PathBuf::from("bin")]).unwrap();
        assert_eq!(
            blobs[&PathBuf::from("bin/alias")],
            Blob::Symlink {
                target: PathBuf::from("tool")
            }
        );

        let dest = TempDir::new().unwrap();
        // A stale file where the link goes must not block the restore
        fs::create_dir_all(dest.path().join("bin")).unwrap();
        fs::write(dest.path().join("bin/alias"), "stale").unwrap();

        assert_eq!(
            restore_blobs(dest.path(), &CacheEntry::new("k", blobs)).unwrap(),
            2
        );

        let tool = dest.path().join("bin/tool");
        let mode = fs::metadata(&tool).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);

        let alias = dest.path().join("bin/alias");
        assert!(fs::symlink_metadata(&alias).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&alias).unwrap(), PathBuf::from("tool"));
        assert_eq!(fs::read_to_string(&alias).unwrap(), "#!/bin/sh\necho tool\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode_recorded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("run.sh"), "true").unwrap();
        fs::set_permissions(dir.path().join("run.sh"), fs::Permissions::from_mode(0o750)).unwrap();

        let blobs = collect_blobs(dir.path(), &[PathBuf::from("run.sh")]).unwrap();
        assert!(matches!(
            blobs[&PathBuf::from("run.sh")],
            Blob::File { mode: 0o750, .. }
        ));
    }
}
