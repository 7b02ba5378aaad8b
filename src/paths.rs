//! Path normalization helpers shared by the transfer registry checks

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};

/// Normalize a path to an absolute form without touching the filesystem.
/// Relative paths are anchored at the current working directory; `.` and
/// `..` components are resolved lexically. Registry conflict checks compare
/// these normalized forms, so two spellings of the same file collide.
pub fn normalize_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        bail!("empty path");
    }
    if path.contains('\0') {
        bail!("path contains NUL byte");
    }

    let p = Path::new(path);
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
        }
    }
    Ok(out)
}

/// Create the directory tree leading up to `path`, if any of it is missing.
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
