use crate::error::{BackupError, Result};
use crate::restore::RestorePath;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Writes a complete [`RestorePath`] out to the file system.
pub trait PathMaterializer: Send + Sync {
    /// `content` holds the path's data blocks in file order.
    fn materialize(&self, path: &RestorePath, destination: &Path, content: &[Vec<u8>])
        -> Result<PathBuf>;
}

/// Concatenates the data blocks into `destination/<relative path>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsMaterializer;

impl PathMaterializer for FsMaterializer {
    fn materialize(
        &self,
        path: &RestorePath,
        destination: &Path,
        content: &[Vec<u8>],
    ) -> Result<PathBuf> {
        let target = confined_join(destination, &path.path).ok_or_else(|| {
            BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path escapes restore destination: {}", path.path),
            ))
        })?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&target)?;
        for chunk in content {
            file.write_all(chunk)?;
        }
        file.sync_all()?;
        Ok(target)
    }
}

/// Joins `relative` under `base`, keeping only plain name components. Returns `None` if
/// nothing is left or the path tries to leave `base`.
pub fn confined_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    let mut pushed = false;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    pushed.then_some(out)
}
