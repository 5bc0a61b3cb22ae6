//! Typed paths into a subject directory.
//!
//! Centralizing path construction keeps the on-disk layout consistent and
//! lets the graph builder treat resolved paths as stable dependency keys:
//! identical arguments always resolve to identical paths. Resolving a path
//! also ensures its containing directory exists, so tasks never have to
//! create directories themselves.

use crate::modality::Space;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_DIR: &str = "image";
const TRANS_DIR: &str = "trans";
const REPORT_DIR: &str = "report";

/// Path helper rooted at a subject's output directory.
#[derive(Debug, Clone)]
pub struct SubjectLayout {
    root: PathBuf,
}

impl SubjectLayout {
    /// Open (creating if absent) the subject root. The root's parent must
    /// already exist; a typo'd root aborts configuration instead of silently
    /// growing a directory tree.
    pub fn create(root: &Path) -> Result<Self> {
        let parent = root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| anyhow!("invalid subject root {}", root.display()))?;
        if !parent.is_dir() {
            return Err(anyhow!(
                "invalid subject root {}: parent directory does not exist",
                root.display()
            ));
        }
        if !root.is_dir() {
            fs::create_dir(root).with_context(|| format!("create {}", root.display()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Resolve `<root>/image/<SPACE>/<name>`.
    pub fn image(&self, space: Space, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(IMAGE_DIR).join(space.rel_dir());
        ensure_dir(&dir)?;
        Ok(dir.join(name))
    }

    /// Resolve the directional transform `<root>/trans/<moving>_to_<fixed>.tfm`.
    pub fn transform(&self, moving: Space, fixed: Space) -> Result<PathBuf> {
        let dir = self.root.join(TRANS_DIR);
        ensure_dir(&dir)?;
        Ok(dir.join(format!("{}_to_{}.tfm", moving.trans_key(), fixed.trans_key())))
    }

    /// Resolve `<root>/report/<subdir>/<name>`.
    pub fn report(&self, subdir: &str, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(REPORT_DIR).join(subdir);
        ensure_dir(&dir)?;
        Ok(dir.join(name))
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))
}
