use crate::error::AuditError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "customizations.xml";
pub const SOLUTION_FILE: &str = "solution.xml";

/// Paths inside an extracted solution.
#[derive(Debug, Clone)]
pub struct SolutionLayout {
    root: PathBuf,
}

impl SolutionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn solution_path(&self) -> PathBuf {
        self.root.join(SOLUTION_FILE)
    }
}

/// Unpacks an exported solution zip into `dest`. Entries whose names would
/// land outside `dest` are rejected.
pub fn extract_solution(zip_path: &Path, dest: &Path) -> Result<SolutionLayout, AuditError> {
    info!(archive = %zip_path.display(), dest = %dest.display(), "extracting solution");
    let archive_error = |reason: String| AuditError::Archive {
        path: zip_path.to_path_buf(),
        reason,
    };

    let file = fs::File::open(zip_path)
        .map_err(|err| AuditError::io(format!("failed to open {}", zip_path.display()), err))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| archive_error(err.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| archive_error(err.to_string()))?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(archive_error(format!(
                "entry '{}' escapes the extraction directory",
                entry.name()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| {
                AuditError::io(format!("failed to create {}", target.display()), err)
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AuditError::io(format!("failed to create {}", parent.display()), err)
            })?;
        }
        let mut out = fs::File::create(&target)
            .map_err(|err| AuditError::io(format!("failed to create {}", target.display()), err))?;
        io::copy(&mut entry, &mut out)
            .map_err(|err| AuditError::io(format!("failed to write {}", target.display()), err))?;
        debug!(entry = %target.display(), "extracted");
    }

    Ok(SolutionLayout::new(dest))
}
