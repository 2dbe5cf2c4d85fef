//! Keeping a copy of inputs that could not be converted.

use std::fs;
use std::path::{Path, PathBuf};

use exn::Exn;
use tracing::debug;

use crate::convert::InputTask;
use crate::error::RelocationError;

/// Name of the directory within the output root that mirrors all failed inputs.
pub const FAILED_DIR: &str = "_failed";

/// Where the failed input of `task` ends up.
pub fn failed_path(task: &InputTask, output_root: &Path) -> PathBuf {
    output_root.join(FAILED_DIR).join(task.relative())
}

/// Copy the unmodified input of `task` into the `_failed` mirror below `output_root`.
///
/// Returns the path of the copy.
pub fn relocate(task: &InputTask, output_root: &Path) -> Result<PathBuf, Exn<RelocationError>> {
    let target = failed_path(task, output_root);
    let source = task.source().display();
    let err = |e: std::io::Error| {
        let target = target.display();
        RelocationError::new(format!("Cannot copy \"{source}\" to \"{target}\": {e}"))
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(err)?;
    }
    fs::copy(task.source(), &target).map_err(err)?;
    debug!("copied failed input to {target:?}");
    Ok(target)
}
