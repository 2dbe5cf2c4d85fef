//! Finding all comic archives below the input root.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use exn::{Exn, ResultExt as _, bail};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::convert::InputTask;
use crate::error::ErrorMessage;

/// Extensions of the files we convert, compared case-insensitively.
const COMIC_EXTENSIONS: [&str; 2] = ["cbr", "cbz"];

/// Collect a task for every comic archive below `input_root`, in a stable order.
///
/// The directory `exclude` and everything below it is not visited, which keeps an output root
/// placed inside the input root from feeding our own results back in. Symbolic links are not
/// followed. Entries that cannot be read are logged and skipped.
pub fn discover(
    input_root: &Path,
    exclude: Option<&Path>,
) -> Result<Vec<InputTask>, Exn<ErrorMessage>> {
    let err = || {
        let root = input_root.display();
        ErrorMessage::new(format!("Cannot search for archives in \"{root}\""))
    };

    if !input_root.is_dir() {
        let root = input_root.display();
        bail!(ErrorMessage::new(format!("Not a directory: \"{root}\"")));
    }
    let root = input_root.canonicalize().or_raise(err)?;
    let exclude = exclude.and_then(|path| path.canonicalize().ok());

    let is_excluded = |entry: &DirEntry| {
        let excluded = exclude.as_deref() == Some(entry.path());
        if excluded {
            debug!("not descending into {:?}", entry.path());
        }
        excluded
    };

    let mut tasks = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_comic(entry.path()) {
            continue;
        }

        let source = entry.into_path();
        let relative = source
            .strip_prefix(&root)
            .expect("walkdir only yields paths below its root")
            .to_path_buf();
        tasks.push(InputTask::new(source, relative));
    }

    debug!("found {} archives below {root:?}", tasks.len());
    Ok(tasks)
}

/// Whether the file at `path` is named like a comic archive.
fn is_comic(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| COMIC_EXTENSIONS.iter().any(|c| c.eq_ignore_ascii_case(ext)))
}

/// The output root to leave out of the search, if it lies within the input root.
///
/// Fails if both roots are the same directory, since nothing could be searched then.
pub fn nested_output(
    input_root: &Path,
    output_root: &Path,
) -> Result<Option<PathBuf>, Exn<ErrorMessage>> {
    let (Ok(input), Ok(output)) = (input_root.canonicalize(), output_root.canonicalize()) else {
        return Ok(None);
    };
    if input == output {
        let root = input.display();
        bail!(ErrorMessage::new(format!(
            "Input and output root must differ, both are \"{root}\""
        )));
    }
    Ok(output.starts_with(&input).then_some(output))
}
