//! Temporary filesystem state of running conversions.
//!
//! Every temporary path is owned by a guard which deletes it when dropped, so no early return
//! or panic leaves scratch data behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use exn::{Exn, ResultExt as _};
use tracing::{debug, error, warn};

use crate::error::ErrorMessage;

/// Start of the names of all temporary files and directories we create.
const SCRATCH_PREFIX: &str = ".cbz_repack-";

/// Counter to give every partial file of this process its own name.
static NEXT_PARTIAL: AtomicUsize = AtomicUsize::new(0);

/// The root directory below which all extractions of one run take place.
///
/// The directory is hidden inside the output root, so it lives on the same file system as the
/// final archives. It is deleted together with all its content when dropped.
pub struct ScratchSpace {
    /// Guard of the root directory.
    root: ScratchDir,
    /// Counter to hand out unique directory names.
    next: AtomicUsize,
}

impl ScratchSpace {
    /// Create the scratch root inside `output_root`.
    ///
    /// Scratch roots left behind by earlier runs that were killed are removed first. Runs
    /// sharing an output root at the same time are not supported.
    pub fn new(output_root: &Path) -> Result<Self, Exn<ErrorMessage>> {
        let path = output_root.join(format!("{SCRATCH_PREFIX}{}", std::process::id()));
        remove_stale(output_root, &path);
        let root = ScratchDir::create(path)?;
        let next = AtomicUsize::new(0);
        Ok(Self { root, next })
    }

    /// Get the path of the scratch root.
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Create a new, empty directory that is not shared with anybody else.
    pub fn allocate(&self) -> Result<ScratchDir, Exn<ErrorMessage>> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        ScratchDir::create(self.root.path().join(id.to_string()))
    }
}

/// Delete scratch roots of other runs in `output_root`, keeping `own`.
fn remove_stale(output_root: &Path, own: &Path) {
    let Ok(entries) = fs::read_dir(output_root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_scratch = entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX)
            && entry.file_type().is_ok_and(|kind| kind.is_dir());
        if !is_scratch || path == own {
            continue;
        }
        warn!("removing scratch directory {path:?} of an earlier run");
        if let Err(e) = fs::remove_dir_all(&path) {
            error!("error on deleting directory {path:?}: {e}");
        }
    }
}

/// Deletes a temporary directory when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    /// The directory, taken on drop.
    root: Option<PathBuf>,
}

impl ScratchDir {
    /// Create the directory and take ownership of it.
    ///
    /// The directory must not exist yet, otherwise we would delete somebody else's data later.
    pub fn create(path: PathBuf) -> Result<Self, Exn<ErrorMessage>> {
        let err = || {
            let path = path.display();
            ErrorMessage::new(format!("Could not create scratch directory \"{path}\""))
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).or_raise(err)?;
        }
        fs::create_dir(&path).or_raise(err)?;
        debug!("created scratch directory {path:?}");
        Ok(Self { root: Some(path) })
    }

    /// Get the path of the directory.
    pub fn path(&self) -> &Path {
        self.root
            .as_deref()
            .expect("the path is only taken on drop")
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let Some(root) = self.root.take() else {
            return;
        };
        debug!("drop scratch directory {root:?}");
        if root.exists()
            && let Err(e) = fs::remove_dir_all(&root)
        {
            error!("error on deleting directory {root:?}: {e}");
        }
    }
}

/// A file that is still being written and must not survive unless it is persisted.
#[derive(Debug)]
pub struct PartialFile {
    /// The temporary file, `None` once it was persisted.
    path: Option<PathBuf>,
}

impl PartialFile {
    /// Reserve a hidden sibling of `destination` to write into.
    ///
    /// The name does not depend on the name of `destination`, so it fits wherever the
    /// destination fits. Nothing is created on disk yet.
    pub fn beside(destination: &Path) -> Self {
        let pid = std::process::id();
        let id = NEXT_PARTIAL.fetch_add(1, Ordering::Relaxed);
        let path = destination.with_file_name(format!("{SCRATCH_PREFIX}{pid}-{id}.part"));
        Self { path: Some(path) }
    }

    /// Get the path of the temporary file.
    pub fn path(&self) -> &Path {
        self.path
            .as_deref()
            .expect("the path is only taken on persist or drop")
    }

    /// Atomically move the finished file to `destination`, replacing whatever is there.
    pub fn persist(mut self, destination: &Path) -> std::io::Result<()> {
        let path = self
            .path
            .take()
            .expect("the path is only taken on persist or drop");
        match fs::rename(&path, destination) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.path = Some(path);
                Err(e)
            }
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        if path.exists() {
            debug!("remove partial file {path:?}");
            if let Err(e) = fs::remove_file(&path) {
                error!("error on deleting partial file {path:?}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_dirs_are_unique_and_removed() {
        let out = tempfile::tempdir().unwrap();
        let space = ScratchSpace::new(out.path()).unwrap();
        let root = space.path().to_path_buf();

        let a = space.allocate().unwrap();
        let b = space.allocate().unwrap();
        assert_ne!(a.path(), b.path(), "every allocation gets its own directory");
        fs::write(a.path().join("page.jpg"), b"data").unwrap();

        let a_path = a.path().to_path_buf();
        drop(a);
        assert!(!a_path.exists(), "dropped scratch dir must be gone");
        assert!(b.path().exists(), "other scratch dir must stay");

        drop(b);
        drop(space);
        assert!(!root.exists(), "scratch root must be gone after the run");
    }

    #[test]
    fn scratch_dir_refuses_existing_directory() {
        let out = tempfile::tempdir().unwrap();
        let existing = out.path().join("taken");
        fs::create_dir(&existing).unwrap();
        fs::write(existing.join("keep.txt"), b"keep").unwrap();

        assert!(ScratchDir::create(existing.clone()).is_err(), "must not adopt a directory");
        assert!(existing.join("keep.txt").exists(), "foreign data must be untouched");
    }

    #[test]
    fn stale_scratch_roots_are_removed() {
        let out = tempfile::tempdir().unwrap();
        let stale = out.path().join(".cbz_repack-4000000000");
        fs::create_dir_all(stale.join("0")).unwrap();
        fs::write(stale.join("0/page.jpg"), b"left behind").unwrap();
        fs::create_dir(out.path().join("comics")).unwrap();

        let space = ScratchSpace::new(out.path()).unwrap();
        assert!(!stale.exists(), "scratch root of a killed run must be removed");
        assert!(space.path().is_dir(), "own scratch root must exist");
        assert!(out.path().join("comics").is_dir(), "other directories must be kept");
    }

    #[test]
    fn partial_names_do_not_grow_with_destination() {
        let out = tempfile::tempdir().unwrap();
        let long_name = format!("{}.cbz", "x".repeat(246));
        let destination = out.path().join(&long_name);

        let a = PartialFile::beside(&destination);
        let b = PartialFile::beside(&destination);
        assert_ne!(a.path(), b.path(), "every partial file gets its own name");
        assert_eq!(a.path().parent(), destination.parent(), "partial file is a sibling");

        fs::write(a.path(), b"full").unwrap();
        a.persist(&destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"full");
    }

    #[test]
    fn partial_file_is_removed_unless_persisted() {
        let out = tempfile::tempdir().unwrap();
        let destination = out.path().join("a.cbz");

        let partial = PartialFile::beside(&destination);
        fs::write(partial.path(), b"half").unwrap();
        let partial_path = partial.path().to_path_buf();
        drop(partial);
        assert!(!partial_path.exists(), "unpersisted partial file must be deleted");
        assert!(!destination.exists(), "destination must not appear");

        let partial = PartialFile::beside(&destination);
        fs::write(partial.path(), b"full").unwrap();
        partial.persist(&destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"full");
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1, "only the result remains");
    }
}
