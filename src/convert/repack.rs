//! Writing an extracted tree into an uncompressed Zip archive.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;

use exn::Exn;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::convert::extract::ExtractedTree;
use crate::convert::scratch::PartialFile;
use crate::error::{RepackError, zip_cause};

/// Write all members of `tree` into a new archive at `destination`.
///
/// The archive is first written to a hidden sibling and only renamed into place once complete,
/// so `destination` is never observed half-written. Members are stored without compression, in
/// lexicographic order and with fixed metadata, which makes the output reproducible.
pub fn repack(tree: &ExtractedTree, destination: &Path) -> Result<(), Exn<RepackError>> {
    let shown = destination.display();

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            let parent = parent.display();
            RepackError::new(format!("Cannot create output directory \"{parent}\": {e}"))
        })?;
    }

    let partial = PartialFile::beside(destination);
    debug!("writing {} members to {:?}", tree.len(), partial.path());
    write_archive(tree, partial.path()).map_err(|e| {
        let cause = zip_cause(&e);
        RepackError::new(format!("Cannot write archive \"{shown}\": {cause}"))
    })?;
    partial
        .persist(destination)
        .map_err(|e| RepackError::new(format!("Cannot move archive to \"{shown}\": {e}")))?;
    Ok(())
}

/// Write the archive to `path` and make sure it reached the disk.
fn write_archive(tree: &ExtractedTree, path: &Path) -> zip::result::ZipResult<()> {
    let file = File::create(path)?;
    let mut zipper = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    for member in tree.members() {
        let source = tree.file(member);
        let size = fs::metadata(&source)?.len();
        let options = options.large_file(size >= u64::from(u32::MAX));

        zipper.start_file(member, options)?;
        let mut content = File::open(&source)?;
        io::copy(&mut content, &mut zipper)?;
    }

    let file = zipper.finish()?.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;
    Ok(())
}
