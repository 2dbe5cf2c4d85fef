//! Detection of the archive family from file content.

use std::fs::File;
use std::io::Read as _;
use std::path::Path;

use derive_more::Display;
use exn::{Exn, ResultExt as _};

use crate::error::ErrorMessage;

/// RAR 1.5 to 4.x marker block.
const RAR4_MAGIC: &[u8] = b"Rar!\x1a\x07\x00";
/// RAR 5 marker block.
const RAR5_MAGIC: &[u8] = b"Rar!\x1a\x07\x01\x00";
/// Local file header, the start of every non-empty Zip archive.
const ZIP_LOCAL_HEADER_SIG: &[u8] = b"PK\x03\x04";
/// End of central directory, the start of an empty Zip archive.
const ZIP_EOCD_SIG: &[u8] = b"PK\x05\x06";
/// Marker of a spanned Zip archive.
const ZIP_SPANNED_SIG: &[u8] = b"PK\x07\x08";

/// Number of bytes needed to check all signatures.
const PREFIX_LEN: u64 = 8;

/// The container family of an archive.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// RAR archives, usually named `.cbr`.
    #[display("rar")]
    RarLike,
    /// Zip archives, usually named `.cbz`.
    #[display("zip")]
    ZipLike,
    /// Neither of the above.
    #[display("unknown")]
    Unknown,
}

impl ArchiveKind {
    /// Determine the kind from the first bytes of a file.
    pub fn from_prefix(prefix: &[u8]) -> Self {
        use ArchiveKind::*;

        if prefix.starts_with(RAR4_MAGIC) || prefix.starts_with(RAR5_MAGIC) {
            return RarLike;
        }
        let is_zip = [ZIP_LOCAL_HEADER_SIG, ZIP_EOCD_SIG, ZIP_SPANNED_SIG]
            .iter()
            .any(|sig| prefix.starts_with(sig));
        match is_zip {
            true => ZipLike,
            false => Unknown,
        }
    }

    /// The kind a file claims to be by its extension.
    pub fn claimed_by(path: &Path) -> Self {
        use ArchiveKind::*;

        let Some(ext) = path.extension() else {
            return Unknown;
        };
        match ext.to_string_lossy().to_lowercase().as_str() {
            "cbr" | "rar" => RarLike,
            "cbz" | "zip" => ZipLike,
            _ => Unknown,
        }
    }

    /// The alternative kind to try when this one did not work out.
    pub const fn other(self) -> Self {
        use ArchiveKind::*;

        match self {
            RarLike => ZipLike,
            ZipLike => RarLike,
            Unknown => Unknown,
        }
    }

    /// Whether this is one of the supported archive families.
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Determine the kind of archive at `path` by looking at its content.
///
/// The file extension is ignored. Files too short for any signature are [`ArchiveKind::Unknown`].
pub fn sniff(path: &Path) -> Result<ArchiveKind, Exn<ErrorMessage>> {
    let err = || {
        let path = path.display();
        ErrorMessage::new(format!("Could not read the start of \"{path}\""))
    };

    let mut prefix = Vec::with_capacity(PREFIX_LEN as usize);
    File::open(path)
        .and_then(|file| file.take(PREFIX_LEN).read_to_end(&mut prefix))
        .or_raise(err)?;
    Ok(ArchiveKind::from_prefix(&prefix))
}
