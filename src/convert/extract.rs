//! Extraction of RAR and Zip archives into a scratch directory.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use exn::{Exn, bail};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::convert::scratch::ScratchDir;
use crate::convert::sniff::ArchiveKind;
use crate::error::{ExtractionError, zip_cause};

/// The extracted members of an archive.
///
/// Owns the scratch directory holding the files; dropping the tree deletes them.
#[derive(Debug)]
pub struct ExtractedTree {
    /// The directory the members were written to.
    dir: ScratchDir,
    /// Relative member paths, `/`-separated and sorted.
    members: BTreeSet<String>,
}

impl ExtractedTree {
    /// Iterate over the relative member paths in lexicographic order.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    /// Number of extracted members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// The on-disk location of a member.
    pub fn file(&self, member: &str) -> PathBuf {
        self.dir.path().join(member)
    }
}

/// Extract all members of the archive at `path`, treating it as an archive of `kind`.
///
/// Broken members are skipped with a warning. The extraction only fails if the archive cannot
/// be opened at all or if not a single member could be extracted. On failure, `dir` is dropped
/// and with it everything extracted so far.
pub fn extract(
    path: &Path,
    kind: ArchiveKind,
    dir: ScratchDir,
) -> Result<ExtractedTree, Exn<ExtractionError>> {
    debug!("extracting {path:?} as {kind} into {:?}", dir.path());

    let members = match kind {
        ArchiveKind::ZipLike => extract_zip(path, dir.path())?,
        ArchiveKind::RarLike => extract_rar(path, dir.path())?,
        ArchiveKind::Unknown => {
            let path = path.display();
            let msg = format!("Cannot extract \"{path}\": unsupported archive kind");
            bail!(ExtractionError::new(msg))
        }
    };

    if members.is_empty() {
        let path = path.display();
        let msg = format!("No member of the {kind} archive \"{path}\" could be extracted");
        bail!(ExtractionError::new(msg))
    }
    Ok(ExtractedTree { dir, members })
}

/// Extract every file of a Zip archive, one member at a time.
fn extract_zip(path: &Path, root: &Path) -> Result<BTreeSet<String>, Exn<ExtractionError>> {
    let shown = path.display();

    let file = File::open(path)
        .map_err(|e| ExtractionError::new(format!("Cannot open \"{shown}\": {e}")))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| {
        let cause = zip_cause(&e);
        ExtractionError::new(format!("Cannot read \"{shown}\" as zip archive: {cause}"))
    })?;

    let mut members = BTreeSet::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                let cause = zip_cause(&e);
                warn!("skipping member #{index} of \"{shown}\": {cause}");
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }

        let name = decode_member_name(entry.name_raw(), entry.name());
        let Some(member) = normalize_member_path(&name) else {
            warn!("skipping member \"{name}\" of \"{shown}\": unsafe path");
            continue;
        };

        match write_member(&root.join(&member), &mut entry) {
            Ok(()) => {
                members.insert(member);
            }
            Err(e) => warn!("skipping member \"{name}\" of \"{shown}\": {e}"),
        }
    }
    Ok(members)
}

/// Extract every file of a RAR archive.
///
/// Unlike Zip, the entries of a RAR archive can only be read in sequence. After a broken entry
/// we cannot continue, so we keep what we got so far.
fn extract_rar(path: &Path, root: &Path) -> Result<BTreeSet<String>, Exn<ExtractionError>> {
    let shown = path.display();

    let mut cursor = unrar::Archive::new(path)
        .open_for_processing()
        .map_err(|e| {
            ExtractionError::new(format!("Cannot read \"{shown}\" as rar archive: {e}"))
        })?;

    let mut members = BTreeSet::new();
    let stop = |members: &BTreeSet<String>, e: unrar::error::UnrarError| {
        let msg = format!("Error while reading rar archive \"{shown}\": {e}");
        if members.is_empty() {
            return Err(ExtractionError::new(msg));
        }
        warn!("{msg}, keeping {} extracted members", members.len());
        Ok(())
    };

    loop {
        let header = match cursor.read_header() {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(e) => {
                stop(&members, e)?;
                break;
            }
        };

        let entry = header.entry();
        let name = Path::new(&entry.filename).to_string_lossy().into_owned();
        let member = match entry.is_directory() {
            true => None,
            false => normalize_member_path(&name),
        };
        let Some(member) = member else {
            if !entry.is_directory() {
                warn!("skipping member \"{name}\" of \"{shown}\": unsafe path");
            }
            cursor = match header.skip() {
                Ok(next) => next,
                Err(e) => {
                    stop(&members, e)?;
                    break;
                }
            };
            continue;
        };

        let (data, next) = match header.read() {
            Ok(read) => read,
            Err(e) => {
                stop(&members, e)?;
                break;
            }
        };
        cursor = next;

        match write_member(&root.join(&member), &mut data.as_slice()) {
            Ok(()) => {
                members.insert(member);
            }
            Err(e) => warn!("skipping member \"{name}\" of \"{shown}\": {e}"),
        }
    }
    Ok(members)
}

/// Write the content of a single member to `target`.
///
/// A partially written file is removed again.
fn write_member(target: &Path, content: &mut impl io::Read) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let result = File::create(target).and_then(|mut file| io::copy(content, &mut file));
    if let Err(e) = result {
        let _ = fs::remove_file(target);
        return Err(e);
    }
    Ok(())
}

/// Turn the raw name of a Zip member into a string.
///
/// Many tools store UTF-8 names without setting the UTF-8 flag, so valid UTF-8 always wins.
/// Otherwise we trust the decoding of the zip library (CP437 for legacy archives), and as a last
/// resort replace undecodable bytes.
fn decode_member_name(raw: &[u8], declared: &str) -> String {
    if let Ok(name) = std::str::from_utf8(raw) {
        return name.to_owned();
    }
    if !declared.is_empty() {
        return declared.to_owned();
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Normalize a member name to a relative, `/`-separated path.
///
/// Returns `None` for names that would escape the extraction directory or are empty.
fn normalize_member_path(name: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if part.contains('\0') => return None,
            // drive prefixes like `C:` at the start of absolute windows paths
            part if parts.is_empty() && part.len() == 2 && part.ends_with(':') => continue,
            part => parts.push(part),
        }
    }
    match parts.is_empty() {
        true => None,
        false => Some(parts.join("/")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{corrupt, rar4_archive, zip_archive};
    use zip::CompressionMethod;

    fn scratch(root: &Path) -> ScratchDir {
        ScratchDir::create(root.join("scratch")).unwrap()
    }

    #[test]
    fn extracts_nested_zip_members() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.cbz");
        let entries = [("ch1/001.jpg", &b"one"[..]), ("ch1/002.jpg", b"two"), ("cover.png", b"c")];
        zip_archive(&archive, &entries, CompressionMethod::Deflated);

        let tree = extract(&archive, ArchiveKind::ZipLike, scratch(dir.path())).unwrap();
        let members: Vec<_> = tree.members().collect();
        assert_eq!(members, ["ch1/001.jpg", "ch1/002.jpg", "cover.png"]);
        assert_eq!(fs::read(tree.file("ch1/002.jpg")).unwrap(), b"two");
    }

    #[test]
    fn keeps_non_ascii_names() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("jp.cbz");
        let entries = [("第1話/ページ01.jpg", &b"p1"[..]), ("Über/ß.png", b"p2")];
        zip_archive(&archive, &entries, CompressionMethod::Stored);

        let tree = extract(&archive, ArchiveKind::ZipLike, scratch(dir.path())).unwrap();
        assert!(tree.members().any(|m| m == "第1話/ページ01.jpg"));
        assert!(tree.file("Über/ß.png").is_file());
    }

    #[test]
    fn extracts_rar_members() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("b.cbr");
        rar4_archive(&archive, &[("001.jpg", b"first"), ("002.jpg", b"second")]);

        let tree = extract(&archive, ArchiveKind::RarLike, scratch(dir.path())).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(fs::read(tree.file("002.jpg")).unwrap(), b"second");
    }

    #[test]
    fn wrong_kind_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.cbz");
        zip_archive(&archive, &[("1.jpg", b"x")], CompressionMethod::Stored);

        let scratch = scratch(dir.path());
        let scratch_path = scratch.path().to_path_buf();
        assert!(extract(&archive, ArchiveKind::RarLike, scratch).is_err());
        assert!(!scratch_path.exists(), "scratch dir must be removed on failure");
    }

    #[test]
    fn empty_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.cbz");
        zip_archive(&archive, &[], CompressionMethod::Stored);

        assert!(extract(&archive, ArchiveKind::ZipLike, scratch(dir.path())).is_err());
    }

    #[test]
    fn unknown_kind_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("x.cbz");
        fs::write(&archive, b"not an archive").unwrap();

        assert!(extract(&archive, ArchiveKind::Unknown, scratch(dir.path())).is_err());
    }

    #[test]
    fn unsafe_members_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.cbz");
        let entries = [("../escape.jpg", &b"bad"[..]), ("ok.jpg", b"good")];
        zip_archive(&archive, &entries, CompressionMethod::Stored);

        let tree = extract(&archive, ArchiveKind::ZipLike, scratch(dir.path())).unwrap();
        assert_eq!(tree.members().collect::<Vec<_>>(), ["ok.jpg"]);
        assert!(!dir.path().join("escape.jpg").exists());
    }

    #[test]
    fn corrupt_zip_member_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.cbz");
        let entries = [
            ("01.jpg", &b"first page"[..]),
            ("02.jpg", b"damaged page"),
            ("03.jpg", b"third"),
        ];
        zip_archive(&archive, &entries, CompressionMethod::Stored);
        corrupt(&archive, b"damaged page");

        let tree = extract(&archive, ArchiveKind::ZipLike, scratch(dir.path())).unwrap();
        assert_eq!(tree.members().collect::<Vec<_>>(), ["01.jpg", "03.jpg"]);
        assert!(!tree.file("02.jpg").exists(), "broken member must not stay on disk");
        assert_eq!(fs::read(tree.file("03.jpg")).unwrap(), b"third");
    }

    #[test]
    fn zip_with_only_corrupt_members_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.cbz");
        zip_archive(&archive, &[("01.jpg", b"damaged page")], CompressionMethod::Stored);
        corrupt(&archive, b"damaged page");

        assert!(extract(&archive, ArchiveKind::ZipLike, scratch(dir.path())).is_err());
    }

    #[test]
    fn rar_keeps_members_before_a_corrupt_one() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("b.cbr");
        let entries = [("01.jpg", &b"first page"[..]), ("02.jpg", b"damaged page")];
        rar4_archive(&archive, &entries);
        corrupt(&archive, b"damaged page");

        let tree = extract(&archive, ArchiveKind::RarLike, scratch(dir.path())).unwrap();
        assert_eq!(tree.members().collect::<Vec<_>>(), ["01.jpg"]);
        assert!(!tree.file("02.jpg").exists(), "broken member must not stay on disk");
    }

    #[test]
    fn member_names_are_normalized() {
        assert_eq!(normalize_member_path("a/b.jpg").as_deref(), Some("a/b.jpg"));
        assert_eq!(normalize_member_path("a\\b.jpg").as_deref(), Some("a/b.jpg"));
        assert_eq!(normalize_member_path("/abs/./b.jpg").as_deref(), Some("abs/b.jpg"));
        assert_eq!(normalize_member_path("C:\\x\\b.jpg").as_deref(), Some("x/b.jpg"));
        assert_eq!(normalize_member_path("a/../b.jpg"), None);
        assert_eq!(normalize_member_path("dir/"), Some("dir".to_owned()));
        assert_eq!(normalize_member_path("./"), None);
    }

    #[test]
    fn member_names_prefer_utf8() {
        let raw = "ページ.jpg".as_bytes();
        assert_eq!(decode_member_name(raw, "garbled"), "ページ.jpg");
        assert_eq!(decode_member_name(b"\x81\x40.jpg", "ü@.jpg"), "ü@.jpg");
        assert_eq!(decode_member_name(b"\xff.jpg", ""), "\u{fffd}.jpg");
    }
}
