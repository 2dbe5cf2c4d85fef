//! Helpers to create and inspect archives in tests.

use std::fs::{self, File};
use std::io::{Read as _, Write as _};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// A member read back from a Zip archive.
#[derive(Debug)]
pub struct Member {
    /// The stored member name.
    pub name: String,
    /// How the member is compressed.
    pub method: CompressionMethod,
    /// The uncompressed content.
    pub content: Vec<u8>,
}

/// Write a Zip archive at `path` with the given members, in the given order.
pub fn zip_archive(path: &Path, entries: &[(&str, &[u8])], method: CompressionMethod) {
    let file = File::create(path).unwrap();
    let mut zipper = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(method);
    for (name, content) in entries {
        zipper.start_file(*name, options).unwrap();
        zipper.write_all(content).unwrap();
    }
    zipper.finish().unwrap();
}

/// Read all members of the Zip archive at `path`, in archive order.
pub fn read_members(path: &Path) -> Vec<Member> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|index| {
            let mut entry = archive.by_index(index).unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            Member {
                name: entry.name().to_owned(),
                method: entry.compression(),
                content,
            }
        })
        .collect()
}

/// Count the entries left in `dir`, or zero if it is gone.
pub fn leftovers(dir: &Path) -> usize {
    fs::read_dir(dir).map_or(0, Iterator::count)
}

/// Flip the first byte of the first occurrence of `needle` in the file at `path`.
///
/// Used on stored members to break their checksum while leaving all headers intact.
pub fn corrupt(path: &Path, needle: &[u8]) {
    let mut bytes = fs::read(path).unwrap();
    let at = bytes
        .windows(needle.len())
        .position(|window| window == needle)
        .expect("needle must occur in the file");
    bytes[at] ^= 0xff;
    fs::write(path, bytes).unwrap();
}

/// Write a RAR 4 archive at `path` that stores the given members uncompressed.
///
/// Names must be ASCII; RAR 4 needs a separate encoding for anything else.
pub fn rar4_archive(path: &Path, entries: &[(&str, &[u8])]) {
    /// Marks a header followed by a data area.
    const LONG_BLOCK: u16 = 0x8000;
    /// Unix, so that `/` is taken as path separator.
    const HOST_OS_UNIX: u8 = 3;
    /// RAR 2.9 is the oldest version needed to unpack.
    const UNPACK_VERSION: u8 = 29;
    /// Members are stored.
    const METHOD_STORE: u8 = 0x30;
    /// 2020-01-01 00:00:00 in MS-DOS format.
    const DOS_TIME: u32 = 0x5021_0000;
    /// A regular file with mode 0644.
    const UNIX_FILE_ATTR: u32 = 0o100_644;

    let mut out = b"Rar!\x1a\x07\x00".to_vec();
    // main archive header: two reserved fields after the common header
    out.extend(block(0x73, 0, &[0; 6]));

    for (name, content) in entries {
        assert!(name.is_ascii(), "rar fixtures only support ascii names");
        let size = u32::try_from(content.len()).unwrap();
        let name_len = u16::try_from(name.len()).unwrap();

        let mut fields = Vec::new();
        fields.extend(size.to_le_bytes()); // packed size
        fields.extend(size.to_le_bytes()); // unpacked size
        fields.push(HOST_OS_UNIX);
        fields.extend(crc32fast::hash(content).to_le_bytes());
        fields.extend(DOS_TIME.to_le_bytes());
        fields.push(UNPACK_VERSION);
        fields.push(METHOD_STORE);
        fields.extend(name_len.to_le_bytes());
        fields.extend(UNIX_FILE_ATTR.to_le_bytes());
        fields.extend(name.as_bytes());

        out.extend(block(0x74, LONG_BLOCK, &fields));
        out.extend(*content);
    }

    out.extend(block(0x7b, 0x4000, &[]));
    fs::write(path, out).unwrap();
}

/// A RAR 4 block header: checksum, type, flags, size and the type specific `fields`.
fn block(kind: u8, flags: u16, fields: &[u8]) -> Vec<u8> {
    let size = u16::try_from(7 + fields.len()).unwrap();

    let mut checked = vec![kind];
    checked.extend(flags.to_le_bytes());
    checked.extend(size.to_le_bytes());
    checked.extend(fields);

    // only the lower half of the checksum is stored
    let head_crc = (crc32fast::hash(&checked) & 0xffff) as u16;
    let mut header = head_crc.to_le_bytes().to_vec();
    header.extend(checked);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rar_blocks_have_known_checksums() {
        // the well-known main and end headers of archives written by WinRAR
        assert_eq!(block(0x73, 0, &[0; 6]), b"\xcf\x90\x73\x00\x00\x0d\x00\x00\x00\x00\x00\x00\x00");
        assert_eq!(block(0x7b, 0x4000, &[]), b"\xc4\x3d\x7b\x00\x40\x07\x00");
    }
}
