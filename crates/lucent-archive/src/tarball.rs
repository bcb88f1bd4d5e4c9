//! Tape-archive access for tensor bundles
//!
//! Headers, GNU long names and pax records are handled by the `tar` crate.
//! This module narrows its entries down to regular files whose payload is
//! read in full and checked against the declared size.

use crate::{ArchiveError, Result};
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Archive, Builder, Entries, Entry, EntryType, Header};

/// Archive block size in bytes
pub const BLOCK_SIZE: u64 = 512;

/// One regular-file entry with its payload
#[derive(Debug, Clone)]
pub struct TarEntry {
    /// Entry path inside the archive
    pub name: String,
    /// Payload, exactly the declared size
    pub data: Bytes,
}

impl TarEntry {
    /// Payload size
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// File-name suffix without the dot
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name).extension().and_then(|e| e.to_str())
    }
}

/// Reader over the regular-file entries of an archive.
pub struct TarReader<R: Read> {
    archive: Archive<R>,
}

impl<R: Read> TarReader<R> {
    /// Wrap a byte source positioned at the first header.
    pub fn new(reader: R) -> Self {
        Self {
            archive: Archive::new(reader),
        }
    }

    /// Iterate entries in archive order. Iteration stops after the first error.
    pub fn entries(&mut self) -> Result<TarEntries<'_, R>> {
        Ok(TarEntries {
            inner: self.archive.entries()?,
            next_header: 0,
            failed: false,
        })
    }
}

/// Iterator returned by [`TarReader::entries`]
pub struct TarEntries<'a, R: 'a + Read> {
    inner: Entries<'a, R>,
    next_header: u64,
    failed: bool,
}

impl<'a, R: 'a + Read> Iterator for TarEntries<'a, R> {
    type Item = Result<TarEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = match self.inner.next()? {
            Ok(entry) => self.read_entry(entry),
            Err(e) => Err(ArchiveError::MalformedHeader {
                offset: self.next_header,
                reason: e.to_string(),
            }),
        };
        self.failed = result.is_err();
        Some(result)
    }
}

impl<'a, R: 'a + Read> TarEntries<'a, R> {
    fn read_entry(&mut self, mut entry: Entry<'a, R>) -> Result<TarEntry> {
        let header_offset = entry.raw_header_position();
        let name = entry.path()?.to_string_lossy().into_owned();

        let entry_type = entry.header().entry_type();
        if !entry_type.is_file() {
            return Err(ArchiveError::UnsupportedEntryType {
                entry: name,
                type_flag: entry_type.as_byte() as char,
            });
        }

        let declared = entry
            .header()
            .size()
            .map_err(|e| ArchiveError::MalformedHeader {
                offset: header_offset,
                reason: format!("invalid size field for {name}: {e}"),
            })?;

        // The declared size is untrusted; let the payload bound the buffer.
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        if data.len() as u64 != declared {
            return Err(ArchiveError::size_mismatch(
                name,
                usize::try_from(declared).unwrap_or(usize::MAX),
                data.len(),
            ));
        }

        self.next_header = entry
            .raw_file_position()
            .saturating_add(padded_len(declared));
        Ok(TarEntry {
            name,
            data: Bytes::from(data),
        })
    }
}

fn padded_len(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE).saturating_mul(BLOCK_SIZE)
}

/// Writer producing archives the reader accepts.
pub struct TarWriter<W: Write> {
    builder: Builder<W>,
}

impl<W: Write> TarWriter<W> {
    /// Wrap a byte sink.
    pub fn new(writer: W) -> Self {
        Self {
            builder: Builder::new(writer),
        }
    }

    /// Append a regular file.
    pub fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        self.append_with_type(name, data, EntryType::Regular)
    }

    /// Append an entry with an explicit type.
    pub fn append_with_type(
        &mut self,
        name: &str,
        data: &[u8],
        entry_type: EntryType,
    ) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(entry_type);
        self.builder.append_data(&mut header, name, data)
    }

    /// Write the end marker and return the sink.
    pub fn finish(self) -> io::Result<W> {
        self.builder.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = TarWriter::new(Vec::new());
        for (name, data) in entries {
            writer.append(name, data).unwrap();
        }
        writer.finish().unwrap()
    }

    fn read_all(bytes: Vec<u8>) -> Vec<Result<TarEntry>> {
        let mut reader = TarReader::new(Cursor::new(bytes));
        reader.entries().unwrap().collect()
    }

    fn first_error(bytes: Vec<u8>) -> ArchiveError {
        read_all(bytes)
            .into_iter()
            .find_map(|r| r.err())
            .expect("archive should fail to read")
    }

    /// Regular-file header with a raw size field.
    fn header_with_size_field(name: &str, size_field: [u8; 12]) -> Vec<u8> {
        let mut header = Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.as_old_mut().size = size_field;
        header.set_cksum();
        header.as_bytes().to_vec()
    }

    #[test]
    fn test_layout_is_block_aligned() {
        let bytes = archive(&[("a.txt", b"hello")]);
        assert_eq!(bytes.len() as u64 % BLOCK_SIZE, 0);
        assert_eq!(bytes[156], b'0');
    }

    #[test]
    fn test_read_entries_in_order() {
        let entries: Vec<TarEntry> = read_all(archive(&[("a.txt", b"hello"), ("b.bin", &[7u8; 600])]))
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(&entries[0].data[..], b"hello");
        assert_eq!(entries[1].size(), 600);
        assert_eq!(entries[1].extension(), Some("bin"));
    }

    #[test]
    fn test_empty_archive() {
        let bytes = TarWriter::new(Vec::new()).finish().unwrap();
        assert!(read_all(bytes).is_empty());
        assert!(read_all(Vec::new()).is_empty());
    }

    #[test]
    fn test_exact_block_payload() {
        let names: Vec<String> = read_all(archive(&[("x.bin", &[1u8; 512]), ("y.bin", b"z")]))
            .into_iter()
            .map(|e| e.unwrap().name)
            .collect();
        assert_eq!(names, vec!["x.bin", "y.bin"]);
    }

    #[test]
    fn test_long_names_survive() {
        let long = format!("{}/latents.rand", "nested".repeat(20));
        let entries = read_all(archive(&[(&long, b"x")]));
        assert_eq!(entries[0].as_ref().unwrap().name, long);
    }

    #[test]
    fn test_rejects_non_regular_entries() {
        let mut writer = TarWriter::new(Vec::new());
        writer
            .append_with_type("dir", &[], EntryType::Directory)
            .unwrap();
        let err = first_error(writer.finish().unwrap());
        assert!(matches!(
            err,
            ArchiveError::UnsupportedEntryType { type_flag: '5', .. }
        ));
    }

    #[test]
    fn test_accepts_nul_type_flag() {
        let mut header = Header::new_gnu();
        header.set_path("old.txt").unwrap();
        header.set_mode(0o644);
        header.set_size(1);
        header.as_old_mut().linkflag = [0];
        header.set_cksum();

        let mut bytes = header.as_bytes().to_vec();
        let mut block = [0u8; 512];
        block[0] = b'x';
        bytes.extend_from_slice(&block);
        bytes.extend_from_slice(&[0u8; 1024]);

        let entries = read_all(bytes);
        let entry = entries[0].as_ref().unwrap();
        assert_eq!(entry.name, "old.txt");
        assert_eq!(&entry.data[..], b"x");
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = archive(&[("a.bin", &[3u8; 100])]);
        bytes.truncate(BLOCK_SIZE as usize + 40);
        let err = first_error(bytes);
        assert!(matches!(
            err,
            ArchiveError::SizeMismatch {
                declared: 100,
                consumed: 40,
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = archive(&[("a.bin", b"1")]);
        let err = first_error(bytes[..200].to_vec());
        assert!(matches!(err, ArchiveError::MalformedHeader { offset: 0, .. }));
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut bytes = archive(&[("a.bin", b"1")]);
        bytes[0] = b'b';
        assert!(matches!(
            first_error(bytes),
            ArchiveError::MalformedHeader { .. }
        ));
    }

    #[test]
    fn test_huge_binary_size_is_an_error() {
        // GNU base-256 size of 2^64 - 1
        let mut size_field = [0xffu8; 12];
        size_field[..4].copy_from_slice(&[0x80, 0, 0, 0]);
        let mut bytes = header_with_size_field("big.rand", size_field);
        bytes.extend_from_slice(&[0u8; 1024]);

        let err = first_error(bytes);
        assert!(err.is_integrity_error(), "unexpected error: {err}");
    }

    #[test]
    fn test_size_beyond_input_is_a_mismatch() {
        // Octal 2 GiB with a single data block behind it
        let mut bytes = header_with_size_field("big.ts", *b"20000000000\0");
        bytes.extend_from_slice(&[9u8; 512]);

        let err = first_error(bytes);
        assert!(matches!(
            err,
            ArchiveError::SizeMismatch {
                declared: 0x8000_0000,
                consumed: 512,
                ..
            }
        ));
    }

    #[test]
    fn test_iteration_stops_after_error() {
        let mut writer = TarWriter::new(Vec::new());
        writer
            .append_with_type("link", &[], EntryType::Symlink)
            .unwrap();
        writer.append("after.txt", b"x").unwrap();

        let results = read_all(writer.finish().unwrap());
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
