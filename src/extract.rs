// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Secure archive extraction.
//!
//! Unpack uploaded or downloaded archives into an isolated cache folder. The
//! archive format is determined by content, so a tarball named `source.zip`
//! is still unpacked as a tarball. Supported containers are zip (including
//! jar and war), tar, ar, and newc cpio. Tar and cpio may arrive wrapped in
//! gzip or bzip2.
//!
//! # Path Safety
//!
//! Extraction happens in two passes over the archive. The first pass resolves
//! every entry name against the destination root and rejects the whole
//! archive with [`ExtractError::PathViolation`] if any entry would land
//! outside of it. Only then does the second pass write anything. Links and
//! device entries are never materialized.
//!
//! A failed extraction is never repaired. Callers must treat the destination
//! as unusable on error.

mod format;
mod walk;

pub use format::{detect_format, ArchiveFormat, ArchiveKind, Compression, CpioVariant};

use walk::{resolve_entry, ArchiveEntry, ArchiveSource, EntryKind};

use std::{
    fs::{create_dir_all, File},
    io::{copy, BufReader, Read},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Identify archive format of file at target path.
///
/// # Errors
///
/// - Return [`ExtractError::Read`] if the file cannot be opened.
/// - Return [`ExtractError::UnknownFormat`] if the file is not a supported
///   archive.
pub fn detect_file_format(path: impl AsRef<Path>) -> Result<ArchiveFormat> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| ExtractError::Read {
        source: err,
        path: path.to_path_buf(),
    })?;

    detect_format(BufReader::new(file))?.ok_or(ExtractError::UnknownFormat)
}

/// Extract archive file into destination root.
///
/// Destination root is created if missing. Returns the destination root.
///
/// # Errors
///
/// - Return [`ExtractError::UnknownFormat`] if the file is not a supported
///   archive.
/// - Return [`ExtractError::PathViolation`] if any entry escapes the
///   destination root, in which case nothing is written.
/// - Return [`ExtractError::Unsupported`] for odc or binary cpio archives.
/// - Return other [`ExtractError`] variants if the archive is corrupt, or
///   the destination cannot be written.
#[instrument(skip(source, destination), level = "debug")]
pub fn extract_file(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<PathBuf> {
    let source = source.as_ref();
    let destination = destination.as_ref();

    let format = detect_file_format(source)?;
    debug!("extract {format} archive {:?}", source.display());
    let archive = ArchiveSource::open(source, format)?;

    archive.walk(|entry: ArchiveEntry<'_>| {
        if entry.kind != EntryKind::Other {
            resolve_entry(destination, &entry.name)?;
        }
        Ok(())
    })?;

    create_dir_all(destination).map_err(|err| ExtractError::Write {
        source: err,
        path: destination.to_path_buf(),
    })?;

    let mut tally = Tally::default();
    archive.walk(|entry: ArchiveEntry<'_>| unpack(destination, entry, &mut tally))?;
    info!(
        "extracted {} files and {} directories into {:?}, skipped {} entries",
        tally.files,
        tally.directories,
        destination.display(),
        tally.skipped
    );

    Ok(destination.to_path_buf())
}

/// Extract archive byte stream into destination root.
///
/// The claimed file name is informational only. The stream is spooled into
/// a temporary file first, so zip archives can be read through their central
/// directory no matter how they arrived.
///
/// # Errors
///
/// - Return [`ExtractError::Io`] if the stream cannot be spooled.
/// - Return any error [`extract_file`] returns.
#[instrument(skip(reader, destination), level = "debug")]
pub fn extract_stream(
    mut reader: impl Read,
    claimed_name: &str,
    destination: impl AsRef<Path>,
) -> Result<PathBuf> {
    let mut spool = tempfile::NamedTempFile::new()?;
    let size = copy(&mut reader, spool.as_file_mut())?;
    debug!("spooled {size} bytes of {claimed_name:?}");

    extract_file(spool.path(), destination)
}

#[derive(Debug, Default)]
struct Tally {
    files: usize,
    directories: usize,
    skipped: usize,
}

fn unpack(root: &Path, entry: ArchiveEntry<'_>, tally: &mut Tally) -> Result<()> {
    let write_err = |err, path: &Path| ExtractError::Write {
        source: err,
        path: path.to_path_buf(),
    };

    match entry.kind {
        EntryKind::Directory => {
            let path = resolve_entry(root, &entry.name)?;
            create_dir_all(&path).map_err(|err| write_err(err, &path))?;
            tally.directories += 1;
        }
        EntryKind::File => {
            let path = resolve_entry(root, &entry.name)?;
            if path == root {
                warn!("skipping file entry without a name: {:?}", entry.name);
                tally.skipped += 1;
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                create_dir_all(parent).map_err(|err| write_err(err, parent))?;
            }
            let mut file = File::create(&path).map_err(|err| write_err(err, &path))?;
            copy(entry.data, &mut file)?;
            tally.files += 1;
        }
        EntryKind::Link => {
            warn!("skipping link entry {:?}", entry.name);
            tally.skipped += 1;
        }
        EntryKind::Other => {
            debug!("skipping special entry {:?}", entry.name);
            tally.skipped += 1;
        }
    }

    Ok(())
}

/// Extraction error types.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Content is not a recognized archive.
    #[error("unrecognized archive format")]
    UnknownFormat,

    /// Archive is recognized, but its variant cannot be unpacked.
    #[error("unsupported archive variant: {0}")]
    Unsupported(&'static str),

    /// Entry would land outside of destination root.
    #[error("archive entry {name:?} escapes the destination folder")]
    PathViolation { name: String },

    /// Archive file cannot be opened.
    #[error("failed to open archive {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Destination cannot be written.
    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive content is corrupt or truncated.
    #[error("failed to read archive content")]
    Io(#[from] std::io::Error),

    /// Zip central directory or entry is corrupt.
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

impl ExtractError {
    pub fn is_path_violation(&self) -> bool {
        matches!(self, Self::PathViolation { .. })
    }
}

/// Friendly result alias :3
pub type Result<T, E = ExtractError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{fs::read_to_string, io::Write};

    fn zip_fixture(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn tar_fixture(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, name, data.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    // INVARIANT: Raw header bypasses the builder's own path checks.
    fn raw_tar_fixture(name: &str, data: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, data.as_bytes()).unwrap();
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn bzip2(data: &[u8]) -> Vec<u8> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn ar_fixture(name: &str, data: &str) -> Vec<u8> {
        let mut builder = ar::Builder::new(Vec::new());
        let header = ar::Header::new(name.as_bytes().to_vec(), data.len() as u64);
        builder.append(&header, data.as_bytes()).unwrap();
        builder.into_inner().unwrap()
    }

    fn newc_fixture(entries: &[(&str, u32, &str)]) -> Vec<u8> {
        fn push_entry(out: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
            let fields = [0, mode as usize, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, name.len() + 1, 0];
            out.extend_from_slice(b"070701");
            for field in fields {
                out.extend_from_slice(format!("{field:08X}").as_bytes());
            }
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            while out.len() % 4 != 0 {
                out.push(0);
            }
            out.extend_from_slice(data);
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }

        let mut out = Vec::new();
        for (name, mode, data) in entries {
            push_entry(&mut out, name, *mode, data.as_bytes());
        }
        push_entry(&mut out, "TRAILER!!!", 0, &[]);
        out
    }

    #[test]
    fn detect_every_supported_kind() -> anyhow::Result<()> {
        let tar = tar_fixture(&[("a.txt", "a")]);
        let fixtures = [
            (zip_fixture(&[("a.txt", "a")]), ArchiveKind::Zip, Compression::None),
            (tar.clone(), ArchiveKind::Tar, Compression::None),
            (gzip(&tar), ArchiveKind::Tar, Compression::Gzip),
            (bzip2(&tar), ArchiveKind::Tar, Compression::Bzip2),
            (raw_tar_fixture("a.txt", "a"), ArchiveKind::Tar, Compression::None),
            (ar_fixture("a.o", "a"), ArchiveKind::Ar, Compression::None),
            (
                newc_fixture(&[("a.txt", 0o100_644, "a")]),
                ArchiveKind::Cpio(CpioVariant::Newc),
                Compression::None,
            ),
        ];

        for (data, kind, compression) in fixtures {
            let result = detect_format(data.as_slice())?;
            assert_eq!(result, Some(ArchiveFormat { compression, kind }));
        }

        Ok(())
    }

    #[test]
    fn plain_text_is_unknown_format() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("notes.zip");
        std::fs::write(&path, "these are not the archives you are looking for\n")?;

        let result = extract_file(&path, dir.path().join("out"));
        assert!(matches!(result, Err(ExtractError::UnknownFormat)));
        assert!(!dir.path().join("out").exists());

        Ok(())
    }

    #[test]
    fn extract_zip_stream() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = zip_fixture(&[("a/b.txt", "hello")]);

        let root = extract_stream(data.as_slice(), "source.zip", dir.path().join("out"))?;
        assert_eq!(read_to_string(root.join("a").join("b.txt"))?, "hello");

        Ok(())
    }

    #[test]
    fn extract_gzip_wrapped_zip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = gzip(&zip_fixture(&[("src/main.c", "int main() {}")]));

        let root = extract_stream(data.as_slice(), "source.zip.gz", dir.path().join("out"))?;
        assert_eq!(read_to_string(root.join("src/main.c"))?, "int main() {}");

        Ok(())
    }

    #[test]
    fn extract_tarball_regardless_of_claimed_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = gzip(&tar_fixture(&[("proj/README", "read me"), ("proj/src/lib.rs", "")]));

        let root = extract_stream(data.as_slice(), "release.zip", dir.path().join("out"))?;
        assert_eq!(read_to_string(root.join("proj/README"))?, "read me");
        assert!(root.join("proj/src/lib.rs").is_file());

        Ok(())
    }

    #[test]
    fn extract_ar_and_newc_cpio() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let data = ar_fixture("hello.txt", "hello");
        let root = extract_stream(data.as_slice(), "lib.a", dir.path().join("ar"))?;
        assert_eq!(read_to_string(root.join("hello.txt"))?, "hello");

        let data = newc_fixture(&[("a", 0o040_755, ""), ("a/b.txt", 0o100_644, "hello")]);
        let root = extract_stream(data.as_slice(), "image.cpio", dir.path().join("cpio"))?;
        assert_eq!(read_to_string(root.join("a/b.txt"))?, "hello");

        Ok(())
    }

    #[test]
    fn reject_parent_escape_before_writing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("base").join("dest");
        let mut data = tar_fixture(&[("ok.txt", "fine")]);
        // INVARIANT: Drop end-of-archive blocks so the raw entry follows.
        data.truncate(data.len() - 1024);
        data.extend(raw_tar_fixture("../../etc/passwd", "root:x:0:0"));

        let result = extract_stream(data.as_slice(), "evil.tar", &dest);
        assert!(result.is_err_and(|err| err.is_path_violation()));
        assert!(!dir.path().join("etc").exists());
        assert!(!dest.join("ok.txt").exists());

        Ok(())
    }

    #[test]
    fn reject_absolute_entry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = raw_tar_fixture("/etc/passwd", "root:x:0:0");

        let result = extract_stream(data.as_slice(), "evil.tar", dir.path().join("out"));
        assert!(result.is_err_and(|err| err.is_path_violation()));
        assert!(!dir.path().join("out").exists());

        Ok(())
    }

    #[test]
    fn reject_escaping_zip_entries_before_writing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        for (label, evil) in [("parent", "../x.txt"), ("absolute", "/etc/passwd")] {
            let dest = dir.path().join(label).join("dest");
            let data = zip_fixture(&[("ok.txt", "fine"), (evil, "gotcha")]);

            let result = extract_stream(data.as_slice(), "evil.zip", &dest);
            assert!(result.is_err_and(|err| err.is_path_violation()), "{label}");
            assert!(!dest.exists(), "{label}");
            assert!(!dir.path().join(label).join("x.txt").exists(), "{label}");
        }

        Ok(())
    }

    #[test]
    fn skip_link_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, "passwd", "/etc/passwd")?;
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        builder.append_data(&mut header, "kept.txt", &b"ok"[..])?;
        let data = builder.into_inner()?;

        let root = extract_stream(data.as_slice(), "links.tar", dir.path().join("out"))?;
        assert!(root.join("passwd").symlink_metadata().is_err());
        assert_eq!(read_to_string(root.join("kept.txt"))?, "ok");

        Ok(())
    }

    #[test]
    fn odc_cpio_is_unsupported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut data = b"070707".to_vec();
        data.extend_from_slice(&[b'0'; 70]);

        let result = extract_stream(data.as_slice(), "old.cpio", dir.path().join("out"));
        assert!(matches!(result, Err(ExtractError::Unsupported(_))));

        Ok(())
    }
}
