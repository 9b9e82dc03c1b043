// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Uniform traversal of archive entries.
//!
//! Every supported container is walked the same way: each entry is handed to
//! a visitor with its raw name, its kind, and a reader over its content.
//! Entry names are never trusted, see [`resolve_entry`].

use super::{
    format::{ArchiveFormat, ArchiveKind, Compression, CpioVariant},
    ExtractError, Result,
};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::{
    ffi::OsStr,
    fs::File,
    io::{copy, BufReader, Read},
    path::{Component, Path, PathBuf},
};
use zip::ZipArchive;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EntryKind {
    Directory,
    File,
    /// Symbolic or hard link.
    Link,
    /// Devices, fifos, metadata records.
    Other,
}

pub(super) struct ArchiveEntry<'a> {
    pub(super) name: String,
    pub(super) kind: EntryKind,
    pub(super) data: &'a mut dyn Read,
}

/// Archive on disk that can be walked more than once.
pub(super) struct ArchiveSource<'p> {
    path: &'p Path,
    format: ArchiveFormat,

    // INVARIANT: Set only for zip archives that arrived compressed.
    inflated: Option<File>,
}

impl<'p> ArchiveSource<'p> {
    /// Prepare archive of known format for traversal.
    ///
    /// Zip archives need random access, so a compressed zip is inflated into
    /// an anonymous temporary file up front.
    pub(super) fn open(path: &'p Path, format: ArchiveFormat) -> Result<Self> {
        if matches!(format.kind, ArchiveKind::Cpio(variant) if variant != CpioVariant::Newc) {
            return Err(ExtractError::Unsupported("cpio without newc headers"));
        }

        let mut source = Self {
            path,
            format,
            inflated: None,
        };

        if format.kind == ArchiveKind::Zip && format.compression != Compression::None {
            let mut spool = tempfile::tempfile()?;
            copy(&mut source.stream()?, &mut spool)?;
            source.inflated = Some(spool);
        }

        Ok(source)
    }

    /// Hand every entry of the archive to target visitor in archive order.
    ///
    /// Stops at the first error the visitor returns.
    pub(super) fn walk<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(ArchiveEntry<'_>) -> Result<()>,
    {
        match self.format.kind {
            ArchiveKind::Zip => self.walk_zip(&mut visitor),
            ArchiveKind::Tar => walk_tar(self.stream()?, &mut visitor),
            ArchiveKind::Ar => walk_ar(self.stream()?, &mut visitor),
            ArchiveKind::Cpio(_) => walk_newc(self.stream()?, &mut visitor),
        }
    }

    fn stream(&self) -> Result<Box<dyn Read>> {
        let file = File::open(self.path).map_err(|err| ExtractError::Read {
            source: err,
            path: self.path.to_path_buf(),
        })?;
        let file = BufReader::new(file);

        Ok(match self.format.compression {
            Compression::None => Box::new(file),
            Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
            Compression::Bzip2 => Box::new(MultiBzDecoder::new(file)),
        })
    }

    fn walk_zip<F>(&self, visitor: &mut F) -> Result<()>
    where
        F: FnMut(ArchiveEntry<'_>) -> Result<()>,
    {
        let file = match &self.inflated {
            Some(spool) => spool.try_clone()?,
            None => File::open(self.path).map_err(|err| ExtractError::Read {
                source: err,
                path: self.path.to_path_buf(),
            })?,
        };

        let mut archive = ZipArchive::new(BufReader::new(file))?;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let name = entry.name().to_owned();
            let kind = if entry.is_dir() {
                EntryKind::Directory
            } else if entry.is_symlink() {
                EntryKind::Link
            } else {
                EntryKind::File
            };

            visitor(ArchiveEntry {
                name,
                kind,
                data: &mut entry,
            })?;
        }

        Ok(())
    }
}

fn walk_tar<F>(reader: Box<dyn Read>, visitor: &mut F) -> Result<()>
where
    F: FnMut(ArchiveEntry<'_>) -> Result<()>,
{
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();
        let kind = if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_file() || entry_type.is_contiguous() {
            EntryKind::File
        } else if entry_type.is_symlink() || entry_type.is_hard_link() {
            EntryKind::Link
        } else {
            EntryKind::Other
        };

        visitor(ArchiveEntry {
            name,
            kind,
            data: &mut entry,
        })?;
    }

    Ok(())
}

fn walk_ar<F>(reader: Box<dyn Read>, visitor: &mut F) -> Result<()>
where
    F: FnMut(ArchiveEntry<'_>) -> Result<()>,
{
    let mut archive = ar::Archive::new(reader);
    while let Some(entry) = archive.next_entry() {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(entry.header().identifier()).into_owned();

        // INVARIANT: Symbol and name tables are archive metadata, not members.
        let kind = if name.is_empty() || name == "/" || name == "//" || name.starts_with("__.SYMDEF")
        {
            EntryKind::Other
        } else {
            EntryKind::File
        };

        visitor(ArchiveEntry {
            name,
            kind,
            data: &mut entry,
        })?;
    }

    Ok(())
}

fn walk_newc<F>(mut reader: Box<dyn Read>, visitor: &mut F) -> Result<()>
where
    F: FnMut(ArchiveEntry<'_>) -> Result<()>,
{
    loop {
        let mut entry = cpio::newc::Reader::new(reader)?;
        if entry.entry().is_trailer() {
            break;
        }

        let name = entry.entry().name().to_owned();
        let kind = match entry.entry().mode() & S_IFMT {
            S_IFDIR => EntryKind::Directory,
            S_IFREG => EntryKind::File,
            S_IFLNK => EntryKind::Link,
            _ => EntryKind::Other,
        };

        visitor(ArchiveEntry {
            name,
            kind,
            data: &mut entry,
        })?;
        reader = entry.finish()?;
    }

    Ok(())
}

/// Resolve archive entry name against destination root.
///
/// Resolution is purely lexical. Backslashes count as separators. Names that
/// are absolute, or whose `..` components climb above the root, are rejected.
/// A name that resolves to the root itself is allowed.
///
/// # Errors
///
/// - Return [`ExtractError::PathViolation`] if the name escapes the root.
pub(super) fn resolve_entry(root: &Path, name: &str) -> Result<PathBuf> {
    let violation = || ExtractError::PathViolation {
        name: name.to_string(),
    };

    let unified = name.replace('\\', "/");
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err(violation()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop().ok_or_else(violation)?;
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    Ok(parts
        .into_iter()
        .fold(root.to_path_buf(), |path, part| path.join(part)))
}
