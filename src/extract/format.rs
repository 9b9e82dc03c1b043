// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Archive format detection.
//!
//! Formats are identified by sniffing magic bytes, never by trusting the
//! claimed file extension. Compression wrappers (gzip, bzip2) are peeled off
//! first, and the container format is then sniffed from the head of the
//! decompressed stream.

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::{Cursor, Read},
};

/// Tar headers are one block long.
const BLOCK: usize = 512;

/// Compression wrapped around an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

/// Flavors of cpio archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpioVariant {
    /// SVR4 "newc" ASCII headers, with or without checksum.
    Newc,
    /// POSIX.1 "odc" portable ASCII headers.
    Odc,
    /// Old binary headers.
    Binary,
}

/// Container format of an archive.
///
/// Jar and war files are plain zip containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    Ar,
    Cpio(CpioVariant),
}

/// Fully identified archive format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveFormat {
    pub compression: Compression,
    pub kind: ArchiveKind,
}

impl Display for ArchiveFormat {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let kind = match self.kind {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Tar => "tar",
            ArchiveKind::Ar => "ar",
            ArchiveKind::Cpio(_) => "cpio",
        };
        match self.compression {
            Compression::None => write!(fmt, "{kind}"),
            Compression::Gzip => write!(fmt, "{kind}+gzip"),
            Compression::Bzip2 => write!(fmt, "{kind}+bzip2"),
        }
    }
}

/// Identify archive format of a byte stream.
///
/// Returns `Ok(None)` when the stream is readable but is not a supported
/// archive, e.g., a plain text file.
///
/// # Errors
///
/// - Return [`std::io::Error`] if the stream cannot be read, or its
///   compression wrapper is corrupt.
pub fn detect_format(mut reader: impl Read) -> std::io::Result<Option<ArchiveFormat>> {
    let raw = read_head(&mut reader)?;
    let compression = sniff_compression(&raw);
    let head = match compression {
        Compression::None => raw,
        Compression::Gzip => read_head(MultiGzDecoder::new(Cursor::new(raw).chain(reader)))?,
        Compression::Bzip2 => read_head(MultiBzDecoder::new(Cursor::new(raw).chain(reader)))?,
    };

    Ok(sniff_kind(&head).map(|kind| ArchiveFormat { compression, kind }))
}

/// Identify compression wrapper from leading bytes.
pub fn sniff_compression(head: &[u8]) -> Compression {
    if head.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if head.starts_with(b"BZh") {
        Compression::Bzip2
    } else {
        Compression::None
    }
}

/// Identify container format from leading bytes of an uncompressed stream.
pub fn sniff_kind(head: &[u8]) -> Option<ArchiveKind> {
    if head.starts_with(b"PK\x03\x04")
        || head.starts_with(b"PK\x05\x06")
        || head.starts_with(b"PK\x07\x08")
    {
        return Some(ArchiveKind::Zip);
    }

    if head.starts_with(b"!<arch>\n") {
        return Some(ArchiveKind::Ar);
    }

    if head.starts_with(b"070701") || head.starts_with(b"070702") {
        return Some(ArchiveKind::Cpio(CpioVariant::Newc));
    }

    if head.starts_with(b"070707") {
        return Some(ArchiveKind::Cpio(CpioVariant::Odc));
    }

    // INVARIANT: Binary cpio magic is 0o070707 in either byte order.
    if head.starts_with(&[0xc7, 0x71]) || head.starts_with(&[0x71, 0xc7]) {
        return Some(ArchiveKind::Cpio(CpioVariant::Binary));
    }

    if is_tar_header(head) {
        return Some(ArchiveKind::Tar);
    }

    None
}

/// Check for ustar magic, or failing that, a valid v7 header checksum.
fn is_tar_header(head: &[u8]) -> bool {
    if head.len() < BLOCK {
        return false;
    }

    if &head[257..262] == b"ustar" {
        return true;
    }

    if head[..BLOCK].iter().all(|byte| *byte == 0) {
        return false;
    }

    let Some(expect) = parse_octal(&head[148..156]) else {
        return false;
    };

    // INVARIANT: Checksum field counts as eight spaces.
    let result: u64 = head[..BLOCK]
        .iter()
        .enumerate()
        .map(|(idx, byte)| {
            if (148..156).contains(&idx) {
                u64::from(b' ')
            } else {
                u64::from(*byte)
            }
        })
        .sum();

    result == expect
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?;
    let text = text.trim_matches(|c: char| c == '\0' || c == ' ');
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 8).ok()
}

fn read_head(mut reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(BLOCK);
    reader.by_ref().take(BLOCK as u64).read_to_end(&mut head)?;
    Ok(head)
}
