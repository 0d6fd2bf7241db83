//! Self-describing credential trailer for packages.
//!
//! # Grammar
//!
//! ```text
//! package = archive-bytes [ json-bytes '\n' decimal-length ]
//! ```
//!
//! `decimal-length` is the ASCII byte length of `json-bytes` and runs to end
//! of file with no terminator. There is no leading magic: a trailer is found
//! by scanning backwards from EOF for the newline that ends the JSON record.
//! The JSON must therefore never contain a raw newline byte, which compact
//! `serde_json` output guarantees (string newlines are escaped).
//!
//! Extraction is all-or-nothing: the record is parsed completely before the
//! file is truncated back to its pre-append length.

use crate::crypto::CryptoData;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Reverse scan window.
const SCAN_CHUNK: usize = 4096;

/// More digits than any real file length could need.
const MAX_LENGTH_DIGITS: usize = 20;

#[derive(Debug, Error)]
pub enum TrailerError {
    #[error("corrupt trailer in {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("trailer JSON must not contain a raw newline")]
    EmbeddedNewline,

    #[error("failed to serialize trailer: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TrailerError {
    pub fn exit_code(&self) -> i32 {
        if self.is_corrupt() {
            4
        } else {
            7
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Append `data` as a trailer to the file at `package`.
pub fn append_trailer(package: &Path, data: &CryptoData) -> Result<(), TrailerError> {
    let json = serde_json::to_vec(data)?;
    if json.contains(&b'\n') {
        return Err(TrailerError::EmbeddedNewline);
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(package)
        .map_err(TrailerError::io(package))?;

    let mut record = json;
    record.push(b'\n');
    record.extend_from_slice((record.len() - 1).to_string().as_bytes());

    file.write_all(&record).map_err(TrailerError::io(package))?;
    file.sync_all().map_err(TrailerError::io(package))?;

    tracing::debug!(package = %package.display(), bytes = record.len(), "appended trailer");
    Ok(())
}

/// Remove the trailer from `package` and return the credentials it carried.
///
/// On success the file is byte-for-byte what it was before
/// [`append_trailer`]. On error the file is left untouched.
pub fn extract_trailer(package: &Path) -> Result<CryptoData, TrailerError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(package)
        .map_err(TrailerError::io(package))?;

    let (data, original_len) = parse_trailer(&mut file, package)?;

    file.set_len(original_len).map_err(TrailerError::io(package))?;
    file.sync_all().map_err(TrailerError::io(package))?;

    tracing::debug!(
        package = %package.display(),
        restored_len = original_len,
        "extracted trailer"
    );
    Ok(data)
}

/// Locate and decode the trailer without modifying the file.
///
/// Returns the credentials and the offset where the JSON record starts,
/// i.e. the length of the package without its trailer.
pub fn read_trailer(package: &Path) -> Result<(CryptoData, u64), TrailerError> {
    let mut file = File::open(package).map_err(TrailerError::io(package))?;
    parse_trailer(&mut file, package)
}

fn parse_trailer(file: &mut File, path: &Path) -> Result<(CryptoData, u64), TrailerError> {
    let file_len = file.metadata().map_err(TrailerError::io(path))?.len();
    let (length, newline_pos) = scan_length_field(file, file_len, path)?;

    let json_start = newline_pos
        .checked_sub(length)
        .ok_or_else(|| {
            TrailerError::corrupt(
                path,
                format!("length field {length} exceeds the {newline_pos} bytes before it"),
            )
        })?;

    let mut json = vec![0u8; length as usize];
    file.seek(SeekFrom::Start(json_start))
        .map_err(TrailerError::io(path))?;
    file.read_exact(&mut json).map_err(TrailerError::io(path))?;

    let data: CryptoData = serde_json::from_slice(&json)
        .map_err(|e| TrailerError::corrupt(path, format!("invalid trailer JSON: {e}")))?;

    Ok((data, json_start))
}

/// Scan backwards from EOF for the `'\n'` ending the JSON record,
/// accumulating the decimal length that follows it.
///
/// Returns `(length, offset_of_newline)`.
fn scan_length_field(
    file: &mut File,
    file_len: u64,
    path: &Path,
) -> Result<(u64, u64), TrailerError> {
    // Digits in reverse order, as encountered.
    let mut digits: Vec<u8> = Vec::new();
    let mut end = file_len;
    let mut buf = vec![0u8; SCAN_CHUNK];

    while end > 0 {
        let start = end.saturating_sub(SCAN_CHUNK as u64);
        let window = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .map_err(TrailerError::io(path))?;
        file.read_exact(window).map_err(TrailerError::io(path))?;

        for (i, &byte) in window.iter().enumerate().rev() {
            match byte {
                b'\n' => {
                    if digits.is_empty() {
                        return Err(TrailerError::corrupt(path, "empty length field"));
                    }
                    digits.reverse();
                    let length = parse_digits(&digits, path)?;
                    return Ok((length, start + i as u64));
                }
                b'0'..=b'9' => {
                    if digits.len() == MAX_LENGTH_DIGITS {
                        return Err(TrailerError::corrupt(path, "length field too long"));
                    }
                    digits.push(byte);
                }
                other => {
                    return Err(TrailerError::corrupt(
                        path,
                        format!("unexpected byte 0x{other:02x} in length field"),
                    ));
                }
            }
        }
        end = start;
    }

    Err(TrailerError::corrupt(path, "no trailer record found"))
}

fn parse_digits(digits: &[u8], path: &Path) -> Result<u64, TrailerError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| TrailerError::corrupt(path, "length field out of range"))
}
