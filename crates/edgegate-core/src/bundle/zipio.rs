//! Minimal deterministic zip encoding for evidence bundles.
//!
//! Evidence bundles must be byte-reproducible: the same inputs yield the
//! same archive, so hashes of bundles are meaningful. General-purpose zip
//! writers embed timestamps and vary compression output, so bundles use a
//! purpose-built encoder: stored entries only (no compression), a fixed
//! DOS timestamp, and entries written in the order given.
//!
//! The matching reader handles exactly what the writer produces - stored
//! entries walked sequentially - plus enough validation to reject
//! truncated or non-stored archives.

use thiserror::Error;

/// Fixed DOS date stamped into every entry: 1980-01-01 00:00:00, the zip
/// epoch.
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = 0x0021;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_SIG: u32 = 0x0605_4b50;

/// Errors from zip decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ZipError {
    /// The archive is truncated or malformed.
    #[error("malformed zip: {message}")]
    Malformed {
        /// What was wrong.
        message: String,
    },

    /// An entry uses a compression method the reader does not handle.
    #[error("unsupported compression method {method} for entry {name}")]
    UnsupportedMethod {
        /// The entry name.
        name: String,
        /// The method id found.
        method: u16,
    },

    /// An entry's CRC-32 does not match its content.
    #[error("crc mismatch for entry {name}")]
    CrcMismatch {
        /// The entry name.
        name: String,
    },
}

/// Writes a deterministic stored zip from ordered `(name, bytes)` entries.
#[must_use]
pub fn write_zip(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();

    for (name, bytes) in entries {
        let offset = u32::try_from(out.len()).expect("bundle under 4 GB");
        let crc = crc32(bytes);
        let name_bytes = name.as_bytes();
        let size = u32::try_from(bytes.len()).expect("entry under 4 GB");

        // Local file header.
        put_u32(&mut out, LOCAL_HEADER_SIG);
        put_u16(&mut out, 20); // version needed
        put_u16(&mut out, 0); // flags
        put_u16(&mut out, 0); // method: stored
        put_u16(&mut out, DOS_TIME);
        put_u16(&mut out, DOS_DATE);
        put_u32(&mut out, crc);
        put_u32(&mut out, size);
        put_u32(&mut out, size);
        put_u16(&mut out, u16::try_from(name_bytes.len()).expect("name fits"));
        put_u16(&mut out, 0); // extra len
        out.extend_from_slice(name_bytes);
        out.extend_from_slice(bytes);

        // Central directory record.
        put_u32(&mut central, CENTRAL_HEADER_SIG);
        put_u16(&mut central, 20); // version made by
        put_u16(&mut central, 20); // version needed
        put_u16(&mut central, 0);
        put_u16(&mut central, 0);
        put_u16(&mut central, DOS_TIME);
        put_u16(&mut central, DOS_DATE);
        put_u32(&mut central, crc);
        put_u32(&mut central, size);
        put_u32(&mut central, size);
        put_u16(&mut central, u16::try_from(name_bytes.len()).expect("name fits"));
        put_u16(&mut central, 0); // extra
        put_u16(&mut central, 0); // comment
        put_u16(&mut central, 0); // disk start
        put_u16(&mut central, 0); // internal attrs
        put_u32(&mut central, 0); // external attrs
        put_u32(&mut central, offset);
        central.extend_from_slice(name_bytes);
    }

    let central_offset = u32::try_from(out.len()).expect("bundle under 4 GB");
    let central_size = u32::try_from(central.len()).expect("directory fits");
    let count = u16::try_from(entries.len()).expect("entry count fits");
    out.extend_from_slice(&central);

    // End of central directory.
    put_u32(&mut out, END_OF_CENTRAL_SIG);
    put_u16(&mut out, 0); // disk
    put_u16(&mut out, 0); // central dir disk
    put_u16(&mut out, count);
    put_u16(&mut out, count);
    put_u32(&mut out, central_size);
    put_u32(&mut out, central_offset);
    put_u16(&mut out, 0); // comment len

    out
}

/// Reads all entries of a stored zip in file order.
///
/// # Errors
///
/// Returns [`ZipError`] for malformed, compressed, or corrupt archives.
pub fn read_zip(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, ZipError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + 4 <= bytes.len() {
        let sig = get_u32(bytes, pos)?;
        if sig != LOCAL_HEADER_SIG {
            // First non-local record starts the central directory.
            break;
        }
        if pos + 30 > bytes.len() {
            return Err(truncated("local header"));
        }
        let method = get_u16(bytes, pos + 8)?;
        let crc = get_u32(bytes, pos + 14)?;
        let comp_size = get_u32(bytes, pos + 18)? as usize;
        let uncomp_size = get_u32(bytes, pos + 22)? as usize;
        let name_len = get_u16(bytes, pos + 26)? as usize;
        let extra_len = get_u16(bytes, pos + 28)? as usize;

        let name_start = pos + 30;
        let data_start = name_start + name_len + extra_len;
        let data_end = data_start + comp_size;
        if data_end > bytes.len() {
            return Err(truncated("entry data"));
        }

        let name = String::from_utf8(bytes[name_start..name_start + name_len].to_vec())
            .map_err(|_| ZipError::Malformed {
                message: "entry name is not UTF-8".to_string(),
            })?;

        if method != 0 || comp_size != uncomp_size {
            return Err(ZipError::UnsupportedMethod { name, method });
        }

        let data = bytes[data_start..data_end].to_vec();
        if crc32(&data) != crc {
            return Err(ZipError::CrcMismatch { name });
        }

        entries.push((name, data));
        pos = data_end;
    }

    if entries.is_empty() && !bytes.is_empty() {
        return Err(ZipError::Malformed {
            message: "no local file headers found".to_string(),
        });
    }
    Ok(entries)
}

fn truncated(what: &str) -> ZipError {
    ZipError::Malformed {
        message: format!("truncated {what}"),
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn get_u16(bytes: &[u8], pos: usize) -> Result<u16, ZipError> {
    bytes
        .get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| truncated("u16 field"))
}

fn get_u32(bytes: &[u8], pos: usize) -> Result<u32, ZipError> {
    bytes
        .get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| truncated("u32 field"))
}

/// CRC-32 (IEEE 802.3), bitwise implementation. Bundle entries are small
/// enough that a table is not worth carrying.
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<(String, Vec<u8>)> {
        vec![
            ("summary.json".to_string(), br#"{"a":1}"#.to_vec()),
            ("raw/payload.json".to_string(), b"payload bytes".to_vec()),
        ]
    }

    #[test]
    fn test_round_trip() {
        let entries = sample_entries();
        let zip = write_zip(&entries);
        assert_eq!(read_zip(&zip).unwrap(), entries);
    }

    #[test]
    fn test_deterministic() {
        let entries = sample_entries();
        assert_eq!(write_zip(&entries), write_zip(&entries));
    }

    #[test]
    fn test_entry_order_preserved() {
        let entries = sample_entries();
        let names: Vec<String> = read_zip(&write_zip(&entries))
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["summary.json", "raw/payload.json"]);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let mut zip = write_zip(&sample_entries());
        // Flip a byte inside the first entry's data region.
        let idx = 30 + "summary.json".len() + 2;
        zip[idx] ^= 0xff;
        assert!(matches!(read_zip(&zip), Err(ZipError::CrcMismatch { .. })));
    }

    #[test]
    fn test_truncated_rejected() {
        let zip = write_zip(&sample_entries());
        assert!(matches!(
            read_zip(&zip[..20]),
            Err(ZipError::Malformed { .. })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(read_zip(b"definitely not a zip").is_err());
    }

    #[test]
    fn test_empty_archive() {
        let zip = write_zip(&[]);
        // An empty archive is just the end-of-central-directory record;
        // reading it back yields no entries.
        assert!(read_zip(&zip).is_err() || read_zip(&zip).unwrap().is_empty());
    }

    #[test]
    fn test_known_crc_vector() {
        // Standard check value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }
}
