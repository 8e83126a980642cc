//! Model packaging-shape validation.
//!
//! Three shapes are accepted, all matched strictly on file structure:
//!
//! - `ONNX_SINGLE`: exactly one `.onnx`, nothing else of the governed kinds
//! - `ONNX_EXTERNAL`: exactly one `.onnx` plus exactly one `.data`
//! - `AIMET_QUANT`: a container directory whose name contains `.aimet`,
//!   holding exactly one `.onnx`, exactly one `.encodings`, and at most one
//!   `.data`
//!
//! Model content is never executed or interpreted. The one content peek -
//! checking that an external-data ONNX references its `.data` file by name -
//! is best-effort: a miss is recorded as a warning, not a rejection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A file inside a model package, as seen by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    /// Path relative to the package root.
    pub path: String,
    /// Size in bytes.
    pub bytes: u64,
}

impl PackageEntry {
    /// Convenience constructor.
    #[must_use]
    pub fn new(path: impl Into<String>, bytes: u64) -> Self {
        Self {
            path: path.into(),
            bytes,
        }
    }

    fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        name.rsplit_once('.').map(|(_, ext)| ext)
    }

    fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// The accepted packaging shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageKind {
    /// A single self-contained ONNX file.
    OnnxSingle,
    /// ONNX with weights in an external `.data` file.
    OnnxExternal,
    /// An AIMET quantized package directory.
    AimetQuant,
}

impl PackageKind {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OnnxSingle => "ONNX_SINGLE",
            Self::OnnxExternal => "ONNX_EXTERNAL",
            Self::AimetQuant => "AIMET_QUANT",
        }
    }
}

/// Why a package was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PackageError {
    /// The package holds no files at all.
    #[error("invalid model package: empty package")]
    Empty,

    /// Wrong number of a governed file kind.
    #[error("invalid model package: expected {expected} {extension} file(s), found {found}")]
    WrongFileCount {
        /// The governed extension, e.g. `.onnx`.
        extension: &'static str,
        /// How many a valid package holds.
        expected: &'static str,
        /// How many were found.
        found: usize,
    },

    /// An AIMET package's container directory is not named `*.aimet*`.
    #[error("invalid model package: AIMET container directory {name:?} does not contain '.aimet'")]
    AimetDirName {
        /// The offending directory name.
        name: String,
    },

    /// An `.encodings` file is present but is not valid JSON.
    #[error("invalid model package: .encodings file is not valid JSON: {message}")]
    EncodingsNotJson {
        /// Parse failure description.
        message: String,
    },

    /// The file mix matches no accepted shape.
    #[error("invalid model package: file mix matches no accepted shape ({summary})")]
    UnrecognizedShape {
        /// Short listing of the governed files found.
        summary: String,
    },
}

/// Outcome of validation: the detected kind plus any non-fatal warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPackage {
    /// The detected packaging shape.
    pub kind: PackageKind,
    /// Recorded best-effort findings that did not block acceptance.
    pub warnings: Vec<String>,
}

/// Validates a package listing.
///
/// `container_dir` is the name of the directory the package was uploaded
/// as, when there is one (AIMET packages require it). `onnx_bytes` is the
/// raw ONNX file content when the caller has it available, used only for
/// the external-data reference sanity check. `encodings_json` is the
/// `.encodings` content when present.
///
/// # Errors
///
/// Returns [`PackageError`] when the listing matches no accepted shape.
pub fn validate(
    entries: &[PackageEntry],
    container_dir: Option<&str>,
    onnx_bytes: Option<&[u8]>,
    encodings_json: Option<&[u8]>,
) -> Result<ValidatedPackage, PackageError> {
    if entries.is_empty() {
        return Err(PackageError::Empty);
    }

    let onnx: Vec<&PackageEntry> = by_extension(entries, "onnx");
    let data: Vec<&PackageEntry> = by_extension(entries, "data");
    let encodings: Vec<&PackageEntry> = by_extension(entries, "encodings");

    // AIMET is detected by the container name; the directory marker is
    // authoritative even when the file mix happens to look like another
    // shape.
    if let Some(dir) = container_dir {
        if dir.to_lowercase().contains(".aimet") {
            return validate_aimet(&onnx, &data, &encodings, encodings_json);
        }
        if !encodings.is_empty() {
            return Err(PackageError::AimetDirName {
                name: dir.to_string(),
            });
        }
    } else if !encodings.is_empty() {
        return Err(PackageError::AimetDirName {
            name: String::new(),
        });
    }

    match (onnx.len(), data.len()) {
        (1, 0) => Ok(ValidatedPackage {
            kind: PackageKind::OnnxSingle,
            warnings: Vec::new(),
        }),
        (1, 1) => {
            let mut warnings = Vec::new();
            if let Some(bytes) = onnx_bytes {
                let data_name = data[0].file_name();
                if !contains_subslice(bytes, data_name.as_bytes()) {
                    warnings.push(format!(
                        "ONNX does not appear to reference external data file {data_name:?}"
                    ));
                }
            } else {
                warnings.push("ONNX bytes unavailable; external-data reference unchecked".into());
            }
            Ok(ValidatedPackage {
                kind: PackageKind::OnnxExternal,
                warnings,
            })
        }
        (1, n) => Err(PackageError::WrongFileCount {
            extension: ".data",
            expected: "0 or 1",
            found: n,
        }),
        // No .onnx at all: there is nothing to anchor a shape on.
        (0, data_count) => Err(PackageError::UnrecognizedShape {
            summary: format!("0 .onnx, {data_count} .data"),
        }),
        (n, _) => Err(PackageError::WrongFileCount {
            extension: ".onnx",
            expected: "exactly 1",
            found: n,
        }),
    }
}

fn validate_aimet(
    onnx: &[&PackageEntry],
    data: &[&PackageEntry],
    encodings: &[&PackageEntry],
    encodings_json: Option<&[u8]>,
) -> Result<ValidatedPackage, PackageError> {
    if onnx.len() != 1 {
        return Err(PackageError::WrongFileCount {
            extension: ".onnx",
            expected: "exactly 1",
            found: onnx.len(),
        });
    }
    if encodings.len() != 1 {
        return Err(PackageError::WrongFileCount {
            extension: ".encodings",
            expected: "exactly 1",
            found: encodings.len(),
        });
    }
    if data.len() > 1 {
        return Err(PackageError::WrongFileCount {
            extension: ".data",
            expected: "0 or 1",
            found: data.len(),
        });
    }

    let mut warnings = Vec::new();
    match encodings_json {
        Some(bytes) => {
            // The encodings format itself is AIMET's business; only JSON
            // well-formedness is checked.
            if let Err(e) = serde_json::from_slice::<serde_json::Value>(bytes) {
                return Err(PackageError::EncodingsNotJson {
                    message: e.to_string(),
                });
            }
        }
        None => warnings.push(".encodings content unavailable; JSON check skipped".into()),
    }

    Ok(ValidatedPackage {
        kind: PackageKind::AimetQuant,
        warnings,
    })
}

fn by_extension<'a>(entries: &'a [PackageEntry], ext: &str) -> Vec<&'a PackageEntry> {
    entries
        .iter()
        .filter(|e| e.extension().is_some_and(|x| x.eq_ignore_ascii_case(ext)))
        .collect()
}

/// Naive subslice search; ONNX files reference external data by a plain
/// path string in the tensor metadata, so a byte scan is sufficient for a
/// best-effort check.
fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
