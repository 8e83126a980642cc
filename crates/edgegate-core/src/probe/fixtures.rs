//! Probe fixture models.
//!
//! Fixtures are tiny synthetic packages, one per accepted packaging shape.
//! They exist to exercise the hub's compile/profile/inference path, not to
//! compute anything meaningful; the hub only needs them to be structurally
//! valid uploads.

use serde_json::{json, Value};

use crate::package::{self, PackageEntry, PackageError, PackageKind};

/// A fixture package the probe suite uploads.
#[derive(Debug, Clone)]
pub struct ProbeFixture {
    /// Fixture name, used in payload filenames.
    pub name: String,
    /// The packaging shape this fixture exercises.
    pub kind: PackageKind,
    /// The package bytes as uploaded.
    pub bytes: Vec<u8>,
    /// File listing for shape validation.
    pub entries: Vec<PackageEntry>,
    /// Container directory name, for AIMET fixtures.
    pub container_dir: Option<String>,
    /// Encodings content for AIMET fixtures.
    pub encodings: Option<Vec<u8>>,
    /// Canned inference input.
    pub sample_input: Value,
}

impl ProbeFixture {
    /// The capability id a successful compile of this fixture proves.
    #[must_use]
    pub const fn capability_id(&self) -> &'static str {
        match self.kind {
            // A plain ONNX compile proves the target works at all; the
            // dedicated capability ids cover the richer shapes.
            PackageKind::OnnxSingle => "TARGET_QNN_DLC",
            PackageKind::OnnxExternal => "MODEL_ONNX_EXTERNAL_DATA",
            PackageKind::AimetQuant => "MODEL_AIMET_ONNX_ENCODINGS",
        }
    }

    /// Shape-checks the fixture with the same validator user uploads go
    /// through.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError`] if the fixture is malformed.
    pub fn validate(&self) -> Result<PackageKind, PackageError> {
        let onnx_bytes = self
            .entries
            .iter()
            .any(|e| e.path.ends_with(".onnx"))
            .then_some(self.bytes.as_slice());
        package::validate(
            &self.entries,
            self.container_dir.as_deref(),
            onnx_bytes,
            self.encodings.as_deref(),
        )
        .map(|v| v.kind)
    }
}

/// The built-in fixture set, in probe order: single ONNX, ONNX with
/// external data, AIMET quantized package.
#[must_use]
pub fn builtin_fixtures() -> Vec<ProbeFixture> {
    let sample_input = json!({ "x": [[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]] });

    let onnx_single = ProbeFixture {
        name: "tinymlp_onnx".to_string(),
        kind: PackageKind::OnnxSingle,
        bytes: b"\x08\x07tinymlp-onnx-fixture".to_vec(),
        entries: vec![PackageEntry::new("model.onnx", 22)],
        container_dir: None,
        encodings: None,
        sample_input: sample_input.clone(),
    };

    let onnx_external = ProbeFixture {
        name: "tinymlp_onnx_external".to_string(),
        kind: PackageKind::OnnxExternal,
        // The fixture ONNX names its data file so the reference check in
        // the validator holds.
        bytes: b"\x08\x07tinymlp location: model.data".to_vec(),
        entries: vec![
            PackageEntry::new("model.onnx", 28),
            PackageEntry::new("model.data", 64),
        ],
        container_dir: None,
        encodings: None,
        sample_input: sample_input.clone(),
    };

    let aimet = ProbeFixture {
        name: "tinymlp_aimet".to_string(),
        kind: PackageKind::AimetQuant,
        bytes: b"\x08\x07tinymlp-aimet-fixture".to_vec(),
        entries: vec![
            PackageEntry::new("model.onnx", 22),
            PackageEntry::new("model.encodings", 44),
        ],
        container_dir: Some("tinymlp.aimet".to_string()),
        encodings: Some(br#"{"activation_encodings":{},"param_encodings":{}}"#.to_vec()),
        sample_input,
    };

    vec![onnx_single, onnx_external, aimet]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_fixtures_validate() {
        let fixtures = builtin_fixtures();
        assert_eq!(fixtures.len(), 3);
        for fixture in &fixtures {
            assert_eq!(fixture.validate().unwrap(), fixture.kind);
        }
    }

    #[test]
    fn test_fixture_order_matches_probe_sequence() {
        let kinds: Vec<PackageKind> = builtin_fixtures().iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PackageKind::OnnxSingle,
                PackageKind::OnnxExternal,
                PackageKind::AimetQuant
            ]
        );
    }
}
