//! PCR measurements and the signed measurement document
//!
//! The CDN publishes one JSON document per image build:
//!
//! ```json
//! {
//!   "ref": "-", "stream": "stable", "version": "v2.3.0",
//!   "measurements": {
//!     "qemu-vtpm": { "4": { "expected": "<hex>", "warn_only": false } }
//!   }
//! }
//! ```
//!
//! Expected values are 32 bytes, hex encoded. Legacy documents carry base64
//! instead; both are accepted on input, output is always hex.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use constellation_common::version::ImageVersion;
use constellation_common::{AttestationVariant, Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of every PCR value
pub const PCR_LEN: usize = 32;

/// PCR the cluster id is extended into
pub const PCR_INDEX_CLUSTER_ID: u32 = 15;

/// PCR the owner id is extended into
pub const PCR_INDEX_OWNER_ID: u32 = 16;

/// Decode a PCR value given as hex or legacy base64
pub fn decode_pcr_value(encoded: &str) -> std::result::Result<[u8; PCR_LEN], String> {
    let bytes = if encoded.len() == PCR_LEN * 2 {
        hex::decode(encoded).map_err(|e| format!("invalid hex: {}", e))?
    } else {
        STANDARD
            .decode(encoded)
            .map_err(|e| format!("neither hex nor base64: {}", e))?
    };
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("expected {} bytes, got {}", PCR_LEN, bytes.len()))
}

/// One PCR expectation
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measurement {
    /// Expected register value
    #[serde(serialize_with = "ser_hex", deserialize_with = "de_pcr")]
    pub expected: [u8; PCR_LEN],
    /// Mismatch is logged instead of rejected
    #[serde(default, alias = "warnOnly")]
    pub warn_only: bool,
}

impl Measurement {
    /// Enforced measurement
    pub fn enforced(expected: [u8; PCR_LEN]) -> Self {
        Self {
            expected,
            warn_only: false,
        }
    }

    /// Measurement that only warns on mismatch
    pub fn warn_only(expected: [u8; PCR_LEN]) -> Self {
        Self {
            expected,
            warn_only: true,
        }
    }
}

impl fmt::Debug for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Measurement")
            .field("expected", &hex::encode(self.expected))
            .field("warn_only", &self.warn_only)
            .finish()
    }
}

fn ser_hex<S: Serializer>(v: &[u8; PCR_LEN], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(v))
}

fn de_pcr<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<[u8; PCR_LEN], D::Error> {
    let s = String::deserialize(d)?;
    decode_pcr_value(&s).map_err(serde::de::Error::custom)
}

/// Measurements indexed by PCR number
pub type Measurements = BTreeMap<u32, Measurement>;

/// Untyped wire form; values are decoded separately so that a wrong PCR
/// length is reported as a verification failure, not a schema error.
#[derive(Debug, Deserialize, Serialize)]
struct RawDocument {
    #[serde(rename = "ref")]
    reference: String,
    stream: String,
    version: String,
    measurements: BTreeMap<String, BTreeMap<String, RawMeasurement>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawMeasurement {
    expected: String,
    #[serde(default, alias = "warnOnly")]
    warn_only: bool,
}

/// Verified measurements of one image build for one attestation variant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeasurementBundle {
    /// Image build the measurements belong to
    pub image: ImageVersion,
    /// Variant the measurements were selected for
    pub variant: AttestationVariant,
    /// PCR expectations
    pub measurements: Measurements,
}

impl MeasurementBundle {
    /// Parse a raw document and select `variant`
    ///
    /// - invalid JSON or missing fields: `Malformed`
    /// - ref/stream/version differ from `image`: `VerificationFailed`
    /// - variant absent: `NotFound`
    /// - a value that is not 32 bytes: `VerificationFailed`
    pub fn from_document(
        raw: &[u8],
        image: &ImageVersion,
        variant: AttestationVariant,
    ) -> Result<Self> {
        let doc: RawDocument = serde_json::from_slice(raw)
            .map_err(|e| Error::malformed("measurements document", e.to_string()))?;

        if doc.reference != image.reference()
            || doc.stream != image.stream()
            || doc.version != image.version()
        {
            return Err(Error::verification(
                "measurements metadata",
                format!(
                    "document describes ref={} stream={} version={}, requested {}",
                    doc.reference, doc.stream, doc.version, image
                ),
            ));
        }

        let raw_measurements = doc.measurements.get(variant.as_str()).ok_or_else(|| {
            Error::not_found(
                "measurements",
                format!("no measurements for variant {} in {}", variant, image),
            )
        })?;

        let mut measurements = Measurements::new();
        for (index, m) in raw_measurements {
            let index: u32 = index.parse().map_err(|_| {
                Error::malformed("measurements document", format!("invalid PCR index {:?}", index))
            })?;
            let expected = decode_pcr_value(&m.expected).map_err(|e| {
                Error::verification("measurement shape", format!("PCR[{}]: {}", index, e))
            })?;
            measurements.insert(
                index,
                Measurement {
                    expected,
                    warn_only: m.warn_only,
                },
            );
        }

        Ok(Self {
            image: image.clone(),
            variant,
            measurements,
        })
    }

    /// Indices a verifier must enforce
    pub fn enforced_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.measurements
            .iter()
            .filter(|(_, m)| !m.warn_only)
            .map(|(i, _)| *i)
    }

    /// Serialize as a single-variant document (used by tests and `config fetch-measurements`)
    pub fn to_document(&self) -> Result<Vec<u8>> {
        let inner: BTreeMap<String, RawMeasurement> = self
            .measurements
            .iter()
            .map(|(i, m)| {
                (
                    i.to_string(),
                    RawMeasurement {
                        expected: hex::encode(m.expected),
                        warn_only: m.warn_only,
                    },
                )
            })
            .collect();
        let mut measurements = BTreeMap::new();
        measurements.insert(self.variant.as_str().to_string(), inner);
        let doc = RawDocument {
            reference: self.image.reference().to_string(),
            stream: self.image.stream().to_string(),
            version: self.image.version().to_string(),
            measurements,
        };
        serde_json::to_vec(&doc)
            .map_err(|e| Error::internal_with_context("measurements", e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn image() -> ImageVersion {
        ImageVersion::parse("stream/debug/v2.3.0").unwrap()
    }

    pub(crate) fn document(variant: &str, entries: &[(u32, String, bool)]) -> Vec<u8> {
        let mut inner = serde_json::Map::new();
        for (i, expected, warn) in entries {
            inner.insert(
                i.to_string(),
                serde_json::json!({ "expected": expected, "warn_only": warn }),
            );
        }
        let mut by_variant = serde_json::Map::new();
        by_variant.insert(variant.to_string(), serde_json::Value::Object(inner));
        serde_json::to_vec(&serde_json::json!({
            "ref": "-",
            "stream": "debug",
            "version": "v2.3.0",
            "measurements": by_variant,
        }))
        .unwrap()
    }

    #[test]
    fn parses_hex_and_legacy_base64_values() {
        let raw = document(
            "qemu-vtpm",
            &[
                (4, hex::encode([0xaa; 32]), false),
                (9, STANDARD.encode([0xbb; 32]), true),
            ],
        );
        let bundle =
            MeasurementBundle::from_document(&raw, &image(), AttestationVariant::QemuVtpm).unwrap();
        assert_eq!(bundle.measurements[&4].expected, [0xaa; 32]);
        assert!(bundle.measurements[&9].warn_only);
        assert_eq!(bundle.enforced_indices().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn short_value_is_a_verification_failure() {
        let raw = document("qemu-vtpm", &[(4, hex::encode([0xaa; 20]), false)]);
        let err = MeasurementBundle::from_document(&raw, &image(), AttestationVariant::QemuVtpm)
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn missing_variant_is_not_found() {
        let raw = document("gcp-sev-es", &[(4, hex::encode([0; 32]), false)]);
        let err = MeasurementBundle::from_document(&raw, &image(), AttestationVariant::QemuVtpm)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn mismatched_version_is_rejected() {
        let raw = document("qemu-vtpm", &[]);
        let other = ImageVersion::parse("stream/debug/v2.3.1").unwrap();
        let err = MeasurementBundle::from_document(&raw, &other, AttestationVariant::QemuVtpm)
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = MeasurementBundle::from_document(b"{]", &image(), AttestationVariant::QemuVtpm)
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn document_serialization_is_parseable() {
        let raw = document("qemu-vtpm", &[(11, hex::encode([3; 32]), false)]);
        let bundle =
            MeasurementBundle::from_document(&raw, &image(), AttestationVariant::QemuVtpm).unwrap();
        let again = MeasurementBundle::from_document(
            &bundle.to_document().unwrap(),
            &image(),
            AttestationVariant::QemuVtpm,
        )
        .unwrap();
        assert_eq!(bundle, again);
    }
}
