//! Pinned public keys and detached signature verification
//!
//! Measurement documents are signed with ECDSA P-256 / SHA-256; the detached
//! `.sig` file holds the base64 of the ASN.1 DER signature. The transparency
//! log signs its entry timestamps with the same scheme.

use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use constellation_common::{Error, Result};

/// Release signing key for measurement documents
pub const PRODUCTION_SIGNING_KEY: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEf8F1hpmwE+YCFXzjGtaQcrL6XZVT
JmEe5iSLvG1SyQSAew7WdMKF6o9t8e2TFuCkzlOhhlws2OHWbiFZnFWCFw==
-----END PUBLIC KEY-----";

/// Development signing key, selected through the environment
pub const DEVELOPMENT_SIGNING_KEY: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEl+89nesml3exxVMZ4UR725t+ma6q
mNIkzOwXkL9RdvsEHc2A+qY6hWiVUjdFxNDItDQ5MrXgz4yUxA0GfzRTLQ==
-----END PUBLIC KEY-----";

/// Public key of the transparency log
pub const REKOR_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE2G2Y+2tabdTV5BcGiBIx0a9fAFwr
kBbmLSGtks4L3qX6yYY0zufBnhC8Ur/iy55GhWP/9A/bY2LhC30M9+RYtw==
-----END PUBLIC KEY-----";

/// Default transparency log
pub const REKOR_URL: &str = "https://rekor.sigstore.dev";

/// DER prefix of a P-256 SubjectPublicKeyInfo, followed by the 65 byte point
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// An ECDSA P-256 public key
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// DER SubjectPublicKeyInfo
    spki: Vec<u8>,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("id", &self.log_id())
            .finish()
    }
}

impl PublicKey {
    /// Parse a PEM `PUBLIC KEY` block
    pub fn from_pem(text: &str) -> Result<Self> {
        let block = ::pem::parse(text.as_bytes())
            .map_err(|e| Error::config_validation(format!("public key is not valid PEM: {}", e)))?;
        if block.tag() != "PUBLIC KEY" {
            return Err(Error::config_validation(format!(
                "expected a PUBLIC KEY block, found {}",
                block.tag()
            )));
        }
        Self::from_spki(block.into_contents())
    }

    /// Wrap a DER SubjectPublicKeyInfo
    pub fn from_spki(der: Vec<u8>) -> Result<Self> {
        if der.len() != P256_SPKI_PREFIX.len() + 65 || der[..P256_SPKI_PREFIX.len()] != P256_SPKI_PREFIX
        {
            return Err(Error::config_validation(
                "public key is not an uncompressed ECDSA P-256 key",
            ));
        }
        Ok(Self { spki: der })
    }

    /// Wrap an uncompressed SEC1 point (`0x04 || X || Y`)
    pub fn from_point(point: &[u8]) -> Result<Self> {
        if point.len() != 65 || point[0] != 0x04 {
            return Err(Error::config_validation(
                "public key is not an uncompressed ECDSA P-256 point",
            ));
        }
        let mut spki = P256_SPKI_PREFIX.to_vec();
        spki.extend_from_slice(point);
        Ok(Self { spki })
    }

    /// Uncompressed SEC1 point
    pub fn point(&self) -> &[u8] {
        &self.spki[P256_SPKI_PREFIX.len()..]
    }

    /// Hex SHA-256 of the DER key, the transparency log's identity
    pub fn log_id(&self) -> String {
        hex::encode(digest(&SHA256, &self.spki).as_ref())
    }

    /// PEM encoding
    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new("PUBLIC KEY", self.spki.clone()))
    }

    /// Verify a DER signature over `message`
    pub fn verify(&self, message: &[u8], signature_der: &[u8]) -> Result<()> {
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, self.point())
            .verify(message, signature_der)
            .map_err(|_| Error::verification("signature", "signature does not match pinned key"))
    }

    /// Verify the base64 content of a detached `.sig` file
    pub fn verify_detached(&self, message: &[u8], signature_b64: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(signature_b64);
        let der = STANDARD
            .decode(text.trim())
            .map_err(|e| Error::verification("signature", format!("signature is not base64: {}", e)))?;
        self.verify(message, &der)
    }
}

/// Keys and endpoints trusted for one environment
#[derive(Clone, Debug)]
pub struct TrustAnchors {
    /// Key measurement documents must be signed with
    pub signing_key: PublicKey,
    /// Key of the transparency log
    pub log_key: PublicKey,
    /// Transparency log base URL
    pub log_url: String,
    /// CDN base URL
    pub cdn_url: String,
}

impl TrustAnchors {
    /// Release keys and CDN
    pub fn production() -> Result<Self> {
        Ok(Self {
            signing_key: PublicKey::from_pem(PRODUCTION_SIGNING_KEY)?,
            log_key: PublicKey::from_pem(REKOR_PUBLIC_KEY)?,
            log_url: REKOR_URL.to_string(),
            cdn_url: constellation_common::CDN_REPOSITORY_URL.to_string(),
        })
    }

    /// Development keys and CDN
    pub fn development() -> Result<Self> {
        Ok(Self {
            signing_key: PublicKey::from_pem(DEVELOPMENT_SIGNING_KEY)?,
            log_key: PublicKey::from_pem(REKOR_PUBLIC_KEY)?,
            log_url: REKOR_URL.to_string(),
            cdn_url: constellation_common::CDN_DEV_REPOSITORY_URL.to_string(),
        })
    }

    /// Development anchors if the environment asks for them
    pub fn from_env() -> Result<Self> {
        if constellation_common::dev_mode_enabled() {
            Self::development()
        } else {
            Self::production()
        }
    }
}
