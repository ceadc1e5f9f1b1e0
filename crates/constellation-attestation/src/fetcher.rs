//! Measurement fetching with verification and on-disk cache
//!
//! Lookup order for a measurement document:
//!
//! 1. `<cache_dir>/<sanitized(json_path)>` plus the matching `.sig` file.
//!    Only documents that passed full verification are ever written there,
//!    but anything placed there by hand is treated like a download: it must
//!    carry a valid signature and a transparency log entry before use.
//! 2. HTTPS GET under the CDN base, retried on transport errors.
//!
//! A document that fails signature or transparency verification is neither
//! returned nor cached.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use constellation_common::fs::atomic_write;
use constellation_common::retry::{retry_with_backoff, RetryConfig};
use constellation_common::version::ImageVersion;
use constellation_common::{AttestationVariant, Error, Result};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::measurements::MeasurementBundle;
use crate::rekor::{verify_transparency, TransparencyLog};
use crate::signature::TrustAnchors;

/// Per-request timeout for CDN downloads
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize_path(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Minimal HTTP GET used for CDN artifacts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpGetter: Send + Sync {
    /// Body of a 200 response; 404 maps to `NotFound`, other statuses to `Transport`
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`HttpGetter`] backed by reqwest
pub struct ReqwestGetter {
    client: reqwest::Client,
}

impl ReqwestGetter {
    /// Wrap an existing client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Build the HTTP client shared by CDN and transparency log access
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::internal_with_context("http_client", e.to_string()))
}

#[async_trait]
impl HttpGetter for ReqwestGetter {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::transport(url, e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(url, "the CDN has no such artifact"));
        }
        if !status.is_success() {
            return Err(Error::transport_status(url, status.as_u16()));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::transport(url, e.to_string()))
    }
}

/// A verified bundle and the digest of the document it came from
#[derive(Clone, Debug)]
pub struct FetchedMeasurements {
    /// Parsed measurements for the requested variant
    pub bundle: MeasurementBundle,
    /// Hex SHA-256 of the raw document
    pub document_sha256: String,
    /// Whether the document came from the local cache
    pub from_cache: bool,
}

/// Source of verified measurements for an image
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeasurementSource: Send + Sync {
    /// Verified measurements of `image` for `variant`
    async fn fetch(
        &self,
        image: &ImageVersion,
        variant: AttestationVariant,
        cancel: &CancellationToken,
    ) -> Result<FetchedMeasurements>;
}

/// Resolves image versions to verified measurement bundles
pub struct MeasurementFetcher {
    http: Arc<dyn HttpGetter>,
    log: Arc<dyn TransparencyLog>,
    anchors: TrustAnchors,
    cache_dir: PathBuf,
    retry: RetryConfig,
}

impl MeasurementFetcher {
    /// Create a fetcher
    pub fn new(
        http: Arc<dyn HttpGetter>,
        log: Arc<dyn TransparencyLog>,
        anchors: TrustAnchors,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http,
            log,
            anchors,
            cache_dir: cache_dir.into(),
            retry: RetryConfig::network(),
        }
    }

    /// Override the retry policy (tests use millisecond delays)
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Cache file path for a CDN path
    pub fn cache_path(&self, json_path: &str) -> PathBuf {
        self.cache_dir.join(sanitize_path(json_path))
    }

    /// Fetch, verify, and cache the measurements of `image` for `variant`
    pub async fn fetch(
        &self,
        image: &ImageVersion,
        variant: AttestationVariant,
        cancel: &CancellationToken,
    ) -> Result<FetchedMeasurements> {
        let json_path = image.measurements_path();
        let sig_path = image.signature_path();
        let doc_cache = self.cache_path(&json_path);
        let sig_cache = self.cache_path(&sig_path);

        if let Some(fetched) = self
            .try_cache(&doc_cache, &sig_cache, image, variant, cancel)
            .await?
        {
            return Ok(fetched);
        }

        let base = self.anchors.cdn_url.trim_end_matches('/');
        let doc_url = format!("{}/{}", base, json_path);
        let sig_url = format!("{}/{}", base, sig_path);
        info!(image = %image, variant = %variant, url = %doc_url, "Fetching measurements");

        let document = retry_with_backoff(&self.retry, "fetch_measurements", cancel, || {
            self.http.get(&doc_url)
        })
        .await?;
        let signature = retry_with_backoff(&self.retry, "fetch_measurements_signature", cancel, || {
            self.http.get(&sig_url)
        })
        .await?;

        let document_sha256 = self.verify(&document, &signature, cancel).await?;
        let bundle = MeasurementBundle::from_document(&document, image, variant)?;

        if let Err(e) = self.write_cache(&doc_cache, &document, &sig_cache, &signature) {
            warn!(error = %e, "Failed to cache verified measurements");
        }

        Ok(FetchedMeasurements {
            bundle,
            document_sha256,
            from_cache: false,
        })
    }

    /// Check the signature and the transparency log entry of a document,
    /// returning its hex SHA-256
    async fn verify(
        &self,
        document: &[u8],
        signature: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.anchors
            .signing_key
            .verify_detached(document, signature)
            .map_err(|e| Error::verification("measurements signature", e.to_string()))?;

        let document_sha256 = hex::encode(digest(&SHA256, document).as_ref());
        let check = verify_transparency(self.log.as_ref(), &self.anchors.log_key, &document_sha256);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled("verify_transparency")),
            r = check => r?,
        }
        Ok(document_sha256)
    }

    /// A cached document that fully verifies; anything else falls through to the CDN
    async fn try_cache(
        &self,
        doc_cache: &Path,
        sig_cache: &Path,
        image: &ImageVersion,
        variant: AttestationVariant,
        cancel: &CancellationToken,
    ) -> Result<Option<FetchedMeasurements>> {
        let (Ok(document), Ok(signature)) = (std::fs::read(doc_cache), std::fs::read(sig_cache))
        else {
            return Ok(None);
        };

        let document_sha256 = match self.verify(&document, &signature, cancel).await {
            Ok(sha) => sha,
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => {
                warn!(path = %doc_cache.display(), error = %e, "Ignoring cached measurements");
                return Ok(None);
            }
        };
        match MeasurementBundle::from_document(&document, image, variant) {
            Ok(bundle) => {
                debug!(path = %doc_cache.display(), "Using cached measurements");
                Ok(Some(FetchedMeasurements {
                    bundle,
                    document_sha256,
                    from_cache: true,
                }))
            }
            Err(e) => {
                warn!(path = %doc_cache.display(), error = %e, "Ignoring cached measurements");
                Ok(None)
            }
        }
    }

    fn write_cache(
        &self,
        doc_cache: &Path,
        document: &[u8],
        sig_cache: &Path,
        signature: &[u8],
    ) -> Result<()> {
        // Signature first: a document without signature is ignored on read
        atomic_write(sig_cache, signature)?;
        atomic_write(doc_cache, document)
    }
}

#[async_trait]
impl MeasurementSource for MeasurementFetcher {
    async fn fetch(
        &self,
        image: &ImageVersion,
        variant: AttestationVariant,
        cancel: &CancellationToken,
    ) -> Result<FetchedMeasurements> {
        MeasurementFetcher::fetch(self, image, variant, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::tests::{document, image};
    use crate::rekor::tests::signed_entry;
    use crate::rekor::MockTransparencyLog;
    use crate::signature::tests::TestSigner;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        signer: TestSigner,
        log_signer: TestSigner,
        cache: TempDir,
        document: Vec<u8>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                signer: TestSigner::new(),
                log_signer: TestSigner::new(),
                cache: TempDir::new().unwrap(),
                document: document("qemu-vtpm", &[(4, hex::encode([0x11; 32]), false)]),
            }
        }

        fn anchors(&self) -> TrustAnchors {
            TrustAnchors {
                signing_key: self.signer.public_key(),
                log_key: self.log_signer.public_key(),
                log_url: "https://log.test".to_string(),
                cdn_url: "https://cdn.test".to_string(),
            }
        }

        fn log(&self) -> MockTransparencyLog {
            let sha = hex::encode(digest(&SHA256, &self.document).as_ref());
            let entry = signed_entry(&self.log_signer, &sha, 1);
            let mut log = MockTransparencyLog::new();
            log.expect_search_by_hash()
                .returning(|_| Ok(vec!["uuid".to_string()]));
            log.expect_get_entry().returning(move |_| Ok(entry.clone()));
            log
        }

        fn http(&self, signature: Vec<u8>) -> MockHttpGetter {
            let doc = self.document.clone();
            let mut http = MockHttpGetter::new();
            http.expect_get().returning(move |url| {
                if url.ends_with(".sig") {
                    Ok(signature.clone())
                } else {
                    Ok(doc.clone())
                }
            });
            http
        }

        fn fetcher(&self, http: MockHttpGetter, log: MockTransparencyLog) -> MeasurementFetcher {
            MeasurementFetcher::new(Arc::new(http), Arc::new(log), self.anchors(), self.cache.path())
                .with_retry(RetryConfig {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    backoff_multiplier: 2.0,
                })
        }

        fn cache_is_empty(&self) -> bool {
            std::fs::read_dir(self.cache.path()).unwrap().next().is_none()
        }
    }

    #[tokio::test]
    async fn story_verified_measurements_are_returned_and_cached() {
        let fx = Fixture::new();
        let sig = fx.signer.sign_b64(&fx.document);
        let fetcher = fx.fetcher(fx.http(sig), fx.log());

        let fetched = fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!fetched.from_cache);
        assert_eq!(fetched.bundle.measurements[&4].expected, [0x11; 32]);
        let cached = fetcher.cache_path(&image().measurements_path());
        assert_eq!(std::fs::read(cached).unwrap(), fx.document);
    }

    #[tokio::test]
    async fn story_bad_signature_is_fatal_and_not_cached() {
        let fx = Fixture::new();
        let forged = TestSigner::new().sign_b64(&fx.document);
        let mut log = MockTransparencyLog::new();
        log.expect_search_by_hash().times(0);
        let fetcher = fx.fetcher(fx.http(forged), log);

        let err = fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::VerificationFailed { .. }));
        assert!(fx.cache_is_empty());
    }

    #[tokio::test]
    async fn story_missing_log_entry_is_fatal_and_not_cached() {
        let fx = Fixture::new();
        let sig = fx.signer.sign_b64(&fx.document);
        let mut log = MockTransparencyLog::new();
        log.expect_search_by_hash().returning(|_| Ok(vec![]));
        let fetcher = fx.fetcher(fx.http(sig), log);

        let err = fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 5);
        assert!(fx.cache_is_empty());
    }

    #[tokio::test]
    async fn story_cached_document_is_used_without_network() {
        let fx = Fixture::new();
        let sig = fx.signer.sign_b64(&fx.document);
        let mut http = MockHttpGetter::new();
        http.expect_get().times(0);
        let fetcher = fx.fetcher(http, fx.log());

        std::fs::write(fetcher.cache_path(&image().measurements_path()), &fx.document).unwrap();
        std::fs::write(fetcher.cache_path(&image().signature_path()), sig).unwrap();

        let fetched = fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap();
        assert!(fetched.from_cache);
    }

    #[tokio::test]
    async fn story_signed_cache_without_log_entry_is_not_trusted() {
        let fx = Fixture::new();
        let sig = fx.signer.sign_b64(&fx.document);
        let mut log = MockTransparencyLog::new();
        log.expect_search_by_hash().returning(|_| Ok(vec![]));
        let fetcher = fx.fetcher(fx.http(sig.clone()), log);

        // Placed by hand, never downloaded through the fetcher
        let doc_cache = fetcher.cache_path(&image().measurements_path());
        std::fs::write(&doc_cache, &fx.document).unwrap();
        std::fs::write(fetcher.cache_path(&image().signature_path()), sig).unwrap();

        let err = fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn story_tampered_cache_falls_back_to_cdn() {
        let fx = Fixture::new();
        let sig = fx.signer.sign_b64(&fx.document);
        let fetcher = fx.fetcher(fx.http(sig.clone()), fx.log());

        let tampered = document("qemu-vtpm", &[(4, hex::encode([0x22; 32]), false)]);
        std::fs::write(fetcher.cache_path(&image().measurements_path()), tampered).unwrap();
        std::fs::write(fetcher.cache_path(&image().signature_path()), sig).unwrap();

        let fetched = fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!fetched.from_cache);
        assert_eq!(fetched.bundle.measurements[&4].expected, [0x11; 32]);
    }

    #[tokio::test]
    async fn story_transport_errors_are_retried() {
        let fx = Fixture::new();
        let sig = fx.signer.sign_b64(&fx.document);
        let doc = fx.document.clone();
        let failures = Arc::new(AtomicU32::new(0));
        let f = failures.clone();

        let mut http = MockHttpGetter::new();
        http.expect_get().returning(move |url| {
            if url.ends_with(".sig") {
                return Ok(sig.clone());
            }
            if f.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transport(url, "connection reset"))
            } else {
                Ok(doc.clone())
            }
        });
        let fetcher = fx.fetcher(http, fx.log());

        fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn story_not_found_is_not_retried() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut http = MockHttpGetter::new();
        http.expect_get().returning(move |url| {
            c.fetch_add(1, Ordering::SeqCst);
            Err(Error::not_found(url, "missing"))
        });
        let fetcher = fx.fetcher(http, MockTransparencyLog::new());

        let err = fetcher
            .fetch(&image(), AttestationVariant::QemuVtpm, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(
            sanitize_path("constellation/v1/ref/-/stream/debug/v2.3.0/image/measurements.json"),
            "constellation_v1_ref_-_stream_debug_v2.3.0_image_measurements.json"
        );
        assert_eq!(sanitize_path("a b:c"), "a_b_c");
    }
}
