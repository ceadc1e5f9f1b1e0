//! Resolution of an image version to the provider specific image reference

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use constellation_attestation::fetcher::sanitize_path;
use constellation_attestation::HttpGetter;
use constellation_common::retry::{retry_with_backoff, RetryConfig};
use constellation_common::version::ImageVersion;
use constellation_common::{AttestationVariant, CloudProvider, Error, Result};

/// Looks up the image reference to boot for a provider and variant
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageReferenceSource: Send + Sync {
    /// Reference of `image` on `provider` for `variant`
    ///
    /// `region` only narrows the match on AWS, where AMIs are regional.
    async fn fetch_reference(
        &self,
        provider: CloudProvider,
        variant: AttestationVariant,
        image: &ImageVersion,
        region: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(rename = "ref")]
    reference: String,
    stream: String,
    version: String,
    list: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageEntry {
    csp: String,
    attestation_variant: String,
    reference: String,
    #[serde(default)]
    region: Option<String>,
}

impl ImageInfo {
    fn parse(bytes: &[u8], source: &str, image: &ImageVersion) -> Result<Self> {
        let info: ImageInfo = serde_json::from_slice(bytes)
            .map_err(|e| Error::malformed(source, e.to_string()))?;
        if info.reference != image.reference()
            || info.stream != image.stream()
            || info.version != image.version()
        {
            return Err(Error::malformed(
                source,
                format!(
                    "image info describes {}/{}/{}, requested {}",
                    info.reference, info.stream, info.version, image
                ),
            ));
        }
        Ok(info)
    }

    fn find(&self, provider: CloudProvider, variant: AttestationVariant, region: &str) -> Option<&str> {
        self.list
            .iter()
            .find(|entry| {
                entry.csp.eq_ignore_ascii_case(provider.as_str())
                    && entry.attestation_variant == variant.as_str()
                    && (provider != CloudProvider::Aws || entry.region.as_deref() == Some(region))
            })
            .map(|entry| entry.reference.as_str())
    }
}

/// [`ImageReferenceSource`] reading `info.json` documents
pub struct ImageFetcher {
    http: Arc<dyn HttpGetter>,
    cdn_url: String,
    cache_dir: PathBuf,
    retry: RetryConfig,
}

impl ImageFetcher {
    /// Fetcher downloading from `cdn_url` with local overrides under `cache_dir`
    pub fn new(http: Arc<dyn HttpGetter>, cdn_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            cdn_url: cdn_url.into(),
            cache_dir: cache_dir.into(),
            retry: RetryConfig::network(),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Local override path of an image info document
    pub fn override_path(&self, image: &ImageVersion) -> PathBuf {
        self.cache_dir.join(sanitize_path(&image.image_info_path()))
    }

    async fn load(&self, image: &ImageVersion, cancel: &CancellationToken) -> Result<ImageInfo> {
        let local = self.override_path(image);
        if let Ok(bytes) = std::fs::read(&local) {
            debug!(path = %local.display(), "Using local image info");
            return ImageInfo::parse(&bytes, &local.display().to_string(), image);
        }

        let url = format!("{}/{}", self.cdn_url.trim_end_matches('/'), image.image_info_path());
        info!(image = %image, url = %url, "Fetching image info");
        let bytes = retry_with_backoff(&self.retry, "fetch_image_info", cancel, || self.http.get(&url)).await?;
        ImageInfo::parse(&bytes, &url, image)
    }
}

#[async_trait]
impl ImageReferenceSource for ImageFetcher {
    async fn fetch_reference(
        &self,
        provider: CloudProvider,
        variant: AttestationVariant,
        image: &ImageVersion,
        region: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let info = self.load(image, cancel).await?;
        info.find(provider, variant, region)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::config_field(
                    "image",
                    format!(
                        "image {} has no reference for provider {}, variant {}, region {:?}",
                        image, provider, variant, region
                    ),
                )
            })
    }
}
