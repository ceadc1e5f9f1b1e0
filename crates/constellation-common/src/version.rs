//! Image version short paths and upgrade ordering rules
//!
//! A short path names an image build on the CDN:
//!
//! - `ref/<ref>/stream/<stream>/<version>`
//! - `stream/<stream>/<version>` (release ref)
//! - `<version>` (release ref, stable stream)
//!
//! Versions are canonical semantic versions with a leading `v`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

use crate::Error;

/// Ref used for release builds
pub const RELEASE_REF: &str = "-";

/// Stream used when a short path omits it
pub const STABLE_STREAM: &str = "stable";

/// Path prefix of versioned artifacts on the CDN
pub const CDN_API_PREFIX: &str = "constellation/v1";

/// Kubernetes minors the engine can install
pub const SUPPORTED_KUBERNETES_MINORS: &[(u64, u64)] = &[(1, 26), (1, 27), (1, 28)];

static REF_STREAM_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ref/([a-zA-Z0-9-]+)/stream/([a-zA-Z0-9-]+)/([a-zA-Z0-9.+-]+)$")
        .expect("static regex is valid")
});

static STREAM_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^stream/([a-zA-Z0-9-]+)/([a-zA-Z0-9.+-]+)$").expect("static regex is valid")
});

/// Parse a `vMAJOR.MINOR.PATCH[-pre][+build]` string
///
/// The leading `v` is required so that the string is the canonical form
/// used in CDN paths.
pub fn parse_canonical(version: &str) -> Result<Version, Error> {
    let stripped = version.strip_prefix('v').ok_or_else(|| {
        Error::config_field(
            "image",
            format!("version {} is not canonical: missing leading 'v'", version),
        )
    })?;
    Version::parse(stripped).map_err(|e| {
        Error::config_field(
            "image",
            format!("version {} is not a valid semantic version: {}", version, e),
        )
    })
}

/// A fully resolved image version
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageVersion {
    reference: String,
    stream: String,
    version: String,
}

impl ImageVersion {
    /// Parse a short path
    pub fn parse(short_path: &str) -> Result<Self, Error> {
        let (reference, stream, version) =
            if let Some(caps) = REF_STREAM_VERSION.captures(short_path) {
                (caps[1].to_string(), caps[2].to_string(), caps[3].to_string())
            } else if let Some(caps) = STREAM_VERSION.captures(short_path) {
                (RELEASE_REF.to_string(), caps[1].to_string(), caps[2].to_string())
            } else {
                (
                    RELEASE_REF.to_string(),
                    STABLE_STREAM.to_string(),
                    short_path.to_string(),
                )
            };

        if reference.is_empty() || stream.is_empty() {
            return Err(Error::config_field(
                "image",
                format!("invalid image short path {:?}", short_path),
            ));
        }
        parse_canonical(&version)?;

        Ok(Self {
            reference,
            stream,
            version,
        })
    }

    /// Branch reference, `-` for releases
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Build stream (`stable`, `debug`, `nightly`, ...)
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Canonical version string
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Parsed semantic version
    pub fn semver(&self) -> Result<Version, Error> {
        parse_canonical(&self.version)
    }

    /// Shortest short path that names this version
    pub fn short_path(&self) -> String {
        if self.reference == RELEASE_REF {
            if self.stream == STABLE_STREAM {
                return self.version.clone();
            }
            return format!("stream/{}/{}", self.stream, self.version);
        }
        format!(
            "ref/{}/stream/{}/{}",
            self.reference, self.stream, self.version
        )
    }

    /// CDN path of all artifacts of this build
    pub fn artifact_path(&self) -> String {
        format!(
            "{}/ref/{}/stream/{}/{}",
            CDN_API_PREFIX, self.reference, self.stream, self.version
        )
    }

    /// CDN path of the measurements document
    pub fn measurements_path(&self) -> String {
        format!("{}/image/measurements.json", self.artifact_path())
    }

    /// CDN path of the detached measurements signature
    pub fn signature_path(&self) -> String {
        format!("{}.sig", self.measurements_path())
    }

    /// CDN path of the image reference list
    pub fn image_info_path(&self) -> String {
        format!("{}/image/info.json", self.artifact_path())
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_path())
    }
}

/// Check that `to` is a valid forward upgrade from `from`
///
/// Forward only, same major, minor jump of at most one.
pub fn check_upgrade(component: &str, from: &str, to: &str) -> Result<(), Error> {
    let current = parse_canonical(from)
        .map_err(|e| Error::invalid_upgrade(component, from, to, e.to_string()))?;
    let next = parse_canonical(to)
        .map_err(|e| Error::invalid_upgrade(component, from, to, e.to_string()))?;

    if current == next {
        return Err(Error::invalid_upgrade(
            component,
            from,
            to,
            "target version equals current version",
        ));
    }
    if next < current {
        return Err(Error::invalid_upgrade(
            component,
            from,
            to,
            "downgrades are not supported",
        ));
    }
    if next.major != current.major {
        return Err(Error::invalid_upgrade(
            component,
            from,
            to,
            "major version upgrades are not supported",
        ));
    }
    if next.minor > current.minor + 1 {
        return Err(Error::invalid_upgrade(
            component,
            from,
            to,
            "only one minor version can be skipped at a time",
        ));
    }
    Ok(())
}

/// Whether a Kubernetes version belongs to a supported minor
pub fn is_supported_kubernetes(version: &str) -> bool {
    parse_canonical(version)
        .map(|v| SUPPORTED_KUBERNETES_MINORS.contains(&(v.major, v.minor)))
        .unwrap_or(false)
}

/// Check a Kubernetes upgrade: supported minor plus forward ordering
pub fn check_kubernetes_upgrade(from: &str, to: &str) -> Result<(), Error> {
    if !is_supported_kubernetes(to) {
        return Err(Error::invalid_upgrade(
            "kubernetes",
            from,
            to,
            "unsupported Kubernetes minor version",
        ));
    }
    check_upgrade("kubernetes", from, to)
}

/// Normalise `1.27.0` to `v1.27.0`
pub fn with_v_prefix(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}
