//! Constellation attestation: measurement documents and cluster policies
//!
//! - **Fetching**: resolve an image version to its signed measurement
//!   document, verify signature and transparency log entry, cache on disk
//! - **Policy**: bind image measurements to one cluster by extending the
//!   owner and cluster id into their PCRs
//! - **Identity**: owner id, cluster id, and state disk keys derived from
//!   the master secret

#![deny(missing_docs)]

pub mod fetcher;
pub mod identity;
pub mod measurements;
pub mod policy;
pub mod rekor;
pub mod signature;

pub use fetcher::{
    build_http_client, FetchedMeasurements, HttpGetter, MeasurementFetcher, MeasurementSource,
    ReqwestGetter,
};
pub use identity::MasterSecret;
pub use measurements::{Measurement, MeasurementBundle, Measurements};
pub use policy::{AttestationConfigBuilder, AttestationPolicy};
pub use rekor::{RekorClient, TransparencyLog};
pub use signature::{PublicKey, TrustAnchors};
