//! OCI distribution registry access.
//!
//! Resolves `host:port/name:tag` references to manifest digests, fetches
//! blobs and referrer artifacts (signature, certificate), and publishes
//! manifests and linked artifacts.

mod client;
mod reference;

pub use client::{PublishedManifest, ReferrerPolicy, RegistryClient, ResolvedImage};
pub use reference::{drop_hash_alg, RegistryRef};
