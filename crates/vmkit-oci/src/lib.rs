//! OCI registry client and content-addressed layer cache (spec §4.B).
//!
//! Manifests are inspected without downloading layers; layers are pulled
//! into a shared, content-addressed blob cache and deduplicated by digest
//! across every repo that references them; unpacking applies OCI layer
//! ordering and whiteout semantics while mapping container UID/GID 0 onto
//! the caller's own UID/GID so no elevated privileges are required.

mod client;
mod ledger;
mod unpack;

pub use client::OciClient;
pub use ledger::{BlobKind, CacheLedger};
