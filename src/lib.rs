//! vmkitd: wires the leaf crates (paths/types, OCI client, image pipeline,
//! network manager, instance engine, build orchestrator) into one running
//! control plane and recovers it from whatever was on disk at startup.
//!
//! The HTTP/REST surface described in the external interfaces is out of
//! scope for this crate (spec §1 non-goals); [`Vmkitd`] is what that surface
//! would sit on top of.

mod app;

pub use app::Vmkitd;
