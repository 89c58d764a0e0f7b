//! vmkit-runtime: the instance lifecycle engine and its Cloud Hypervisor
//! driver. Orchestrates create/standby/restore/reboot/delete against the
//! persistence layout and network manager; owns resource accounting and
//! CPU topology selection.

pub mod channel_id;
pub mod engine;
pub mod lock;
pub mod resources;
pub mod topology;
pub mod vm;

pub use engine::InstanceEngine;
