//! Build orchestrator (spec §4.H): turns a pushed source tarball into a
//! ready image by running it through a single-use builder microVM, with
//! resource preflight, cancellation, and crash recovery.

mod orchestrator;
mod queue;
mod task;

pub use orchestrator::BuildOrchestrator;
pub use task::BuilderImage;
