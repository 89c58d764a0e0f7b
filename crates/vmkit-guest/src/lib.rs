//! Host-guest exec and file-copy channel: the framed wire protocol
//! multiplexed over a single per-instance socket stream (spec §4.G).

pub mod filecopy;
pub mod frame;
pub mod session;
pub mod transport;

pub use frame::{StreamId, read_frame, write_frame};
pub use session::{ExecRequest, ExitEnvelope, ResizeMessage, run_exec_session};
pub use transport::{connect_uds, connect_vsock};
