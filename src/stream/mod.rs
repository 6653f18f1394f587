// Streaming session coordination.
//
// Each connected client owns one session. A session is an explicit state
// machine: idle, generating (holding a cancellation token for the in-flight
// upstream call), or closed. At most one generation runs per session at a
// time; sessions never share buffers.

mod coordinator;
pub mod ws;

pub use coordinator::{SessionEvent, SessionHandle, StreamCoordinator};
