// JDWP debug link
//
// The bridge uses a small slice of the protocol: suspend/resume, thread
// frames, name resolution for those frames, static-field access on the
// remote agent class, and the targeted thread stop.
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

pub mod commands;
pub mod events;
pub mod link;
pub mod protocol;
pub mod types;

pub use link::DebugLink;
pub use protocol::{error_codes, JdwpError, JdwpResult};
pub use types::{FieldInfo, FrameInfo, MethodInfo, VmVersion};
