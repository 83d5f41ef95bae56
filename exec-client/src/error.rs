// Error taxonomy for the execution bridge
//
// Invoke-path failures are typed by cause: user code failing is not a bridge
// failure, and a dead engine is neither of those. Lifecycle operations
// (stop, closes, disposal) never surface errors at all.

use thiserror::Error;

use crate::jdwp::{error_codes, JdwpError};
use crate::wire::WireError;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    /// Socket or stream failure during setup or an in-flight call.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The remote side did not complete the expected handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A malformed frame or an out-of-contract reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// User code threw inside the remote process. Carries the remote
    /// failure description; not a bridge-level error.
    #[error("user code failed: {0}")]
    Run(String),

    /// The remote process or its debug connection is no longer usable.
    #[error("remote engine terminated")]
    Terminated,

    /// Unexpected state on the bridge side, original cause attached when
    /// one exists.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl ExecError {
    pub fn internal(message: impl Into<String>) -> Self {
        ExecError::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ExecError::Terminated)
    }
}

impl From<WireError> for ExecError {
    fn from(err: WireError) -> Self {
        ExecError::Protocol(err.0)
    }
}

impl From<JdwpError> for ExecError {
    fn from(err: JdwpError) -> Self {
        match err {
            JdwpError::ConnectionClosed => ExecError::Terminated,
            JdwpError::ErrorCode(error_codes::VM_DEAD, _) => ExecError::Terminated,
            JdwpError::Io(e) => ExecError::Transport(e),
            other => ExecError::Internal {
                message: "debug link failure".to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_death_maps_to_termination() {
        let dead = JdwpError::ErrorCode(error_codes::VM_DEAD, "VM_DEAD");
        assert!(ExecError::from(dead).is_terminated());
        assert!(ExecError::from(JdwpError::ConnectionClosed).is_terminated());
    }

    #[test]
    fn other_jdwp_failures_keep_their_cause() {
        let err = ExecError::from(JdwpError::ErrorCode(
            error_codes::INVALID_THREAD,
            "INVALID_THREAD",
        ));
        match err {
            ExecError::Internal { source, .. } => assert!(source.is_some()),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
