// Remote execution client
//
// Runs user-submitted code in a spawned JVM and keeps control of it:
// - Process launch with loopback-only connect-back
// - Agent command channel (invoke, classpath, extension queries) with
//   multiplexed stdout/stderr
// - JDWP debug link for targeted interrupts of in-flight invocations
// - Blocking pipe transport feeding the console's output pumps

pub mod agent;
pub mod bridge;
pub mod error;
pub mod jdwp;
pub mod launch;
pub mod pipe;
pub mod wire;

pub use bridge::{BridgeState, ExecutionBridge, TargetSpec};
pub use error::{ExecError, ExecResult};
pub use launch::{launch, LaunchConfig};
pub use pipe::{Pipe, PipeReader};
