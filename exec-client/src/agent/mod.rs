// Command/response channel to the remote agent
//
// The agent is the entry-point class inside the spawned JVM. It executes
// invoke requests, applies classpath changes, answers extension queries,
// and multiplexes the user code's stdout/stderr back over the same socket.

pub mod channel;
pub mod protocol;

pub use channel::AgentChannel;
pub use protocol::AgentHello;
