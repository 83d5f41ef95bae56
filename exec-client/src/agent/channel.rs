// Agent channel: handshake, reply routing, output fan-out
//
// One task owns the socket. Replies are matched to in-flight commands by
// frame id; stream frames are appended to the stdout/stderr pipes. A read
// failure or EOF means the engine is gone: pending calls fail with
// `Terminated`, the pipes are closed, and the death watch fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::agent::protocol::{
    frame_kinds, stream_channels, AgentHello, Frame, AGENT_HANDSHAKE, HEADER_SIZE, MAX_FRAME_SIZE,
    PROTOCOL_VERSION,
};
use crate::error::{ExecError, ExecResult};
use crate::pipe::Pipe;

struct ChannelRequest {
    frame: Frame,
    reply_tx: oneshot::Sender<ExecResult<Frame>>,
}

/// Handle to the live agent connection. Cheap to clone; all clones share
/// the socket task.
#[derive(Debug, Clone)]
pub struct AgentChannel {
    command_tx: mpsc::Sender<ChannelRequest>,
    next_id: Arc<AtomicU32>,
    hello: Arc<AgentHello>,
    death_rx: watch::Receiver<bool>,
}

impl AgentChannel {
    /// Take ownership of the accepted agent socket: verify the byte
    /// handshake, read the hello frame, and start the demux task. Stream
    /// frames will be appended to `stdout` / `stderr`.
    pub async fn establish(
        mut stream: TcpStream,
        stdout: Arc<Pipe>,
        stderr: Arc<Pipe>,
    ) -> ExecResult<Self> {
        let mut greeting = vec![0u8; AGENT_HANDSHAKE.len()];
        stream.read_exact(&mut greeting).await?;
        if greeting != AGENT_HANDSHAKE {
            return Err(ExecError::Handshake(format!(
                "unexpected agent greeting: {:?}",
                String::from_utf8_lossy(&greeting)
            )));
        }
        stream.write_all(AGENT_HANDSHAKE).await?;
        stream.flush().await?;

        let hello_frame = read_frame(&mut stream).await?;
        if hello_frame.kind != frame_kinds::HELLO {
            return Err(ExecError::Handshake(format!(
                "expected hello frame, got kind {:#x}",
                hello_frame.kind
            )));
        }
        let hello = AgentHello::decode(&hello_frame.payload)?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ExecError::Handshake(format!(
                "agent speaks protocol {}, client speaks {}",
                hello.protocol_version, PROTOCOL_VERSION
            )));
        }
        info!(
            vm = %hello.vm_name,
            version = %hello.vm_version,
            agent = %hello.agent_class,
            "agent connected"
        );

        let (reader, writer) = stream.into_split();
        let (command_tx, command_rx) = mpsc::channel(32);
        let (death_tx, death_rx) = watch::channel(false);

        tokio::spawn(channel_task(
            reader, writer, command_rx, death_tx, stdout, stderr,
        ));

        Ok(Self {
            command_tx,
            next_id: Arc::new(AtomicU32::new(1)),
            hello: Arc::new(hello),
            death_rx,
        })
    }

    pub fn hello(&self) -> &AgentHello {
        &self.hello
    }

    /// Fires once the agent socket is gone.
    pub fn death_watch(&self) -> watch::Receiver<bool> {
        self.death_rx.clone()
    }

    /// Send one command and wait for its reply. A dead channel surfaces as
    /// `Terminated`.
    pub async fn send(&self, op: u8, payload: Vec<u8>) -> ExecResult<Frame> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::command(id, op, payload);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ChannelRequest { frame, reply_tx })
            .await
            .map_err(|_| ExecError::Terminated)?;
        reply_rx.await.map_err(|_| ExecError::Terminated)?
    }

    /// A channel whose socket task is already gone; every send reports
    /// `Terminated`.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (command_tx, _) = mpsc::channel(1);
        let (death_tx, death_rx) = watch::channel(true);
        drop(death_tx);
        Self {
            command_tx,
            next_id: Arc::new(AtomicU32::new(1)),
            hello: Arc::new(AgentHello {
                protocol_version: PROTOCOL_VERSION,
                vm_name: "detached".to_string(),
                vm_version: "0".to_string(),
                agent_class: "replbridge.RemoteAgent".to_string(),
            }),
            death_rx,
        }
    }
}

async fn channel_task(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut command_rx: mpsc::Receiver<ChannelRequest>,
    death_tx: watch::Sender<bool>,
    stdout: Arc<Pipe>,
    stderr: Arc<Pipe>,
) {
    info!("agent channel task started");

    let mut pending: HashMap<u32, oneshot::Sender<ExecResult<Frame>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("all agent channel handles dropped");
                    break;
                };
                let id = cmd.frame.id;
                let encoded = cmd.frame.encode();
                if let Err(e) = write_fully(&mut writer, &encoded).await {
                    debug!("agent write failed: {}", e);
                    cmd.reply_tx.send(Err(ExecError::Terminated)).ok();
                    death_tx.send(true).ok();
                    break;
                }
                pending.insert(id, cmd.reply_tx);
            }

            result = read_frame(&mut reader) => {
                match result {
                    Ok(frame) => dispatch_frame(frame, &mut pending, &stdout, &stderr),
                    Err(e) => {
                        debug!("agent read failed, engine gone: {}", e);
                        death_tx.send(true).ok();
                        break;
                    }
                }
            }
        }
    }

    // Engine termination closes the forwarded output streams; pending
    // callers see Terminated when their senders drop.
    stdout.close();
    stderr.close();
    info!("agent channel task shutting down");
}

fn dispatch_frame(
    frame: Frame,
    pending: &mut HashMap<u32, oneshot::Sender<ExecResult<Frame>>>,
    stdout: &Pipe,
    stderr: &Pipe,
) {
    match frame.kind {
        frame_kinds::REPLY => {
            if let Some(tx) = pending.remove(&frame.id) {
                tx.send(Ok(frame)).ok();
            } else {
                warn!("reply for unknown agent command id={}", frame.id);
            }
        }
        frame_kinds::STREAM => {
            let delivered = match frame.code {
                stream_channels::STDOUT => stdout.write_all_if_open(&frame.payload),
                stream_channels::STDERR => stderr.write_all_if_open(&frame.payload),
                other => {
                    warn!("stream frame for unknown channel {}", other);
                    true
                }
            };
            if !delivered {
                debug!("dropped {} output bytes after stream closure", frame.payload.len());
            }
        }
        other => {
            warn!("unexpected agent frame kind {:#x}", other);
        }
    }
}

async fn write_fully(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read exactly one frame off the socket.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> ExecResult<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_SIZE {
        return Err(ExecError::Protocol(format!(
            "invalid frame length: {length}"
        )));
    }
    if length > MAX_FRAME_SIZE {
        return Err(ExecError::Protocol(format!(
            "frame too large: {length} bytes"
        )));
    }

    let mut full = header.to_vec();
    let body_len = length - HEADER_SIZE;
    if body_len > 0 {
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;
        full.extend_from_slice(&body);
    }

    Frame::decode(&full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::ops;

    #[tokio::test]
    async fn disconnected_channel_reports_terminated() {
        let channel = AgentChannel::disconnected();
        assert!(matches!(
            channel.send(ops::VERSION_INFO, vec![]).await,
            Err(ExecError::Terminated)
        ));
        assert!(*channel.death_watch().borrow());
    }

    #[tokio::test]
    async fn read_frame_decodes_stream_frame() {
        let frame = Frame {
            id: 0,
            kind: frame_kinds::STREAM,
            code: stream_channels::STDOUT,
            payload: b"output".to_vec(),
        };
        let mut cursor = std::io::Cursor::new(frame.encode());
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.kind, frame_kinds::STREAM);
        assert_eq!(decoded.payload, b"output");
    }

    #[test]
    fn stream_frames_land_in_the_right_pipe() {
        let stdout = Arc::new(Pipe::new());
        let stderr = Arc::new(Pipe::new());
        let mut pending = HashMap::new();

        dispatch_frame(
            Frame {
                id: 0,
                kind: frame_kinds::STREAM,
                code: stream_channels::STDERR,
                payload: vec![7, 8],
            },
            &mut pending,
            &stdout,
            &stderr,
        );

        stderr.close();
        assert_eq!(stderr.read(), Some(7));
        assert_eq!(stderr.read(), Some(8));
        assert_eq!(stderr.read(), None);
        stdout.close();
        assert_eq!(stdout.read(), None);
    }
}
