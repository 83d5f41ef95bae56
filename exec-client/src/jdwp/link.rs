// JDWP connection: handshake, reply demultiplexing, typed commands
//
// One task owns the socket. Commands are routed through it and matched to
// replies by packet id; composite event packets are decoded in-loop, and a
// VMDeath event (or any read failure) trips the death watch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::jdwp::commands::{
    class_type_commands, command_sets, reference_type_commands, thread_commands, vm_commands,
};
use crate::jdwp::events::parse_event_packet;
use crate::jdwp::protocol::{
    CommandPacket, JdwpError, JdwpResult, ReplyPacket, HEADER_SIZE, JDWP_HANDSHAKE,
    MAX_PACKET_SIZE, REPLY_FLAG,
};
use crate::jdwp::types::{
    value_tags, ClassId, ClassInfo, FieldId, FieldInfo, FrameInfo, JdwpValue, Location, MethodInfo,
    ObjectId, ReferenceTypeId, ThreadId, VmVersion,
};
use crate::wire::{read_i32, read_string, read_u64, read_u8};

struct CommandRequest {
    packet: CommandPacket,
    reply_tx: oneshot::Sender<JdwpResult<ReplyPacket>>,
}

/// Handle to a live JDWP connection. Cheap to clone; all clones share the
/// socket task.
#[derive(Debug, Clone)]
pub struct DebugLink {
    command_tx: mpsc::Sender<CommandRequest>,
    next_id: Arc<AtomicU32>,
    death_rx: watch::Receiver<bool>,
}

impl DebugLink {
    /// Take ownership of an accepted debug socket: perform the handshake
    /// and start the demux task.
    pub async fn from_stream(mut stream: TcpStream) -> JdwpResult<Self> {
        Self::handshake(&mut stream).await?;

        let (reader, writer) = stream.into_split();
        let (command_tx, command_rx) = mpsc::channel(32);
        let (death_tx, death_rx) = watch::channel(false);

        tokio::spawn(demux_task(reader, writer, command_rx, death_tx));

        Ok(Self {
            command_tx,
            next_id: Arc::new(AtomicU32::new(1)),
            death_rx,
        })
    }

    async fn handshake(stream: &mut TcpStream) -> JdwpResult<()> {
        debug!("performing JDWP handshake");

        stream.write_all(JDWP_HANDSHAKE).await?;
        stream.flush().await?;

        let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != JDWP_HANDSHAKE {
            warn!("invalid JDWP handshake response: {:?}", buf);
            return Err(JdwpError::InvalidHandshake);
        }

        debug!("JDWP handshake complete");
        Ok(())
    }

    /// Fires once the VM reports death or the socket fails.
    pub fn death_watch(&self) -> watch::Receiver<bool> {
        self.death_rx.clone()
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_command(&self, packet: CommandPacket) -> JdwpResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(CommandRequest { packet, reply_tx })
            .await
            .map_err(|_| JdwpError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| JdwpError::ConnectionClosed)?
    }

    async fn command(&self, command_set: u8, command: u8, data: Vec<u8>) -> JdwpResult<ReplyPacket> {
        let mut packet = CommandPacket::new(self.next_id(), command_set, command);
        packet.data = data;
        let reply = self.send_command(packet).await?;
        reply.check_error()?;
        Ok(reply)
    }

    /// VirtualMachine.Version
    pub async fn version(&self) -> JdwpResult<VmVersion> {
        let reply = self
            .command(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION, vec![])
            .await?;
        let mut data = reply.data();

        Ok(VmVersion {
            description: read_string(&mut data)?,
            jdwp_major: read_i32(&mut data)?,
            jdwp_minor: read_i32(&mut data)?,
            vm_version: read_string(&mut data)?,
            vm_name: read_string(&mut data)?,
        })
    }

    /// VirtualMachine.ClassesBySignature; signature like "Lpkg/Agent;".
    pub async fn classes_by_signature(&self, signature: &str) -> JdwpResult<Vec<ClassInfo>> {
        let mut payload = Vec::new();
        crate::wire::put_string(&mut payload, signature);
        let reply = self
            .command(
                command_sets::VIRTUAL_MACHINE,
                vm_commands::CLASSES_BY_SIGNATURE,
                payload,
            )
            .await?;
        let mut data = reply.data();

        let count = read_i32(&mut data)?;
        let mut classes = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: read_u8(&mut data)?,
                type_id: read_u64(&mut data)?,
                status: read_i32(&mut data)?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.AllThreads
    pub async fn all_threads(&self) -> JdwpResult<Vec<ThreadId>> {
        let reply = self
            .command(
                command_sets::VIRTUAL_MACHINE,
                vm_commands::ALL_THREADS,
                vec![],
            )
            .await?;
        let mut data = reply.data();

        let count = read_i32(&mut data)?;
        let mut threads = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            threads.push(read_u64(&mut data)?);
        }
        Ok(threads)
    }

    /// VirtualMachine.Suspend (all threads)
    pub async fn suspend_all(&self) -> JdwpResult<()> {
        self.command(command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND, vec![])
            .await?;
        Ok(())
    }

    /// VirtualMachine.Resume (all threads)
    pub async fn resume_all(&self) -> JdwpResult<()> {
        self.command(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, vec![])
            .await?;
        Ok(())
    }

    /// VirtualMachine.Dispose. The VM resumes and drops the connection;
    /// callers treat failures as already-disconnected.
    pub async fn dispose(&self) -> JdwpResult<()> {
        self.command(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE, vec![])
            .await?;
        Ok(())
    }

    /// VirtualMachine.Exit with the given exit code.
    pub async fn exit(&self, code: i32) -> JdwpResult<()> {
        let mut payload = Vec::new();
        payload.put_i32(code);
        self.command(command_sets::VIRTUAL_MACHINE, vm_commands::EXIT, payload)
            .await?;
        Ok(())
    }

    /// ReferenceType.Signature
    pub async fn signature(&self, ref_type: ReferenceTypeId) -> JdwpResult<String> {
        let mut payload = Vec::new();
        payload.put_u64(ref_type);
        let reply = self
            .command(
                command_sets::REFERENCE_TYPE,
                reference_type_commands::SIGNATURE,
                payload,
            )
            .await?;
        let mut data = reply.data();
        Ok(read_string(&mut data)?)
    }

    /// ReferenceType.Fields
    pub async fn fields(&self, ref_type: ReferenceTypeId) -> JdwpResult<Vec<FieldInfo>> {
        let mut payload = Vec::new();
        payload.put_u64(ref_type);
        let reply = self
            .command(
                command_sets::REFERENCE_TYPE,
                reference_type_commands::FIELDS,
                payload,
            )
            .await?;
        let mut data = reply.data();

        let count = read_i32(&mut data)?;
        let mut fields = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            fields.push(FieldInfo {
                field_id: read_u64(&mut data)?,
                name: read_string(&mut data)?,
                signature: read_string(&mut data)?,
                mod_bits: read_i32(&mut data)?,
            });
        }
        Ok(fields)
    }

    /// ReferenceType.Methods
    pub async fn methods(&self, ref_type: ReferenceTypeId) -> JdwpResult<Vec<MethodInfo>> {
        let mut payload = Vec::new();
        payload.put_u64(ref_type);
        let reply = self
            .command(
                command_sets::REFERENCE_TYPE,
                reference_type_commands::METHODS,
                payload,
            )
            .await?;
        let mut data = reply.data();

        let count = read_i32(&mut data)?;
        let mut methods = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: read_u64(&mut data)?,
                name: read_string(&mut data)?,
                signature: read_string(&mut data)?,
                mod_bits: read_i32(&mut data)?,
            });
        }
        Ok(methods)
    }

    /// ReferenceType.GetValues for static fields.
    pub async fn static_values(
        &self,
        ref_type: ReferenceTypeId,
        field_ids: &[FieldId],
    ) -> JdwpResult<Vec<JdwpValue>> {
        let mut payload = Vec::new();
        payload.put_u64(ref_type);
        payload.put_i32(field_ids.len() as i32);
        for &field_id in field_ids {
            payload.put_u64(field_id);
        }
        let reply = self
            .command(
                command_sets::REFERENCE_TYPE,
                reference_type_commands::GET_VALUES,
                payload,
            )
            .await?;
        let mut data = reply.data();

        let count = read_i32(&mut data)?;
        let mut values = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let tag = read_u8(&mut data)?;
            values.push(read_value_by_tag(tag, &mut data)?);
        }
        Ok(values)
    }

    /// ClassType.SetValues for a single static boolean field (untagged).
    pub async fn set_static_boolean(
        &self,
        class_id: ClassId,
        field_id: FieldId,
        value: bool,
    ) -> JdwpResult<()> {
        let mut payload = Vec::new();
        payload.put_u64(class_id);
        payload.put_i32(1);
        payload.put_u64(field_id);
        payload.put_u8(value as u8);
        self.command(
            command_sets::CLASS_TYPE,
            class_type_commands::SET_VALUES,
            payload,
        )
        .await?;
        Ok(())
    }

    /// ThreadReference.Name
    pub async fn thread_name(&self, thread: ThreadId) -> JdwpResult<String> {
        let mut payload = Vec::new();
        payload.put_u64(thread);
        let reply = self
            .command(command_sets::THREAD_REFERENCE, thread_commands::NAME, payload)
            .await?;
        let mut data = reply.data();
        Ok(read_string(&mut data)?)
    }

    /// ThreadReference.Frames; thread must be suspended.
    /// `length` -1 retrieves all remaining frames.
    pub async fn frames(
        &self,
        thread: ThreadId,
        start_frame: i32,
        length: i32,
    ) -> JdwpResult<Vec<FrameInfo>> {
        let mut payload = Vec::new();
        payload.put_u64(thread);
        payload.put_i32(start_frame);
        payload.put_i32(length);
        let reply = self
            .command(
                command_sets::THREAD_REFERENCE,
                thread_commands::FRAMES,
                payload,
            )
            .await?;
        let mut data = reply.data();

        let count = read_i32(&mut data)?;
        let mut frames = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let frame_id = read_u64(&mut data)?;
            let type_tag = read_u8(&mut data)?;
            let class_id = read_u64(&mut data)?;
            let method_id = read_u64(&mut data)?;
            let index = read_u64(&mut data)?;
            frames.push(FrameInfo {
                frame_id,
                location: Location {
                    type_tag,
                    class_id,
                    method_id,
                    index,
                },
            });
        }
        Ok(frames)
    }

    /// ThreadReference.Stop: deliver the given throwable asynchronously to
    /// one thread.
    pub async fn stop_thread(&self, thread: ThreadId, throwable: ObjectId) -> JdwpResult<()> {
        let mut payload = Vec::new();
        payload.put_u64(thread);
        payload.put_u64(throwable);
        self.command(command_sets::THREAD_REFERENCE, thread_commands::STOP, payload)
            .await?;
        Ok(())
    }

    /// A link whose socket task is already gone; every command reports
    /// `ConnectionClosed`.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (command_tx, _) = mpsc::channel(1);
        let (death_tx, death_rx) = watch::channel(true);
        drop(death_tx);
        Self {
            command_tx,
            next_id: Arc::new(AtomicU32::new(1)),
            death_rx,
        }
    }
}

fn read_value_by_tag(tag: u8, buf: &mut &[u8]) -> JdwpResult<JdwpValue> {
    use bytes::Buf;
    let need = |buf: &&[u8], n: usize| -> JdwpResult<()> {
        if buf.len() < n {
            Err(JdwpError::Protocol(format!(
                "truncated value for tag {tag:#x}"
            )))
        } else {
            Ok(())
        }
    };
    match tag {
        value_tags::BOOLEAN => {
            need(buf, 1)?;
            Ok(JdwpValue::Boolean(buf.get_u8() != 0))
        }
        value_tags::BYTE => {
            need(buf, 1)?;
            buf.advance(1);
            Ok(JdwpValue::Other(tag))
        }
        value_tags::CHAR | value_tags::SHORT => {
            need(buf, 2)?;
            buf.advance(2);
            Ok(JdwpValue::Other(tag))
        }
        value_tags::INT => {
            need(buf, 4)?;
            Ok(JdwpValue::Int(buf.get_i32()))
        }
        value_tags::FLOAT => {
            need(buf, 4)?;
            buf.advance(4);
            Ok(JdwpValue::Other(tag))
        }
        value_tags::LONG => {
            need(buf, 8)?;
            Ok(JdwpValue::Long(buf.get_i64()))
        }
        value_tags::DOUBLE => {
            need(buf, 8)?;
            buf.advance(8);
            Ok(JdwpValue::Other(tag))
        }
        value_tags::VOID => Ok(JdwpValue::Void),
        value_tags::OBJECT
        | value_tags::STRING
        | value_tags::THREAD
        | value_tags::THREAD_GROUP
        | value_tags::CLASS_LOADER
        | value_tags::CLASS_OBJECT
        | value_tags::ARRAY => {
            need(buf, 8)?;
            Ok(JdwpValue::Object(buf.get_u64()))
        }
        other => Err(JdwpError::Protocol(format!("unknown value tag: {other}"))),
    }
}

async fn demux_task(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    death_tx: watch::Sender<bool>,
) {
    info!("JDWP demux task started");

    let mut pending: HashMap<u32, oneshot::Sender<JdwpResult<ReplyPacket>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("all JDWP handles dropped");
                    break;
                };
                let packet_id = cmd.packet.id;
                let encoded = cmd.packet.encode();
                if let Err(e) = write_fully(&mut writer, &encoded).await {
                    error!("failed to write JDWP command: {}", e);
                    cmd.reply_tx.send(Err(JdwpError::Io(e))).ok();
                    continue;
                }
                pending.insert(packet_id, cmd.reply_tx);
            }

            result = read_packet(&mut reader) => {
                match result {
                    Ok((is_reply, packet_id, data)) => {
                        if is_reply {
                            if let Some(tx) = pending.remove(&packet_id) {
                                tx.send(ReplyPacket::decode(&data)).ok();
                            } else {
                                warn!("reply for unknown JDWP command id={}", packet_id);
                            }
                        } else {
                            // Composite event packet; payload starts after
                            // the 11-byte header.
                            match parse_event_packet(&data[HEADER_SIZE..]) {
                                Ok(set) if set.signals_vm_death() => {
                                    info!("VMDeath event received");
                                    death_tx.send(true).ok();
                                }
                                Ok(set) => {
                                    debug!("ignoring event set with {} events", set.events.len());
                                }
                                Err(e) => {
                                    warn!("failed to parse JDWP event: {}", e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!("JDWP read failed, marking link dead: {}", e);
                        death_tx.send(true).ok();
                        break;
                    }
                }
            }
        }
    }

    info!("JDWP demux task shutting down");
}

async fn write_fully(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one packet; returns (is_reply, id, full packet bytes).
async fn read_packet(reader: &mut OwnedReadHalf) -> JdwpResult<(bool, u32, Vec<u8>)> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.resize(HEADER_SIZE, 0);

    reader.read_exact(&mut header).await.map_err(JdwpError::Io)?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];

    if length < HEADER_SIZE {
        return Err(JdwpError::Protocol(format!(
            "invalid packet length: {length}"
        )));
    }
    if length > MAX_PACKET_SIZE {
        return Err(JdwpError::Protocol(format!(
            "packet too large: {length} bytes"
        )));
    }

    let data_len = length - HEADER_SIZE;
    let mut full_packet = header.to_vec();
    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await.map_err(JdwpError::Io)?;
        full_packet.extend_from_slice(&data);
    }

    Ok((flags == REPLY_FLAG, packet_id, full_packet))
}
