// Execution control bridge
//
// Mediates between the console-side session and the remote JVM: forwards
// invoke/classpath commands over the agent channel, targets interrupts at
// the user-code thread through the debug link, and supervises process
// death.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::protocol::{decode_version_info, encode_classpath, encode_invoke, ops, reply_status, Frame};
use crate::agent::AgentChannel;
use crate::error::{ExecError, ExecResult};
use crate::jdwp::protocol::error_codes;
use crate::jdwp::types::{ClassId, FieldId, MethodId, ObjectId, ReferenceTypeId, ThreadId};
use crate::jdwp::{DebugLink, JdwpResult};
use crate::pipe::{Pipe, PipeReader};

/// Method the agent runs every invocation through; the frame scan keys on
/// it.
pub const AGENT_INVOKE_METHOD: &str = "invoke";

/// Static boolean on the agent class; set while a targeted stop is in
/// flight so the agent can tell the delivered throwable from a user one.
const EXPECTING_STOP_FIELD: &str = "expectingStop";

/// Static field holding the pre-allocated throwable that gets delivered to
/// the user-code thread.
const STOP_EXCEPTION_FIELD: &str = "stopException";

/// Identification of the launched VM and agent, captured at handshake.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSpec {
    pub vm_name: String,
    pub vm_version: String,
    pub vm_description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub agent_class: String,
    pub protocol_version: u16,
}

/// Observable lifecycle of a bridge. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connected,
    Running,
    Closed,
}

/// One frame of a suspended thread, resolved to names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameName {
    pub class_signature: String,
    pub method_name: String,
}

/// A thread and its stack at suspension time, top frame first.
#[derive(Debug, Clone)]
pub struct ThreadStack {
    pub thread: ThreadId,
    pub frames: Vec<FrameName>,
}

/// Pick the thread executing the agent's invoke entry point, if any.
/// Pure over the collected stacks so the selection logic is testable away
/// from a live VM.
pub fn find_invoke_thread(
    stacks: &[ThreadStack],
    agent_signature: &str,
    invoke_method: &str,
) -> Option<ThreadId> {
    stacks
        .iter()
        .find(|stack| {
            stack.frames.iter().any(|frame| {
                frame.class_signature == agent_signature && frame.method_name == invoke_method
            })
        })
        .map(|stack| stack.thread)
}

/// "pkg.Agent" -> "Lpkg/Agent;"
pub fn binary_name_to_signature(name: &str) -> String {
    format!("L{};", name.replace('.', "/"))
}

/// Debug-side handles onto the agent class, resolved once at construction.
#[derive(Debug, Clone, Copy)]
struct AgentRefs {
    class_id: ClassId,
    expecting_stop_field: FieldId,
    stop_exception: ObjectId,
}

pub struct ExecutionBridge {
    channel: AgentChannel,
    debug: DebugLink,
    target: TargetSpec,
    refs: AgentRefs,
    agent_signature: String,
    // Dedicated lock for the user-code-running flag; stop() samples it and
    // invoke() owns its transitions.
    running: Mutex<bool>,
    suppress_classpath: AtomicBool,
    closed: AtomicBool,
    stop_misses: AtomicU64,
    stdout: Arc<Pipe>,
    stderr: Arc<Pipe>,
    kill_tx: watch::Sender<bool>,
    dead_rx: watch::Receiver<bool>,
}

impl ExecutionBridge {
    /// Assemble a bridge over freshly established connections and start
    /// supervising the spawned process.
    pub(crate) async fn new(
        channel: AgentChannel,
        debug: DebugLink,
        child: Child,
        stdout: Arc<Pipe>,
        stderr: Arc<Pipe>,
    ) -> ExecResult<Self> {
        // Supervise the child before touching the VM so a failed
        // resolution below still reaps the process.
        let (kill_tx, kill_rx) = watch::channel(false);
        let (dead_tx, dead_rx) = watch::channel(false);
        tokio::spawn(supervise(
            child,
            kill_rx,
            channel.death_watch(),
            debug.death_watch(),
            dead_tx,
            Arc::clone(&stdout),
            Arc::clone(&stderr),
        ));

        let agent_class = channel.hello().agent_class.clone();
        let agent_signature = binary_name_to_signature(&agent_class);
        let setup = async {
            let refs = resolve_agent_refs(&debug, &agent_class, &agent_signature).await?;
            let vm = debug.version().await.map_err(ExecError::from)?;
            Ok::<_, ExecError>((refs, vm))
        };
        let (refs, vm) = match setup.await {
            Ok(resolved) => resolved,
            Err(e) => {
                kill_tx.send(true).ok();
                return Err(e);
            }
        };
        let target = TargetSpec {
            vm_name: channel.hello().vm_name.clone(),
            vm_version: channel.hello().vm_version.clone(),
            vm_description: vm.description,
            jdwp_major: vm.jdwp_major,
            jdwp_minor: vm.jdwp_minor,
            agent_class,
            protocol_version: channel.hello().protocol_version,
        };

        Ok(Self {
            channel,
            debug,
            target,
            refs,
            agent_signature,
            running: Mutex::new(false),
            suppress_classpath: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop_misses: AtomicU64::new(0),
            stdout,
            stderr,
            kill_tx,
            dead_rx,
        })
    }

    pub fn target_spec(&self) -> &TargetSpec {
        &self.target
    }

    pub fn state(&self) -> BridgeState {
        if self.closed.load(Ordering::SeqCst) {
            BridgeState::Closed
        } else if self.is_running() {
            BridgeState::Running
        } else {
            BridgeState::Connected
        }
    }

    /// Fires once the engine is unusable: process exit, channel loss, or
    /// VM death.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.dead_rx.clone()
    }

    pub fn stdout_reader(&self) -> PipeReader {
        PipeReader::new(Arc::clone(&self.stdout))
    }

    pub fn stderr_reader(&self) -> PipeReader {
        PipeReader::new(Arc::clone(&self.stderr))
    }

    /// Times stop() found no frame to target; observable so a controller
    /// can notice interrupts that landed nowhere.
    pub fn stop_misses(&self) -> u64 {
        self.stop_misses.load(Ordering::Relaxed)
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    fn set_running(&self, value: bool) {
        *self.running.lock().unwrap() = value;
    }

    /// Run `class.method()` in the remote process and return its rendered
    /// result. Failures are typed by cause: `Run` for user code throwing,
    /// `Terminated` for a dead engine, `Internal` for agent-side trouble.
    pub async fn invoke(&self, class: &str, method: &str) -> ExecResult<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecError::Terminated);
        }
        self.set_running(true);
        let result = self.do_invoke(class, method).await;
        self.set_running(false);
        result
    }

    async fn do_invoke(&self, class: &str, method: &str) -> ExecResult<String> {
        debug!(class, method, "forwarding invoke");
        let reply = self
            .channel
            .send(ops::INVOKE, encode_invoke(class, method))
            .await?;
        decode_invoke_reply(&reply)
    }

    /// Interrupt the in-flight invocation, if there is one. Never errors:
    /// a quiet engine means there is nothing to do, and a dying engine
    /// makes the interrupt moot.
    pub async fn stop(&self) {
        if !self.is_running() {
            debug!("stop requested with no invocation in progress");
            return;
        }
        // The flag was sampled as running, but the invocation can still
        // finish while we work; a vanished frame below is the benign form
        // of that race.
        match self.try_stop().await {
            Ok(true) => info!("stop delivered to user-code thread"),
            Ok(false) => {
                self.stop_misses.fetch_add(1, Ordering::Relaxed);
                debug!("no thread in the agent entry point; invocation likely completed");
            }
            Err(e) => debug!("stop abandoned: {}", e),
        }
    }

    async fn try_stop(&self) -> JdwpResult<bool> {
        self.debug.suspend_all().await?;

        let stacks = match self.collect_stacks().await {
            Ok(stacks) => stacks,
            Err(e) => {
                let _ = self.debug.resume_all().await;
                return Err(e);
            }
        };

        let target = find_invoke_thread(&stacks, &self.agent_signature, AGENT_INVOKE_METHOD);
        let Some(thread) = target else {
            self.debug.resume_all().await?;
            return Ok(false);
        };
        let thread_name = self.debug.thread_name(thread).await.unwrap_or_default();
        debug!(thread, name = %thread_name, "targeting user-code thread");

        if let Err(e) = self
            .debug
            .set_static_boolean(self.refs.class_id, self.refs.expecting_stop_field, true)
            .await
        {
            let _ = self.debug.resume_all().await;
            return Err(e);
        }

        self.debug.resume_all().await?;
        let stopped = self.debug.stop_thread(thread, self.refs.stop_exception).await;
        let cleared = self
            .debug
            .set_static_boolean(self.refs.class_id, self.refs.expecting_stop_field, false)
            .await;

        stopped?;
        cleared?;
        Ok(true)
    }

    /// Stacks of all suspended threads with frame names resolved; stale
    /// threads (died between listing and inspection) are skipped.
    async fn collect_stacks(&self) -> JdwpResult<Vec<ThreadStack>> {
        let threads = self.debug.all_threads().await?;
        let mut sig_cache: HashMap<ReferenceTypeId, String> = HashMap::new();
        let mut method_cache: HashMap<ReferenceTypeId, HashMap<MethodId, String>> = HashMap::new();
        let mut stacks = Vec::with_capacity(threads.len());

        for thread in threads {
            let frames = match self.debug.frames(thread, 0, -1).await {
                Ok(frames) => frames,
                Err(crate::jdwp::JdwpError::ErrorCode(code, _))
                    if error_codes::is_stale_thread(code) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut named = Vec::with_capacity(frames.len());
            for frame in frames {
                let class_id = frame.location.class_id;
                let signature = match sig_cache.get(&class_id) {
                    Some(sig) => sig.clone(),
                    None => {
                        let sig = self.debug.signature(class_id).await.unwrap_or_default();
                        sig_cache.insert(class_id, sig.clone());
                        sig
                    }
                };
                let method_name = self
                    .method_name(&mut method_cache, class_id, frame.location.method_id)
                    .await;
                named.push(FrameName {
                    class_signature: signature,
                    method_name,
                });
            }
            stacks.push(ThreadStack {
                thread,
                frames: named,
            });
        }
        Ok(stacks)
    }

    async fn method_name(
        &self,
        cache: &mut HashMap<ReferenceTypeId, HashMap<MethodId, String>>,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> String {
        if !cache.contains_key(&class_id) {
            let by_id = match self.debug.methods(class_id).await {
                Ok(methods) => methods
                    .into_iter()
                    .map(|m| (m.method_id, m.name))
                    .collect(),
                Err(_) => HashMap::new(),
            };
            cache.insert(class_id, by_id);
        }
        cache
            .get(&class_id)
            .and_then(|by_id| by_id.get(&method_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Forward a classpath addition unless suppression is active.
    pub async fn add_to_classpath(&self, path: &str) -> ExecResult<()> {
        if self.suppress_classpath.load(Ordering::SeqCst) {
            debug!(path, "classpath change suppressed");
            return Ok(());
        }
        let reply = self
            .channel
            .send(ops::ADD_CLASSPATH, encode_classpath(path))
            .await?;
        expect_ok(&reply)
    }

    /// Gate for bulk environment setup: while on, `add_to_classpath` is a
    /// recorded no-op and `refresh_classpath` does the actual work.
    pub fn suppress_classpath_changes(&self, on: bool) {
        self.suppress_classpath.store(on, Ordering::SeqCst);
    }

    /// Rebuild the remote classpath from scratch: explicit reset command,
    /// then the given entries, ignoring suppression.
    pub async fn refresh_classpath(&self, paths: &[String]) -> ExecResult<()> {
        let reply = self.channel.send(ops::RESET_CLASSPATH, vec![]).await?;
        expect_ok(&reply)?;
        for path in paths {
            let reply = self
                .channel
                .send(ops::ADD_CLASSPATH, encode_classpath(path))
                .await?;
            expect_ok(&reply)?;
        }
        Ok(())
    }

    /// Best-effort extension query; never errors. Engine termination also
    /// closes the forwarded output streams.
    pub async fn command_version_info(&self) -> HashMap<String, String> {
        match self.channel.send(ops::VERSION_INFO, vec![]).await {
            Ok(reply) if reply.code == reply_status::OK => {
                decode_version_info(&reply.payload).unwrap_or_else(|e| {
                    warn!("malformed version info payload: {}", e);
                    HashMap::new()
                })
            }
            Ok(reply) => {
                warn!(status = reply.code, "version info query refused");
                HashMap::new()
            }
            Err(e) if e.is_terminated() => {
                self.close_streams();
                HashMap::new()
            }
            Err(e) => {
                warn!("version info query failed: {}", e);
                HashMap::new()
            }
        }
    }

    /// Close the forwarded stdout/stderr streams. Idempotent.
    pub fn close_streams(&self) {
        self.stdout.close();
        self.stderr.close();
    }

    /// Ask the agent to exit, then tear the session down. Never errors.
    pub async fn request_shutdown(&self) {
        if self.channel.send(ops::SHUTDOWN, vec![]).await.is_err() {
            // Agent unreachable; fall back to a VM-level exit.
            let _ = self.debug.exit(0).await;
        }
        self.close().await;
    }

    /// Dispose the VM connection and terminate the process. Idempotent and
    /// safe under concurrent callers; an already-disconnected VM is treated
    /// as already closed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing execution bridge");
        if let Err(e) = self.debug.dispose().await {
            debug!("VM already disconnected: {}", e);
        }
        self.kill_tx.send(true).ok();
        self.close_streams();
    }

    /// A bridge with no live connections behind it, for exercising the
    /// session-facing surface.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (kill_tx, _kill_rx) = watch::channel(false);
        let (_dead_tx, dead_rx) = watch::channel(false);
        Self {
            channel: AgentChannel::disconnected(),
            debug: DebugLink::disconnected(),
            target: TargetSpec {
                vm_name: "detached".to_string(),
                vm_version: "0".to_string(),
                vm_description: String::new(),
                jdwp_major: 1,
                jdwp_minor: 8,
                agent_class: "replbridge.RemoteAgent".to_string(),
                protocol_version: 1,
            },
            refs: AgentRefs {
                class_id: 0,
                expecting_stop_field: 0,
                stop_exception: 0,
            },
            agent_signature: "Lreplbridge/RemoteAgent;".to_string(),
            running: Mutex::new(false),
            suppress_classpath: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop_misses: AtomicU64::new(0),
            stdout: Arc::new(Pipe::new()),
            stderr: Arc::new(Pipe::new()),
            kill_tx,
            dead_rx,
        }
    }
}

fn decode_invoke_reply(reply: &Frame) -> ExecResult<String> {
    let mut payload = reply.payload.as_slice();
    match reply.code {
        reply_status::OK => Ok(crate::wire::read_string(&mut payload)?),
        reply_status::USER_EXCEPTION => {
            let message = crate::wire::read_string(&mut payload)
                .unwrap_or_else(|_| "user exception".to_string());
            Err(ExecError::Run(message))
        }
        reply_status::FAILED => {
            let message = crate::wire::read_string(&mut payload)
                .unwrap_or_else(|_| "agent failure".to_string());
            Err(ExecError::internal(message))
        }
        other => Err(ExecError::Protocol(format!(
            "unknown invoke reply status {other}"
        ))),
    }
}

fn expect_ok(reply: &Frame) -> ExecResult<()> {
    if reply.code == reply_status::OK {
        Ok(())
    } else {
        let mut payload = reply.payload.as_slice();
        let message =
            crate::wire::read_string(&mut payload).unwrap_or_else(|_| "agent failure".to_string());
        Err(ExecError::internal(message))
    }
}

async fn resolve_agent_refs(
    debug: &DebugLink,
    agent_class: &str,
    agent_signature: &str,
) -> ExecResult<AgentRefs> {
    let classes = debug
        .classes_by_signature(agent_signature)
        .await
        .map_err(ExecError::from)?;
    let class = classes.first().ok_or_else(|| {
        ExecError::Handshake(format!("agent class {agent_class} not loaded in target VM"))
    })?;

    let fields = debug.fields(class.type_id).await.map_err(ExecError::from)?;
    let field_id = |name: &str| -> ExecResult<FieldId> {
        fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_id)
            .ok_or_else(|| ExecError::Handshake(format!("agent class lacks field {name}")))
    };
    let expecting_stop_field = field_id(EXPECTING_STOP_FIELD)?;
    let stop_exception_field = field_id(STOP_EXCEPTION_FIELD)?;

    let values = debug
        .static_values(class.type_id, &[stop_exception_field])
        .await
        .map_err(ExecError::from)?;
    let stop_exception = values
        .first()
        .and_then(|v| v.as_object())
        .filter(|id| *id != 0)
        .ok_or_else(|| ExecError::Handshake("agent stop exception not initialized".to_string()))?;

    Ok(AgentRefs {
        class_id: class.type_id,
        expecting_stop_field,
        stop_exception,
    })
}

/// Owns the child process. Exits (closing streams and firing the
/// terminated watch) when the process dies, either side's connection
/// drops, or a kill is requested.
async fn supervise(
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    mut channel_death: watch::Receiver<bool>,
    mut debug_death: watch::Receiver<bool>,
    dead_tx: watch::Sender<bool>,
    stdout: Arc<Pipe>,
    stderr: Arc<Pipe>,
) {
    let mut reap = false;
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!("remote process exited: {}", status),
                    Err(e) => warn!("failed to await remote process: {}", e),
                }
                break;
            }
            changed = kill_rx.changed() => {
                if changed.is_err() || *kill_rx.borrow() {
                    debug!("terminating remote process");
                    reap = true;
                    break;
                }
            }
            changed = channel_death.changed() => {
                if changed.is_err() || *channel_death.borrow() {
                    debug!("agent channel lost, terminating remote process");
                    reap = true;
                    break;
                }
            }
            changed = debug_death.changed() => {
                if changed.is_err() || *debug_death.borrow() {
                    debug!("debug link lost, terminating remote process");
                    reap = true;
                    break;
                }
            }
        }
    }

    if reap {
        child.start_kill().ok();
        child.wait().await.ok();
    }
    stdout.close();
    stderr.close();
    dead_tx.send(true).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(class: &str, method: &str) -> FrameName {
        FrameName {
            class_signature: class.to_string(),
            method_name: method.to_string(),
        }
    }

    #[test]
    fn binary_names_become_jni_signatures() {
        assert_eq!(
            binary_name_to_signature("replbridge.RemoteAgent"),
            "Lreplbridge/RemoteAgent;"
        );
        assert_eq!(binary_name_to_signature("Agent"), "LAgent;");
    }

    #[test]
    fn invoke_thread_is_found_by_frame_scan() {
        let stacks = vec![
            ThreadStack {
                thread: 1,
                frames: vec![frame("Ljava/lang/Object;", "wait")],
            },
            ThreadStack {
                thread: 2,
                frames: vec![
                    frame("Ljava/util/ArrayList;", "forEach"),
                    frame("Lreplbridge/RemoteAgent;", "invoke"),
                    frame("Lreplbridge/RemoteAgent;", "main"),
                ],
            },
        ];
        assert_eq!(
            find_invoke_thread(&stacks, "Lreplbridge/RemoteAgent;", "invoke"),
            Some(2)
        );
    }

    #[test]
    fn no_matching_frame_selects_no_thread() {
        let stacks = vec![ThreadStack {
            thread: 1,
            frames: vec![
                frame("Lreplbridge/RemoteAgent;", "main"),
                frame("Ljava/lang/Thread;", "run"),
            ],
        }];
        assert_eq!(
            find_invoke_thread(&stacks, "Lreplbridge/RemoteAgent;", "invoke"),
            None
        );
    }

    #[test]
    fn first_matching_thread_wins() {
        let stacks = vec![
            ThreadStack {
                thread: 5,
                frames: vec![frame("LA;", "invoke")],
            },
            ThreadStack {
                thread: 6,
                frames: vec![frame("LA;", "invoke")],
            },
        ];
        assert_eq!(find_invoke_thread(&stacks, "LA;", "invoke"), Some(5));
    }

    #[tokio::test]
    async fn stop_without_invocation_is_a_no_op() {
        let bridge = ExecutionBridge::detached();
        bridge.stop().await;
        assert_eq!(bridge.stop_misses(), 0);
        assert_eq!(bridge.state(), BridgeState::Connected);
    }

    #[tokio::test]
    async fn invoke_on_closed_bridge_reports_termination() {
        let bridge = ExecutionBridge::detached();
        bridge.close().await;
        assert!(matches!(
            bridge.invoke("$Unit1", "doIt").await,
            Err(ExecError::Terminated)
        ));
    }

    #[tokio::test]
    async fn invoke_over_dead_channel_reports_termination() {
        let bridge = ExecutionBridge::detached();
        assert!(matches!(
            bridge.invoke("$Unit1", "doIt").await,
            Err(ExecError::Terminated)
        ));
        // The flag transition still unwound.
        assert_eq!(bridge.state(), BridgeState::Connected);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let bridge = ExecutionBridge::detached();
        bridge.close().await;
        assert_eq!(bridge.state(), BridgeState::Closed);
        bridge.close().await;
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn suppression_short_circuits_classpath_changes() {
        let bridge = ExecutionBridge::detached();
        bridge.suppress_classpath_changes(true);
        // Channel is dead, so only the suppressed path can succeed.
        assert!(bridge.add_to_classpath("/tmp/lib.jar").await.is_ok());

        bridge.suppress_classpath_changes(false);
        assert!(matches!(
            bridge.add_to_classpath("/tmp/lib.jar").await,
            Err(ExecError::Terminated)
        ));
    }

    #[tokio::test]
    async fn version_info_degrades_to_empty_and_closes_streams() {
        let bridge = ExecutionBridge::detached();
        let info = bridge.command_version_info().await;
        assert!(info.is_empty());
        // Terminated channel also closed the forwarded streams.
        assert!(bridge.stdout.is_closed());
        assert!(bridge.stderr.is_closed());
    }

    #[tokio::test]
    async fn invoke_reply_statuses_map_to_error_kinds() {
        let ok = Frame {
            id: 1,
            kind: crate::agent::protocol::frame_kinds::REPLY,
            code: reply_status::OK,
            payload: {
                let mut p = Vec::new();
                crate::wire::put_string(&mut p, "42");
                p
            },
        };
        assert_eq!(decode_invoke_reply(&ok).unwrap(), "42");

        let threw = Frame {
            id: 2,
            kind: crate::agent::protocol::frame_kinds::REPLY,
            code: reply_status::USER_EXCEPTION,
            payload: {
                let mut p = Vec::new();
                crate::wire::put_string(&mut p, "java.lang.IllegalStateException: boom");
                p
            },
        };
        assert!(matches!(decode_invoke_reply(&threw), Err(ExecError::Run(_))));

        let failed = Frame {
            id: 3,
            kind: crate::agent::protocol::frame_kinds::REPLY,
            code: reply_status::FAILED,
            payload: Vec::new(),
        };
        assert!(matches!(
            decode_invoke_reply(&failed),
            Err(ExecError::Internal { .. })
        ));
    }
}
