// Snippet session
//
// Owns the evaluation lifecycle: wraps input, runs it through the
// executor, tracks snippet statuses, and stops offering evaluation once
// the engine is gone.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use exec_client::{ExecError, ExecResult, ExecutionBridge, TargetSpec};

use crate::wrap::{self, Snippet, SnippetId, SnippetRegistry, SnippetStatus};

/// What the session needs from the remote side. `ExecutionBridge` is the
/// real implementation; tests script one.
#[async_trait]
pub trait SnippetExecutor: Send + Sync {
    async fn invoke(&self, class: &str, method: &str) -> ExecResult<String>;
    async fn stop(&self);
    async fn add_to_classpath(&self, path: &str) -> ExecResult<()>;
    fn suppress_classpath_changes(&self, on: bool);
    async fn refresh_classpath(&self, paths: &[String]) -> ExecResult<()>;
    async fn version_info(&self) -> HashMap<String, String>;
    async fn shutdown(&self);
    fn target_spec(&self) -> TargetSpec;
}

#[async_trait]
impl SnippetExecutor for ExecutionBridge {
    async fn invoke(&self, class: &str, method: &str) -> ExecResult<String> {
        ExecutionBridge::invoke(self, class, method).await
    }

    async fn stop(&self) {
        ExecutionBridge::stop(self).await;
    }

    async fn add_to_classpath(&self, path: &str) -> ExecResult<()> {
        ExecutionBridge::add_to_classpath(self, path).await
    }

    fn suppress_classpath_changes(&self, on: bool) {
        ExecutionBridge::suppress_classpath_changes(self, on);
    }

    async fn refresh_classpath(&self, paths: &[String]) -> ExecResult<()> {
        ExecutionBridge::refresh_classpath(self, paths).await
    }

    async fn version_info(&self) -> HashMap<String, String> {
        self.command_version_info().await
    }

    async fn shutdown(&self) {
        self.request_shutdown().await;
    }

    fn target_spec(&self) -> TargetSpec {
        ExecutionBridge::target_spec(self).clone()
    }
}

#[async_trait]
impl<T: SnippetExecutor> SnippetExecutor for Arc<T> {
    async fn invoke(&self, class: &str, method: &str) -> ExecResult<String> {
        (**self).invoke(class, method).await
    }

    async fn stop(&self) {
        (**self).stop().await;
    }

    async fn add_to_classpath(&self, path: &str) -> ExecResult<()> {
        (**self).add_to_classpath(path).await
    }

    fn suppress_classpath_changes(&self, on: bool) {
        (**self).suppress_classpath_changes(on);
    }

    async fn refresh_classpath(&self, paths: &[String]) -> ExecResult<()> {
        (**self).refresh_classpath(paths).await
    }

    async fn version_info(&self) -> HashMap<String, String> {
        (**self).version_info().await
    }

    async fn shutdown(&self) {
        (**self).shutdown().await;
    }

    fn target_spec(&self) -> TargetSpec {
        (**self).target_spec()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("input does not resolve to exactly one snippet")]
    NotOneUnit,

    #[error("remote engine terminated")]
    Terminated,

    #[error("session is closed")]
    Closed,

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Result of evaluating one snippet. Run failures are evaluation results,
/// not session errors.
#[derive(Debug)]
pub enum Evaluation {
    Value {
        id: SnippetId,
        rendered: String,
        /// Earlier definitions this one replaced.
        replaced: Vec<SnippetId>,
        /// Valid declarations that referenced a replaced definition.
        affected: Vec<SnippetId>,
    },
    Exception {
        id: SnippetId,
        message: String,
    },
    Rejected {
        id: SnippetId,
        message: String,
    },
}

pub struct Session<E: SnippetExecutor> {
    executor: E,
    registry: SnippetRegistry,
    dead: bool,
}

impl<E: SnippetExecutor> Session<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            registry: SnippetRegistry::new(),
            dead: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.dead
    }

    pub fn snippets(&self) -> impl Iterator<Item = &Snippet> {
        self.registry.iter()
    }

    pub fn target_spec(&self) -> TargetSpec {
        self.executor.target_spec()
    }

    pub async fn version_info(&self) -> HashMap<String, String> {
        self.executor.version_info().await
    }

    /// Wrap and run one unit of input.
    pub async fn eval(&mut self, text: &str) -> Result<Evaluation, SessionError> {
        if self.dead {
            return Err(SessionError::Closed);
        }

        let class_name = self.registry.next_class_name();
        let wrapper = wrap::wrap_input(text, &class_name).ok_or(SessionError::NotOneUnit)?;
        let id = self.registry.register(&wrapper);
        debug!(id, class = %wrapper.class_name, "evaluating snippet");

        match self
            .executor
            .invoke(&wrapper.class_name, wrap::ENTRY_METHOD)
            .await
        {
            Ok(rendered) => {
                let replaced = self.registry.mark_valid(id);
                let affected = replaced
                    .iter()
                    .flat_map(|&old| self.registry.dependents(old))
                    .filter(|dep| *dep != id)
                    .collect();
                Ok(Evaluation::Value {
                    id,
                    rendered,
                    replaced,
                    affected,
                })
            }
            Err(ExecError::Run(message)) => {
                // The snippet itself is sound; its execution threw.
                self.registry.mark_valid(id);
                Ok(Evaluation::Exception { id, message })
            }
            Err(ExecError::Terminated) => {
                info!("engine terminated during evaluation");
                self.dead = true;
                Err(SessionError::Terminated)
            }
            Err(other) => {
                warn!(id, "snippet rejected: {}", other);
                self.registry.set_status(id, SnippetStatus::Rejected);
                Ok(Evaluation::Rejected {
                    id,
                    message: other.to_string(),
                })
            }
        }
    }

    /// Interrupt the in-flight evaluation, if any.
    pub async fn stop(&self) {
        self.executor.stop().await;
    }

    /// Retire a snippet and report which valid declarations referenced it.
    pub fn drop_snippet(&mut self, id: SnippetId) -> Option<Vec<SnippetId>> {
        self.registry.drop_snippet(id)
    }

    pub fn wrap(&self, id: SnippetId) -> Option<wrap::Wrapper> {
        self.registry.wrap(id)
    }

    pub fn dependents(&self, id: SnippetId) -> Vec<SnippetId> {
        self.registry.dependents(id)
    }

    pub async fn add_classpath(&mut self, path: &str) -> Result<(), SessionError> {
        let result = self.executor.add_to_classpath(path).await;
        self.check_exec(result)
    }

    /// Bulk environment rebuild: adds are suppressed while the new set is
    /// pushed with an explicit reset.
    pub async fn rebuild_classpath(&mut self, paths: &[String]) -> Result<(), SessionError> {
        self.executor.suppress_classpath_changes(true);
        let result = self.executor.refresh_classpath(paths).await;
        self.executor.suppress_classpath_changes(false);
        self.check_exec(result)
    }

    /// Shut the engine down; the session stops offering evaluation.
    pub async fn shutdown(&mut self) {
        self.executor.shutdown().await;
        self.dead = true;
    }

    fn check_exec(&mut self, result: ExecResult<()>) -> Result<(), SessionError> {
        match result {
            Ok(()) => Ok(()),
            Err(ExecError::Terminated) => {
                self.dead = true;
                Err(SessionError::Terminated)
            }
            Err(other) => Err(SessionError::Exec(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted executor: pops one canned reply per invoke and records
    /// every call.
    #[derive(Default)]
    struct MockExecutor {
        replies: Mutex<VecDeque<ExecResult<String>>>,
        invoked: Mutex<Vec<(String, String)>>,
        stops: AtomicUsize,
        classpath: Mutex<Vec<String>>,
        suppression: Mutex<Vec<bool>>,
        shutdowns: AtomicUsize,
    }

    impl MockExecutor {
        fn scripted(replies: Vec<ExecResult<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SnippetExecutor for MockExecutor {
        async fn invoke(&self, class: &str, method: &str) -> ExecResult<String> {
            self.invoked
                .lock()
                .unwrap()
                .push((class.to_string(), method.to_string()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ExecError::Terminated))
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        async fn add_to_classpath(&self, path: &str) -> ExecResult<()> {
            self.classpath.lock().unwrap().push(path.to_string());
            Ok(())
        }

        fn suppress_classpath_changes(&self, on: bool) {
            self.suppression.lock().unwrap().push(on);
        }

        async fn refresh_classpath(&self, paths: &[String]) -> ExecResult<()> {
            let mut recorded = self.classpath.lock().unwrap();
            recorded.clear();
            recorded.extend(paths.iter().cloned());
            Ok(())
        }

        async fn version_info(&self) -> HashMap<String, String> {
            HashMap::from([("engine".to_string(), "mock".to_string())])
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn target_spec(&self) -> TargetSpec {
            TargetSpec {
                vm_name: "mock".to_string(),
                vm_version: "0".to_string(),
                vm_description: String::new(),
                jdwp_major: 1,
                jdwp_minor: 8,
                agent_class: "replbridge.RemoteAgent".to_string(),
                protocol_version: 1,
            }
        }
    }

    #[tokio::test]
    async fn successful_eval_marks_snippet_valid() {
        let mut session = Session::new(MockExecutor::scripted(vec![Ok("42".to_string())]));

        let outcome = session.eval("6 * 7").await.unwrap();
        match outcome {
            Evaluation::Value { id, rendered, .. } => {
                assert_eq!(rendered, "42");
                assert_eq!(
                    session.snippets().find(|s| s.id == id).unwrap().status,
                    SnippetStatus::Valid
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let invoked = session.executor.invoked.lock().unwrap();
        assert_eq!(invoked.len(), 1);
        assert_eq!(invoked[0].0, "$Unit1");
        assert_eq!(invoked[0].1, wrap::ENTRY_METHOD);
    }

    #[tokio::test]
    async fn redefinition_reports_replaced_and_affected() {
        let mut session = Session::new(MockExecutor::scripted(vec![
            Ok("5".to_string()),
            Ok("10".to_string()),
            Ok("7".to_string()),
        ]));

        let base_id = match session.eval("int base = 5;").await.unwrap() {
            Evaluation::Value { id, .. } => id,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let derived_id = match session.eval("int doubled = base * 2;").await.unwrap() {
            Evaluation::Value { id, .. } => id,
            other => panic!("unexpected outcome: {other:?}"),
        };

        match session.eval("int base = 7;").await.unwrap() {
            Evaluation::Value {
                replaced, affected, ..
            } => {
                assert_eq!(replaced, vec![base_id]);
                assert_eq!(affected, vec![derived_id]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_failure_is_an_evaluation_result() {
        let mut session = Session::new(MockExecutor::scripted(vec![Err(ExecError::Run(
            "java.lang.ArithmeticException: / by zero".to_string(),
        ))]));

        match session.eval("1 / 0").await.unwrap() {
            Evaluation::Exception { id, message } => {
                assert!(message.contains("ArithmeticException"));
                // Ran and threw: the snippet itself stays valid.
                assert_eq!(
                    session.snippets().find(|s| s.id == id).unwrap().status,
                    SnippetStatus::Valid
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn agent_failure_rejects_the_snippet() {
        let mut session = Session::new(MockExecutor::scripted(vec![Err(ExecError::internal(
            "class load failed",
        ))]));

        match session.eval("int x = 5;").await.unwrap() {
            Evaluation::Rejected { id, .. } => {
                assert_eq!(
                    session.snippets().find(|s| s.id == id).unwrap().status,
                    SnippetStatus::Rejected
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn termination_closes_the_session() {
        let mut session = Session::new(MockExecutor::scripted(vec![Err(ExecError::Terminated)]));

        assert!(matches!(
            session.eval("1 + 1").await,
            Err(SessionError::Terminated)
        ));
        assert!(session.is_closed());
        assert!(matches!(
            session.eval("2 + 2").await,
            Err(SessionError::Closed)
        ));
        // The second eval never reached the executor.
        assert_eq!(session.executor.invoked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_input_registers_nothing() {
        let mut session = Session::new(MockExecutor::scripted(vec![Ok("unused".to_string())]));

        assert!(matches!(
            session.eval("int a = 1; int b = 2;").await,
            Err(SessionError::NotOneUnit)
        ));
        assert_eq!(session.snippets().count(), 0);
        assert!(session.executor.invoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_passes_through() {
        let session = Session::new(MockExecutor::default());
        session.stop().await;
        session.stop().await;
        assert_eq!(session.executor.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn classpath_entries_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().into_owned();

        let mut session = Session::new(MockExecutor::default());
        session.add_classpath(&path).await.unwrap();
        assert_eq!(*session.executor.classpath.lock().unwrap(), vec![path]);
    }

    #[tokio::test]
    async fn classpath_rebuild_brackets_with_suppression() {
        let mut session = Session::new(MockExecutor::default());
        let paths = vec!["/opt/a.jar".to_string(), "/opt/b.jar".to_string()];
        session.rebuild_classpath(&paths).await.unwrap();

        assert_eq!(
            *session.executor.suppression.lock().unwrap(),
            vec![true, false]
        );
        assert_eq!(*session.executor.classpath.lock().unwrap(), paths);
    }

    #[tokio::test]
    async fn shutdown_stops_offering_evaluation() {
        let mut session = Session::new(MockExecutor::default());
        session.shutdown().await;
        assert_eq!(session.executor.shutdowns.load(Ordering::SeqCst), 1);
        assert!(matches!(session.eval("1").await, Err(SessionError::Closed)));
    }
}
