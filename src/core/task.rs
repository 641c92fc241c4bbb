//! Backend lifecycle tasks.
//!
//! A task moves `Init -> PreExecute -> FakeExecute | RealExecute -> Done`.
//! Whichever [`Executor`] the [`TaskExecutor`] was built with runs the command;
//! the outcome is always reported through the [`StateNotifier`], which is the
//! only way the lifecycle layer learns what happened.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BackendSettings;
use crate::core::command::{BackendCommand, LifecycleVerb, VmState};
use crate::errors::{BackendFailure, ProvisionError, ProvisionResult};

/// Exit code meaning "done, but post-success cleanup failed".
pub const EXIT_CLEANUP_FAILED: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    PreExecute,
    FakeExecute,
    RealExecute,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub vm_id: u64,
    pub name: String,
    /// State reported when the command succeeds.
    pub notify_state: VmState,
    pub async_op: bool,
    pub fake: bool,
    /// Filled in by the real executor before it touches the backend.
    pub access_granted: Option<bool>,
}

impl TaskContext {
    pub fn for_command(command: &BackendCommand, fake: bool) -> Self {
        Self {
            vm_id: command.vm_id,
            name: command.vm_name.clone(),
            notify_state: command.verb.success_state(),
            async_op: command.verb.is_async(),
            fake,
            access_granted: None,
        }
    }
}

#[derive(Debug)]
pub struct VmmTask {
    context: Option<TaskContext>,
    command: BackendCommand,
    state: TaskState,
}

impl VmmTask {
    pub fn new(command: BackendCommand, context: Option<TaskContext>) -> Self {
        Self {
            context,
            command,
            state: TaskState::Init,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn context(&self) -> Option<&TaskContext> {
        self.context.as_ref()
    }

    pub fn command(&self) -> &BackendCommand {
        &self.command
    }

    fn enter(&mut self, state: TaskState) {
        debug!(vm_id = self.command.vm_id, verb = %self.command.verb, from = ?self.state, to = ?state, "Task transition");
        self.state = state;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(VmState),
    Failed(ProvisionError),
    /// Launched; the backend will call back later.
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub vm_id: u64,
    pub state: VmState,
    pub error: Option<ProvisionError>,
}

pub trait StateNotifier: Send + Sync {
    fn notify(&self, change: StateChange);
}

/// Delivers state changes over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<StateChange>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateNotifier for ChannelNotifier {
    fn notify(&self, change: StateChange) {
        if self.tx.send(change).is_err() {
            warn!("State change receiver is gone, dropping notification");
        }
    }
}

/// Is this context still allowed to act on its instance?
pub trait AccessCheck: Send + Sync {
    fn is_authorized(&self, context: &TaskContext, verb: LifecycleVerb) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn is_authorized(&self, _context: &TaskContext, _verb: LifecycleVerb) -> bool {
        true
    }
}

/// Extension point run before the command; an error short-circuits the task.
pub trait TaskHooks: Send + Sync {
    fn pre_execute(&self, _context: &TaskContext, _fake: bool) -> ProvisionResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl TaskHooks for NoHooks {}

#[async_trait]
pub trait Executor: Send + Sync {
    fn is_fake(&self) -> bool;

    async fn execute(
        &self,
        context: &mut TaskContext,
        command: &BackendCommand,
    ) -> ProvisionResult<()>;
}

/// Runs the backend control program.
pub struct RealExecutor {
    program: PathBuf,
    access: Arc<dyn AccessCheck>,
}

impl RealExecutor {
    pub fn new(program: PathBuf, access: Arc<dyn AccessCheck>) -> Self {
        Self { program, access }
    }
}

#[async_trait]
impl Executor for RealExecutor {
    fn is_fake(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        context: &mut TaskContext,
        command: &BackendCommand,
    ) -> ProvisionResult<()> {
        let granted = self.access.is_authorized(context, command.verb);
        context.access_granted = Some(granted);
        if !granted {
            warn!(vm_id = context.vm_id, verb = %command.verb, "Access check failed, not running backend");
            return Err(ProvisionError::Authorization {
                vm_id: context.vm_id,
                message: format!("instance is gone or no longer accessible for {}", command.verb),
            });
        }

        let program = self.program.display().to_string();
        info!(vm_id = context.vm_id, command = %command.command_line(&program), "Running backend command");

        let output = Command::new(&self.program)
            .args(&command.args)
            .output()
            .await
            .map_err(|e| {
                error!(program = %program, error = %e, "Could not launch backend program");
                ProvisionError::Backend {
                    code: -1,
                    category: BackendFailure::PreBackend,
                    stderr: e.to_string(),
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(vm_id = context.vm_id, stdout = %stdout.trim(), "Backend output");
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        interpret_exit(context.vm_id, command.verb, output.status.code(), stderr)
    }
}

/// Map the control program's exit status onto the error taxonomy.
pub fn interpret_exit(
    vm_id: u64,
    verb: LifecycleVerb,
    code: Option<i32>,
    stderr: String,
) -> ProvisionResult<()> {
    match code {
        Some(0) => Ok(()),
        Some(EXIT_CLEANUP_FAILED) => {
            // the primary operation already committed
            error!(
                vm_id,
                verb = %verb,
                exit_code = EXIT_CLEANUP_FAILED,
                stderr = %stderr,
                "Backend succeeded but cleanup afterwards failed"
            );
            Ok(())
        }
        Some(code) => {
            let category = BackendFailure::from_exit_code(code);
            error!(vm_id, verb = %verb, exit_code = code, category = %category, stderr = %stderr, "Backend command failed");
            Err(ProvisionError::Backend {
                code,
                category,
                stderr,
            })
        }
        None => {
            error!(vm_id, verb = %verb, "Backend command killed by signal");
            Err(ProvisionError::Backend {
                code: -1,
                category: BackendFailure::Generic,
                stderr,
            })
        }
    }
}

/// Logs instead of running; optionally waits to mimic backend latency.
pub struct FakeExecutor {
    program: String,
    lag: Option<Duration>,
}

impl FakeExecutor {
    pub fn new(program: impl Into<String>, lag: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            lag,
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn is_fake(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        context: &mut TaskContext,
        command: &BackendCommand,
    ) -> ProvisionResult<()> {
        info!(
            vm_id = context.vm_id,
            command = %command.command_line(&self.program),
            "Fake mode, not running backend command"
        );
        if let Some(lag) = self.lag {
            tokio::time::sleep(lag).await;
        }
        Ok(())
    }
}

pub struct TaskExecutor {
    executor: Arc<dyn Executor>,
    notifier: Arc<dyn StateNotifier>,
    hooks: Arc<dyn TaskHooks>,
    workers: Arc<Semaphore>,
    notify_endpoint: Option<String>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("fake", &self.executor.is_fake())
            .field("idle_workers", &self.workers.available_permits())
            .finish()
    }
}

impl TaskExecutor {
    /// Picks the real or fake executor once, from settings.
    pub fn new(
        settings: &BackendSettings,
        access: Arc<dyn AccessCheck>,
        notifier: Arc<dyn StateNotifier>,
    ) -> Self {
        let executor: Arc<dyn Executor> = if settings.fake {
            Arc::new(FakeExecutor::new(
                settings.control_program.display().to_string(),
                settings.fake_lag(),
            ))
        } else {
            Arc::new(RealExecutor::new(settings.control_program.clone(), access))
        };
        Self::with_executor(executor, notifier, settings.workers)
            .with_notify_endpoint(settings.notify_endpoint.clone())
    }

    pub fn with_executor(
        executor: Arc<dyn Executor>,
        notifier: Arc<dyn StateNotifier>,
        workers: usize,
    ) -> Self {
        Self {
            executor,
            notifier,
            hooks: Arc::new(NoHooks),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            notify_endpoint: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TaskHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_notify_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.notify_endpoint = endpoint;
        self
    }

    pub fn is_fake(&self) -> bool {
        self.executor.is_fake()
    }

    pub fn notify_endpoint(&self) -> Option<&str> {
        self.notify_endpoint.as_deref()
    }

    /// Build a task for `command` with a context matching this executor.
    pub fn task(&self, command: BackendCommand) -> VmmTask {
        let context = TaskContext::for_command(&command, self.is_fake());
        VmmTask::new(command, Some(context))
    }

    /// Drive one task to completion on the current thread.
    pub async fn run(&self, task: &mut VmmTask) -> TaskOutcome {
        let Some(mut context) = task.context.take() else {
            error!(
                verb = %task.command.verb,
                vm_id = task.command.vm_id,
                "Task has no context, refusing to run it"
            );
            task.enter(TaskState::Done);
            return TaskOutcome::Failed(ProvisionError::manage("task dispatched without a context"));
        };

        let outcome = self.drive(task, &mut context).await;
        task.context = Some(context);
        task.enter(TaskState::Done);
        outcome
    }

    async fn drive(&self, task: &mut VmmTask, context: &mut TaskContext) -> TaskOutcome {
        let fake = self.executor.is_fake();

        task.enter(TaskState::PreExecute);
        if let Err(e) = self.hooks.pre_execute(context, fake) {
            return self.fail(context.vm_id, e);
        }

        task.enter(if fake {
            TaskState::FakeExecute
        } else {
            TaskState::RealExecute
        });
        if let Err(e) = self.executor.execute(context, &task.command).await {
            return self.fail(context.vm_id, e);
        }

        if context.async_op && !fake {
            info!(vm_id = context.vm_id, verb = %task.command.verb, "Async backend operation launched");
            return TaskOutcome::Pending;
        }
        // fake async verbs synthesize the callback the backend would send
        self.notifier.notify(StateChange {
            vm_id: context.vm_id,
            state: context.notify_state,
            error: None,
        });
        TaskOutcome::Succeeded(context.notify_state)
    }

    fn fail(&self, vm_id: u64, error: ProvisionError) -> TaskOutcome {
        self.notifier.notify(StateChange {
            vm_id,
            state: VmState::Corrupted,
            error: Some(error.clone()),
        });
        TaskOutcome::Failed(error)
    }

    /// Run `task` on the worker pool.
    pub fn dispatch(self: &Arc<Self>, mut task: VmmTask) -> JoinHandle<TaskOutcome> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match executor.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return TaskOutcome::Failed(ProvisionError::manage("worker pool is shut down"))
                }
            };
            executor.run(&mut task).await
        })
    }

    /// Callback for async verbs once the backend reports back.
    pub fn complete_async(&self, vm_id: u64, verb: LifecycleVerb, result: ProvisionResult<()>) {
        match result {
            Ok(()) => {
                info!(vm_id, verb = %verb, "Async backend operation completed");
                self.notifier.notify(StateChange {
                    vm_id,
                    state: verb.success_state(),
                    error: None,
                });
            }
            Err(e) => {
                error!(vm_id, verb = %verb, error = %e, "Async backend operation failed");
                self.notifier.notify(StateChange {
                    vm_id,
                    state: VmState::Corrupted,
                    error: Some(e),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::PropagateTarget;
    use crate::core::vm::{Deployment, Partition, ShutdownMechanism, VmSpec};

    fn spec() -> VmSpec {
        VmSpec {
            id: 3,
            name: "vm-3".into(),
            partitions: vec![Partition {
                image: "file:///images/base.img".into(),
                mount_as: "sda".into(),
                read_write: true,
                root_disk: true,
                blank_space_mb: None,
            }],
            deployment: Deployment {
                memory_mb: 256,
                vcpus: 1,
                shutdown: ShutdownMechanism::Normal,
            },
            nics: Vec::new(),
            kernel: None,
            kernel_args: None,
            customizations: Vec::new(),
            credential: None,
        }
    }

    fn fake_executor() -> (TaskExecutor, mpsc::UnboundedReceiver<StateChange>) {
        let (notifier, rx) = ChannelNotifier::new();
        let executor = TaskExecutor::with_executor(
            Arc::new(FakeExecutor::new("/opt/vmm/bin/control", None)),
            Arc::new(notifier),
            2,
        );
        (executor, rx)
    }

    #[test]
    fn exit_codes_are_translated() {
        assert!(interpret_exit(1, LifecycleVerb::Create, Some(0), String::new()).is_ok());
        assert!(interpret_exit(1, LifecycleVerb::Create, Some(9), "cleanup".into()).is_ok());

        let err = interpret_exit(1, LifecycleVerb::Create, Some(2), "bad memory".into()).unwrap_err();
        assert_eq!(
            err,
            ProvisionError::Backend {
                code: 2,
                category: BackendFailure::Validation,
                stderr: "bad memory".into()
            }
        );
        assert!(matches!(
            interpret_exit(1, LifecycleVerb::Create, Some(1), String::new()),
            Err(ProvisionError::Backend { category: BackendFailure::PreBackend, .. })
        ));
        assert!(matches!(
            interpret_exit(1, LifecycleVerb::Create, Some(3), String::new()),
            Err(ProvisionError::Backend { category: BackendFailure::Runtime, .. })
        ));
        assert!(matches!(
            interpret_exit(1, LifecycleVerb::Create, Some(77), String::new()),
            Err(ProvisionError::Backend { category: BackendFailure::Generic, .. })
        ));
        assert!(interpret_exit(1, LifecycleVerb::Create, None, String::new()).is_err());
    }

    #[tokio::test]
    async fn fake_create_notifies_running() {
        let (executor, mut rx) = fake_executor();
        let mut task = executor.task(BackendCommand::create(&spec()));

        let outcome = executor.run(&mut task).await;
        assert_eq!(outcome, TaskOutcome::Succeeded(VmState::Running));
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(
            rx.recv().await.unwrap(),
            StateChange { vm_id: 3, state: VmState::Running, error: None }
        );
    }

    #[tokio::test]
    async fn fake_async_verbs_synthesize_callback() {
        let (executor, mut rx) = fake_executor();
        let command = BackendCommand::propagate(&spec(), PropagateTarget::Pause, None);
        let mut task = executor.task(command);

        assert_eq!(executor.run(&mut task).await, TaskOutcome::Succeeded(VmState::Paused));
        assert_eq!(rx.recv().await.unwrap().state, VmState::Paused);
    }

    #[tokio::test]
    async fn missing_context_fails_without_notification() {
        let (executor, mut rx) = fake_executor();
        let mut task = VmmTask::new(BackendCommand::pause(&spec()), None);

        assert!(matches!(executor.run(&mut task).await, TaskOutcome::Failed(ProvisionError::Manage { .. })));
        drop(executor);
        assert!(rx.recv().await.is_none());
    }

    struct RejectAll;

    impl TaskHooks for RejectAll {
        fn pre_execute(&self, context: &TaskContext, _fake: bool) -> ProvisionResult<()> {
            Err(ProvisionError::Authorization {
                vm_id: context.vm_id,
                message: "revoked".into(),
            })
        }
    }

    #[tokio::test]
    async fn pre_execute_error_short_circuits() {
        let (executor, mut rx) = fake_executor();
        let executor = executor.with_hooks(Arc::new(RejectAll));
        let mut task = executor.task(BackendCommand::reboot(&spec()));

        assert!(matches!(executor.run(&mut task).await, TaskOutcome::Failed(_)));
        let change = rx.recv().await.unwrap();
        assert_eq!(change.state, VmState::Corrupted);
        assert!(matches!(change.error, Some(ProvisionError::Authorization { .. })));
    }

    struct DenyAll;

    impl AccessCheck for DenyAll {
        fn is_authorized(&self, _context: &TaskContext, _verb: LifecycleVerb) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn real_executor_checks_access_before_running() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let executor = TaskExecutor::with_executor(
            Arc::new(RealExecutor::new(PathBuf::from("/nonexistent/control"), Arc::new(DenyAll))),
            Arc::new(notifier),
            1,
        );
        let mut task = executor.task(BackendCommand::remove(&spec()));

        let outcome = executor.run(&mut task).await;
        assert!(matches!(outcome, TaskOutcome::Failed(ProvisionError::Authorization { vm_id: 3, .. })));
        assert_eq!(task.context().unwrap().access_granted, Some(false));
        assert_eq!(rx.recv().await.unwrap().state, VmState::Corrupted);
    }

    #[tokio::test]
    async fn missing_program_is_pre_backend_failure() {
        let (notifier, _rx) = ChannelNotifier::new();
        let executor = TaskExecutor::with_executor(
            Arc::new(RealExecutor::new(PathBuf::from("/nonexistent/control"), Arc::new(AllowAll))),
            Arc::new(notifier),
            1,
        );
        let mut task = executor.task(BackendCommand::pause(&spec()));

        assert!(matches!(
            executor.run(&mut task).await,
            TaskOutcome::Failed(ProvisionError::Backend { category: BackendFailure::PreBackend, .. })
        ));
    }

    #[tokio::test]
    async fn complete_async_delivers_terminal_state() {
        let (executor, mut rx) = fake_executor();
        executor.complete_async(5, LifecycleVerb::Unpropagate, Ok(()));
        executor.complete_async(
            6,
            LifecycleVerb::Propagate(PropagateTarget::Start),
            Err(ProvisionError::denied("gone")),
        );

        assert_eq!(rx.recv().await.unwrap().state, VmState::ReadyForTransport);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.vm_id, 6);
        assert_eq!(failed.state, VmState::Corrupted);
    }
}
