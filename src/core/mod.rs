pub mod command;
pub mod creation;
pub mod task;
pub mod vm;

// exports for lazy devs like us
pub use command::{BackendCommand, LifecycleVerb, PropagateTarget, VmState};
pub use creation::{CreateRequest, CreationManager, CustomizationRequest, InstanceRegistry};
pub use task::{
    AccessCheck, ChannelNotifier, Executor, FakeExecutor, RealExecutor, StateChange,
    StateNotifier, TaskContext, TaskExecutor, TaskOutcome, VmmTask,
};
pub use vm::{Deployment, FileCopy, InstanceHandle, NicBinding, Partition, ShutdownMechanism, VmSpec};
