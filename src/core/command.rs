//! Argument lists for the backend control program, one builder per
//! lifecycle verb.
//!
//! Image entries carry several fields of their own, so two delimiters are in
//! play: `;` between the fields of one entry and `;;` between entries.
//!
//! ```text
//! root disk:  <image>;rootdisk;<rw|ro>
//! regular:    <image>;<rw|ro>
//! blank:      blankcreate://<size_mb>;rw
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::vm::{PartitionKind, ShutdownMechanism, VmSpec};

pub const FIELD_SEPARATOR: &str = ";";
pub const GROUP_SEPARATOR: &str = ";;";

/// Where an instance is, as reported back to the lifecycle layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Propagated,
    Running,
    Paused,
    ReadyForTransport,
    Destroyed,
    Corrupted,
}

/// What to do once propagation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagateTarget {
    Start,
    Pause,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleVerb {
    Create,
    Propagate(PropagateTarget),
    Unpropagate,
    Pause,
    Unpause,
    Reboot,
    Remove,
}

impl LifecycleVerb {
    pub fn flag(&self) -> &'static str {
        match self {
            LifecycleVerb::Create => "--create",
            LifecycleVerb::Propagate(_) => "--propagate",
            LifecycleVerb::Unpropagate => "--unpropagate",
            LifecycleVerb::Pause => "--pause",
            LifecycleVerb::Unpause => "--unpause",
            LifecycleVerb::Reboot => "--reboot",
            LifecycleVerb::Remove => "--remove",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleVerb::Create => "create",
            LifecycleVerb::Propagate(PropagateTarget::Start) => "propagate-to-start",
            LifecycleVerb::Propagate(PropagateTarget::Pause) => "propagate-to-pause",
            LifecycleVerb::Propagate(PropagateTarget::None) => "propagate-only",
            LifecycleVerb::Unpropagate => "ready-for-transport",
            LifecycleVerb::Pause => "pause",
            LifecycleVerb::Unpause => "unpause",
            LifecycleVerb::Reboot => "reboot",
            LifecycleVerb::Remove => "remove",
        }
    }

    /// The backend reports completion of these later, through a callback.
    pub fn is_async(&self) -> bool {
        matches!(self, LifecycleVerb::Propagate(_) | LifecycleVerb::Unpropagate)
    }

    pub fn success_state(&self) -> VmState {
        match self {
            LifecycleVerb::Create => VmState::Running,
            LifecycleVerb::Propagate(PropagateTarget::Start) => VmState::Running,
            LifecycleVerb::Propagate(PropagateTarget::Pause) => VmState::Paused,
            LifecycleVerb::Propagate(PropagateTarget::None) => VmState::Propagated,
            LifecycleVerb::Unpropagate => VmState::ReadyForTransport,
            LifecycleVerb::Pause => VmState::Paused,
            LifecycleVerb::Unpause => VmState::Running,
            LifecycleVerb::Reboot => VmState::Running,
            LifecycleVerb::Remove => VmState::Destroyed,
        }
    }
}

impl fmt::Display for LifecycleVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub verb: LifecycleVerb,
    pub vm_id: u64,
    pub vm_name: String,
    pub args: Vec<String>,
}

impl BackendCommand {
    fn start(verb: LifecycleVerb, spec: &VmSpec) -> Self {
        Self {
            verb,
            vm_id: spec.id,
            vm_name: spec.name.clone(),
            args: vec![verb.flag().to_string(), "--name".to_string(), spec.name.clone()],
        }
    }

    fn arg(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.into());
        self
    }

    fn arg_opt(self, flag: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.arg(flag, value),
            None => self,
        }
    }

    fn switch(mut self, flag: &str, on: bool) -> Self {
        if on {
            self.args.push(flag.to_string());
        }
        self
    }

    fn images(self, spec: &VmSpec) -> Self {
        let (images, mounts) = image_groups(spec);
        self.arg("--images", images).arg("--imagemounts", mounts)
    }

    pub fn create(spec: &VmSpec) -> Self {
        let mnttasks = spec
            .customizations
            .iter()
            .map(|c| [c.source(), c.destination()].join(FIELD_SEPARATOR))
            .collect::<Vec<_>>()
            .join(GROUP_SEPARATOR);

        let cmd = Self::start(LifecycleVerb::Create, spec)
            .arg("--memory", spec.deployment.memory_mb.to_string())
            .arg("--vcpus", spec.deployment.vcpus.to_string())
            .images(spec);
        let networking = (!spec.nics.is_empty()).then(|| spec.networking());
        cmd.arg_opt("--networking", networking.as_deref())
            .arg_opt("--kernel", spec.kernel.as_deref())
            .arg_opt("--kernelargs", spec.kernel_args.as_deref())
            .arg_opt("--mnttasks", (!mnttasks.is_empty()).then_some(mnttasks.as_str()))
            .arg_opt("--credential", spec.credential.as_deref())
    }

    pub fn propagate(spec: &VmSpec, target: PropagateTarget, notify: Option<&str>) -> Self {
        Self::start(LifecycleVerb::Propagate(target), spec)
            .images(spec)
            .switch("--start", target == PropagateTarget::Start)
            .switch("--startpaused", target == PropagateTarget::Pause)
            .arg_opt("--notify", notify)
    }

    pub fn unpropagate(spec: &VmSpec, notify: Option<&str>) -> Self {
        Self::start(LifecycleVerb::Unpropagate, spec)
            .switch("--deleteall", spec.deployment.shutdown == ShutdownMechanism::Trash)
            .arg_opt("--notify", notify)
    }

    pub fn pause(spec: &VmSpec) -> Self {
        Self::start(LifecycleVerb::Pause, spec)
    }

    pub fn unpause(spec: &VmSpec) -> Self {
        Self::start(LifecycleVerb::Unpause, spec)
    }

    pub fn reboot(spec: &VmSpec) -> Self {
        Self::start(LifecycleVerb::Reboot, spec)
    }

    pub fn remove(spec: &VmSpec) -> Self {
        Self::start(LifecycleVerb::Remove, spec)
            .switch("--deleteall", spec.deployment.shutdown == ShutdownMechanism::Trash)
    }

    /// Shell-ish rendering for logs.
    pub fn command_line(&self, program: &str) -> String {
        let mut line = program.to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push_str(&format!("'{}'", arg));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// `(images, image mount points)`, root disk first, then regular, then blank.
fn image_groups(spec: &VmSpec) -> (String, String) {
    let mut ordered: Vec<_> = spec.partitions.iter().collect();
    ordered.sort_by_key(|p| match p.kind() {
        PartitionKind::RootDisk => 0,
        PartitionKind::Regular => 1,
        PartitionKind::Blank { .. } => 2,
    });

    let mut images = Vec::with_capacity(ordered.len());
    let mut mounts = Vec::with_capacity(ordered.len());
    for partition in ordered {
        let access = if partition.read_write { "rw" } else { "ro" };
        let entry = match partition.kind() {
            PartitionKind::RootDisk => {
                [partition.image.as_str(), "rootdisk", access].join(FIELD_SEPARATOR)
            }
            PartitionKind::Regular => [partition.image.as_str(), access].join(FIELD_SEPARATOR),
            PartitionKind::Blank { size_mb } => {
                format!("blankcreate://{}{}rw", size_mb, FIELD_SEPARATOR)
            }
        };
        images.push(entry);
        mounts.push(partition.mount_as.clone());
    }
    (images.join(GROUP_SEPARATOR), mounts.join(GROUP_SEPARATOR))
}
