use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::{LimitSettings, Settings};
use crate::core::command::{BackendCommand, LifecycleVerb, PropagateTarget};
use crate::core::task::{AccessCheck, StateNotifier, TaskContext, TaskExecutor, TaskOutcome};
use crate::core::vm::{
    validate_partitions, Deployment, FileCopy, InstanceHandle, NicBinding, Partition,
    ShutdownMechanism, VmSpec,
};
use crate::errors::{ProvisionError, ProvisionResult};
use crate::idempotency::{IdempotencyGuard, ReservationKey};
use crate::network::{NetworkAllocator, Persistence};
use crate::with_context;

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomizationRequest {
    pub source: String,
    pub destination: String,
}

/// A request to create `count` identical instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub count: u16,
    pub client_token: Option<String>,
    pub memory_mb: u64,
    pub vcpus: u32,
    #[serde(default)]
    pub shutdown: ShutdownMechanism,
    pub partitions: Vec<Partition>,
    /// One NIC per entry, leased from the named network.
    #[serde(default)]
    pub networks: Vec<String>,
    pub kernel: Option<String>,
    pub kernel_args: Option<String>,
    #[serde(default)]
    pub customizations: Vec<CustomizationRequest>,
    pub credential: Option<String>,
    pub coschedule_id: Option<String>,
}

impl CreateRequest {
    /// One small instance booting `root_image`, no networking.
    pub fn new(name: impl Into<String>, root_image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 1,
            client_token: None,
            memory_mb: 256,
            vcpus: 1,
            shutdown: ShutdownMechanism::Normal,
            partitions: vec![Partition {
                image: root_image.into(),
                mount_as: "sda".to_string(),
                read_write: true,
                root_disk: true,
                blank_space_mb: None,
            }],
            networks: Vec::new(),
            kernel: None,
            kernel_args: None,
            customizations: Vec::new(),
            credential: None,
            coschedule_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Terminating,
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    owner: String,
    key: Option<ReservationKey>,
    spec: Arc<VmSpec>,
    phase: Phase,
}

/// Live instances and who owns them. Also answers the executor's access
/// check, so destroy and in-flight tasks agree on what still exists.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<u64, InstanceRecord>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> ProvisionResult<MutexGuard<'_, HashMap<u64, InstanceRecord>>> {
        self.instances
            .lock()
            .map_err(|_| ProvisionError::manage("instance registry poisoned"))
    }

    pub fn len(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, vm_id: u64) -> bool {
        self.instances
            .lock()
            .map(|i| i.contains_key(&vm_id))
            .unwrap_or(false)
    }

    fn register(&self, owner: &str, key: Option<&ReservationKey>, specs: &[Arc<VmSpec>]) -> ProvisionResult<()> {
        let mut instances = self.locked()?;
        for spec in specs {
            instances.insert(
                spec.id,
                InstanceRecord {
                    owner: owner.to_string(),
                    key: key.cloned(),
                    spec: spec.clone(),
                    phase: Phase::Active,
                },
            );
        }
        Ok(())
    }

    fn unregister(&self, ids: impl IntoIterator<Item = u64>) {
        match self.instances.lock() {
            Ok(mut instances) => {
                for id in ids {
                    instances.remove(&id);
                }
            }
            Err(_) => error!("Instance registry poisoned, cannot unregister"),
        }
    }

    /// Owned, still-registered instance, or an authorization error.
    fn owned(&self, caller: &str, vm_id: u64) -> ProvisionResult<InstanceRecord> {
        let instances = self.locked()?;
        match instances.get(&vm_id) {
            Some(record) if record.owner == caller => Ok(record.clone()),
            _ => Err(ProvisionError::Authorization {
                vm_id,
                message: "no such instance for this caller".to_string(),
            }),
        }
    }

    fn begin_termination(&self, caller: &str, vm_id: u64) -> ProvisionResult<InstanceRecord> {
        let mut instances = self.locked()?;
        match instances.get_mut(&vm_id) {
            Some(record) if record.owner == caller => {
                record.phase = Phase::Terminating;
                Ok(record.clone())
            }
            _ => Err(ProvisionError::Authorization {
                vm_id,
                message: "no such instance for this caller, already gone?".to_string(),
            }),
        }
    }

    fn covers(&self, key: &ReservationKey) -> bool {
        self.instances
            .lock()
            .map(|i| i.values().any(|r| r.key.as_ref() == Some(key)))
            .unwrap_or(true)
    }
}

impl AccessCheck for InstanceRegistry {
    fn is_authorized(&self, context: &TaskContext, verb: LifecycleVerb) -> bool {
        let Ok(instances) = self.instances.lock() else {
            return false;
        };
        match instances.get(&context.vm_id) {
            Some(record) => record.phase == Phase::Active || verb == LifecycleVerb::Remove,
            None => false,
        }
    }
}

/// Leases taken for one request, kept so a failure can hand them back.
#[derive(Debug, Default)]
struct Leases {
    held: Vec<(String, IpAddr, u64)>,
}

/// Request validated into backend terms; everything but networking.
struct Prepared {
    partitions: Vec<Partition>,
    deployment: Deployment,
    customizations: Vec<FileCopy>,
}

pub struct CreationManager {
    limits: LimitSettings,
    allocator: Arc<NetworkAllocator>,
    guard: Arc<IdempotencyGuard>,
    tasks: Arc<TaskExecutor>,
    registry: Arc<InstanceRegistry>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CreationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationManager")
            .field("instances", &self.registry.len())
            .field("tasks", &self.tasks)
            .field("guard", &self.guard)
            .finish()
    }
}

impl CreationManager {
    /// Wire up every collaborator from settings.
    pub fn new(
        settings: &Settings,
        persistence: Arc<dyn Persistence>,
        notifier: Arc<dyn StateNotifier>,
    ) -> ProvisionResult<Self> {
        let allocator = Arc::new(NetworkAllocator::new(&settings.network, persistence.clone())?);
        let guard = Arc::new(IdempotencyGuard::new(persistence)?);
        let registry = Arc::new(InstanceRegistry::new());
        let tasks = Arc::new(TaskExecutor::new(&settings.backend, registry.clone(), notifier));
        Self::from_parts(settings.limits.clone(), allocator, guard, tasks, registry)
    }

    /// Instances covered by restored reservations are registered again under
    /// their creator, and fresh ids start above them.
    pub fn from_parts(
        limits: LimitSettings,
        allocator: Arc<NetworkAllocator>,
        guard: Arc<IdempotencyGuard>,
        tasks: Arc<TaskExecutor>,
        registry: Arc<InstanceRegistry>,
    ) -> ProvisionResult<Self> {
        for (key, reservation) in guard.reservations()? {
            let specs: Vec<Arc<VmSpec>> = reservation
                .resources
                .iter()
                .map(|handle| Arc::new(restored_spec(handle)))
                .collect();
            registry.register(&key.creator_id, Some(&key), &specs)?;
        }
        let next_id = guard.highest_resource_id().map_or(1, |id| id + 1);

        Ok(Self {
            limits,
            allocator,
            guard,
            tasks,
            registry,
            next_id: AtomicU64::new(next_id),
        })
    }

    pub fn allocator(&self) -> &Arc<NetworkAllocator> {
        &self.allocator
    }

    pub fn guard(&self) -> &Arc<IdempotencyGuard> {
        &self.guard
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<TaskExecutor> {
        &self.tasks
    }

    /// Admit `request` exactly once per client token and dispatch the
    /// realization tasks. Returns without waiting for the backend.
    pub async fn create(
        &self,
        caller: &str,
        request: CreateRequest,
    ) -> ProvisionResult<Vec<InstanceHandle>> {
        let result = match request.client_token.clone() {
            None => self.create_untracked(caller, &request),
            Some(token) if token.is_empty() => Err(ProvisionError::Metadata {
                message: "client token must not be empty".to_string(),
            }),
            Some(token) => {
                let key = ReservationKey::new(caller, token);
                self.guard
                    .with_reservation(key, |mut scope| async move {
                        if let Some(existing) = scope.current() {
                            info!(
                                caller,
                                token = %scope.key().client_token,
                                "Retried request, returning reserved resources"
                            );
                            return Ok(existing.resources.clone());
                        }

                        let specs = self.allocate(caller, Some(scope.key()), &request)?;
                        let handles: Vec<InstanceHandle> = specs.iter().map(|s| s.handle()).collect();
                        if let Err(e) = scope.record(handles.clone()) {
                            self.abandon(&specs);
                            return Err(e);
                        }
                        self.submit(&specs);
                        Ok(handles)
                    })
                    .await
            }
        };
        with_context!(result, "create instances", Some(caller))
    }

    fn create_untracked(
        &self,
        caller: &str,
        request: &CreateRequest,
    ) -> ProvisionResult<Vec<InstanceHandle>> {
        let specs = self.allocate(caller, None, request)?;
        self.submit(&specs);
        Ok(specs.iter().map(|s| s.handle()).collect())
    }

    fn prepare(&self, request: &CreateRequest) -> ProvisionResult<Prepared> {
        validate_name(&request.name)?;

        if let Some(group) = &request.coschedule_id {
            if group.trim().is_empty() {
                return Err(ProvisionError::CoScheduling {
                    message: "co-scheduling group id must not be empty".to_string(),
                });
            }
        }

        if request.count == 0 || request.count > self.limits.max_instances {
            return Err(ProvisionError::Creation {
                message: format!(
                    "instance count {} outside 1..={}",
                    request.count, self.limits.max_instances
                ),
            });
        }
        if request.memory_mb == 0 || request.memory_mb > self.limits.max_memory_mb {
            return Err(ProvisionError::Scheduling {
                message: format!(
                    "memory {} MB outside 1..={} MB",
                    request.memory_mb, self.limits.max_memory_mb
                ),
            });
        }
        if request.vcpus == 0 || request.vcpus > self.limits.max_vcpus {
            return Err(ProvisionError::Scheduling {
                message: format!("{} vCPUs outside 1..={}", request.vcpus, self.limits.max_vcpus),
            });
        }

        validate_partitions(&request.partitions)?;

        let customizations = request
            .customizations
            .iter()
            .map(|c| FileCopy::new(&c.source, &c.destination, self.limits.max_path_len))
            .collect::<ProvisionResult<Vec<_>>>()?;

        Ok(Prepared {
            partitions: request.partitions.clone(),
            deployment: Deployment {
                memory_mb: request.memory_mb,
                vcpus: request.vcpus,
                shutdown: request.shutdown,
            },
            customizations,
        })
    }

    fn check_networks(&self, request: &CreateRequest) -> ProvisionResult<()> {
        let known = self.allocator.get_association_names()?;
        let mut seen = Vec::with_capacity(request.networks.len());
        for name in &request.networks {
            if !known.contains(name) {
                return Err(ProvisionError::denied(format!("unknown network '{}'", name)));
            }
            if seen.contains(&name) {
                return Err(ProvisionError::denied(format!("network '{}' requested twice", name)));
            }
            seen.push(name);

            let needed = request.count as usize;
            let available = self.allocator.available(name)?;
            if available < needed {
                return Err(ProvisionError::denied(format!(
                    "network '{}': needed {}, available {}",
                    name, needed, available
                )));
            }
        }
        Ok(())
    }

    /// Validate, lease NICs and register the instances. Leaves nothing
    /// behind on failure.
    fn allocate(
        &self,
        caller: &str,
        key: Option<&ReservationKey>,
        request: &CreateRequest,
    ) -> ProvisionResult<Vec<Arc<VmSpec>>> {
        let prepared = self.prepare(request)?;
        self.check_networks(request)?;

        let mut leases = Leases::default();
        let mut specs = Vec::with_capacity(request.count as usize);
        for index in 0..request.count {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let nics = match self.lease_nics(id, &request.networks, &mut leases) {
                Ok(nics) => nics,
                Err(e) => {
                    self.retire_all(&leases);
                    return Err(e);
                }
            };
            let name = if request.count == 1 {
                request.name.clone()
            } else {
                format!("{}-{}", request.name, index)
            };
            specs.push(Arc::new(VmSpec {
                id,
                name,
                partitions: prepared.partitions.clone(),
                deployment: prepared.deployment.clone(),
                nics,
                kernel: request.kernel.clone(),
                kernel_args: request.kernel_args.clone(),
                customizations: prepared.customizations.clone(),
                credential: request.credential.clone(),
            }));
        }

        if let Err(e) = self.registry.register(caller, key, &specs) {
            self.retire_all(&leases);
            return Err(e);
        }
        info!(caller, instances = specs.len(), "Allocated instances");
        Ok(specs)
    }

    fn lease_nics(
        &self,
        vm_id: u64,
        networks: &[String],
        leases: &mut Leases,
    ) -> ProvisionResult<Vec<NicBinding>> {
        let mut nics = Vec::with_capacity(networks.len());
        for (index, network) in networks.iter().enumerate() {
            let (entry, dns) = self.allocator.get_next_entry(network, vm_id)?;
            leases.held.push((network.clone(), entry.ip, vm_id));
            let mac = entry.mac.ok_or_else(|| {
                ProvisionError::manage(format!(
                    "entry {} in network '{}' has no MAC address",
                    entry.ip, network
                ))
            })?;
            nics.push(NicBinding {
                name: format!("nic{}", index),
                network: network.clone(),
                ip: entry.ip,
                mac,
                hostname: entry.hostname,
                gateway: entry.gateway,
                broadcast: entry.broadcast,
                netmask: entry.netmask,
                dns,
            });
        }
        Ok(nics)
    }

    fn retire_all(&self, leases: &Leases) {
        for (network, ip, vm_id) in &leases.held {
            if let Err(e) = self.allocator.retire_entry(network, ip, *vm_id) {
                error!(network = %network, ip = %ip, vm_id, error = %e, "Could not return lease after failure");
            }
        }
    }

    /// Undo `allocate` for instances that will never be dispatched.
    fn abandon(&self, specs: &[Arc<VmSpec>]) {
        self.registry.unregister(specs.iter().map(|s| s.id));
        for spec in specs {
            for nic in &spec.nics {
                if let Err(e) = self.allocator.retire_entry(&nic.network, &nic.ip, spec.id) {
                    error!(network = %nic.network, ip = %nic.ip, vm_id = spec.id, error = %e, "Could not return lease after failure");
                }
            }
        }
    }

    fn submit(&self, specs: &[Arc<VmSpec>]) {
        for spec in specs {
            let task = self.tasks.task(BackendCommand::create(spec));
            // completion is reported through the notifier
            drop(self.tasks.dispatch(task));
        }
    }

    /// Run a lifecycle verb other than create/remove against an owned
    /// instance and wait for the dispatch to finish. Async verbs come back
    /// as `Pending` when a real backend is in use.
    pub async fn control(
        &self,
        caller: &str,
        vm_id: u64,
        verb: LifecycleVerb,
    ) -> ProvisionResult<TaskOutcome> {
        let record = self.registry.owned(caller, vm_id)?;
        let spec = &record.spec;
        let notify = self.tasks.notify_endpoint();
        let command = match verb {
            LifecycleVerb::Propagate(target) => BackendCommand::propagate(spec, target, notify),
            LifecycleVerb::Unpropagate => BackendCommand::unpropagate(spec, notify),
            LifecycleVerb::Pause => BackendCommand::pause(spec),
            LifecycleVerb::Unpause => BackendCommand::unpause(spec),
            LifecycleVerb::Reboot => BackendCommand::reboot(spec),
            LifecycleVerb::Create | LifecycleVerb::Remove => {
                return Err(ProvisionError::Creation {
                    message: format!("{} is not a control operation", verb),
                })
            }
        };

        self.tasks
            .dispatch(self.tasks.task(command))
            .await
            .map_err(|e| ProvisionError::manage(format!("task panicked: {}", e)))
    }

    /// Convenience for the common "propagate and boot" path.
    pub async fn start(&self, caller: &str, vm_id: u64) -> ProvisionResult<TaskOutcome> {
        self.control(caller, vm_id, LifecycleVerb::Propagate(PropagateTarget::Start))
            .await
    }

    /// Tear down an owned instance, return its leases and drop the
    /// idempotent reservation once nothing it covers remains.
    pub async fn destroy(&self, caller: &str, vm_id: u64) -> ProvisionResult<()> {
        let record = self.registry.begin_termination(caller, vm_id)?;
        let task = self.tasks.task(BackendCommand::remove(&record.spec));

        let outcome = self
            .tasks
            .dispatch(task)
            .await
            .map_err(|e| ProvisionError::manage(format!("task panicked: {}", e)))?;
        if let TaskOutcome::Failed(e) = outcome {
            warn!(vm_id, error = %e, "Remove failed, instance left terminating");
            return Err(e);
        }

        self.registry.unregister([vm_id]);
        let mut first_error = None;
        for nic in &record.spec.nics {
            if let Err(e) = self.allocator.retire_entry(&nic.network, &nic.ip, vm_id) {
                error!(network = %nic.network, ip = %nic.ip, vm_id, error = %e, "Could not retire lease");
                first_error.get_or_insert(e);
            }
        }

        if let Some(key) = record.key {
            if !self.registry.covers(&key) {
                self.guard.release(key).await?;
            }
        }

        info!(caller, vm_id, "Destroyed instance");
        first_error.map_or(Ok(()), Err)
    }
}

/// Enough of a spec to drive lifecycle verbs for an instance known only
/// through its reservation. Disk layout and sizing are not stored there.
fn restored_spec(handle: &InstanceHandle) -> VmSpec {
    VmSpec {
        id: handle.id,
        name: handle.name.clone(),
        partitions: Vec::new(),
        deployment: Deployment {
            memory_mb: 0,
            vcpus: 0,
            shutdown: ShutdownMechanism::Normal,
        },
        nics: handle.nics.clone(),
        kernel: None,
        kernel_args: None,
        customizations: Vec::new(),
        credential: None,
    }
}

fn validate_name(name: &str) -> ProvisionResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ProvisionError::Metadata {
            message: format!("instance name must be 1..={} characters", MAX_NAME_LEN),
        });
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ProvisionError::Metadata {
            message: format!("instance name '{}' contains illegal character {:?}", name, c),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_restricted() {
        assert!(validate_name("web-01.prod_a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn registry_grants_remove_while_terminating() {
        let registry = InstanceRegistry::new();
        let spec = Arc::new(VmSpec {
            id: 1,
            name: "a".into(),
            partitions: Vec::new(),
            deployment: Deployment {
                memory_mb: 1,
                vcpus: 1,
                shutdown: ShutdownMechanism::Normal,
            },
            nics: Vec::new(),
            kernel: None,
            kernel_args: None,
            customizations: Vec::new(),
            credential: None,
        });
        registry.register("alice", None, &[spec.clone()]).unwrap();
        let context = TaskContext::for_command(&BackendCommand::reboot(&spec), false);

        assert!(registry.is_authorized(&context, LifecycleVerb::Reboot));
        assert!(registry.begin_termination("mallory", 1).is_err());
        registry.begin_termination("alice", 1).unwrap();
        assert!(!registry.is_authorized(&context, LifecycleVerb::Reboot));
        assert!(registry.is_authorized(&context, LifecycleVerb::Remove));

        registry.unregister([1]);
        assert!(!registry.is_authorized(&context, LifecycleVerb::Remove));
    }
}
