use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

use crate::errors::{ProvisionError, ProvisionResult};

// Characters that may never appear in a customization path. `;` is the
// backend's field separator.
const ILLEGAL_PATH_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '<', '>', '\\', '"', '\'', '*', '?', '!', '(', ')', '{', '}',
    ' ', '\t', '\n', '\r', '\0',
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Image location; empty for blank partitions.
    pub image: String,
    pub mount_as: String,
    pub read_write: bool,
    pub root_disk: bool,
    /// Size of a freshly allocated blank partition.
    pub blank_space_mb: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    RootDisk,
    Blank { size_mb: u64 },
    Regular,
}

impl Partition {
    pub fn kind(&self) -> PartitionKind {
        match (self.root_disk, self.blank_space_mb) {
            (true, _) => PartitionKind::RootDisk,
            (false, Some(size_mb)) => PartitionKind::Blank { size_mb },
            (false, None) => PartitionKind::Regular,
        }
    }
}

/// Exactly one root disk, which must be a real image; every partition has
/// a distinct mount point.
pub fn validate_partitions(partitions: &[Partition]) -> ProvisionResult<()> {
    let roots = partitions.iter().filter(|p| p.root_disk).count();
    if roots != 1 {
        return Err(ProvisionError::Creation {
            message: format!("exactly one root disk partition is required, found {}", roots),
        });
    }

    let mut mounts = HashSet::new();
    for partition in partitions {
        if partition.mount_as.is_empty() {
            return Err(ProvisionError::Creation {
                message: "partition without a mount point".to_string(),
            });
        }
        if partition.mount_as.contains(|c: char| c == ';' || c.is_whitespace()) {
            return Err(ProvisionError::validation(
                "mount point",
                format!("'{}' contains a separator or whitespace", partition.mount_as),
            ));
        }
        if !mounts.insert(partition.mount_as.as_str()) {
            return Err(ProvisionError::Creation {
                message: format!("mount point '{}' used twice", partition.mount_as),
            });
        }
        match partition.kind() {
            PartitionKind::Blank { size_mb: 0 } => {
                return Err(ProvisionError::Creation {
                    message: format!("blank partition '{}' has zero size", partition.mount_as),
                })
            }
            PartitionKind::Blank { .. } => {}
            PartitionKind::RootDisk | PartitionKind::Regular => {
                if partition.image.is_empty() {
                    return Err(ProvisionError::Creation {
                        message: format!("partition '{}' has no image", partition.mount_as),
                    });
                }
                if partition.image.contains(';') {
                    return Err(ProvisionError::validation(
                        "image",
                        format!("'{}' contains ';'", partition.image),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMechanism {
    #[default]
    Normal,
    /// Destroy without saving anything back.
    Trash,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub memory_mb: u64,
    pub vcpus: u32,
    pub shutdown: ShutdownMechanism,
}

/// One leased NIC as handed to the backend.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NicBinding {
    pub name: String,
    pub network: String,
    pub ip: IpAddr,
    pub mac: String,
    pub hostname: String,
    pub gateway: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub netmask: Option<IpAddr>,
    pub dns: Option<String>,
}

fn or_null<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "null".to_string())
}

impl NicBinding {
    /// `name;network;mac;ip;gateway;broadcast;netmask;dns;hostname`
    pub fn to_backend_string(&self) -> String {
        [
            self.name.clone(),
            self.network.clone(),
            self.mac.clone(),
            self.ip.to_string(),
            or_null(&self.gateway),
            or_null(&self.broadcast),
            or_null(&self.netmask),
            or_null(&self.dns),
            self.hostname.clone(),
        ]
        .join(";")
    }
}

/// A file to place inside the guest before boot. Only constructible through
/// [`FileCopy::new`], which rejects traversal and shell metacharacters.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct FileCopy {
    source: String,
    destination: String,
}

impl FileCopy {
    pub fn new(source: &str, destination: &str, max_len: usize) -> ProvisionResult<Self> {
        check_path("customization source", source, max_len)?;
        check_path("customization destination", destination, max_len)?;
        if source.starts_with('/') {
            return Err(ProvisionError::validation(
                "customization source",
                format!("'{}' must be relative to the staging area", source),
            ));
        }
        if !destination.starts_with('/') {
            return Err(ProvisionError::validation(
                "customization destination",
                format!("'{}' must be an absolute path", destination),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            destination: destination.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

fn check_path(field: &str, path: &str, max_len: usize) -> ProvisionResult<()> {
    if path.is_empty() {
        return Err(ProvisionError::validation(field, "path is empty"));
    }
    if path.len() > max_len {
        return Err(ProvisionError::validation(
            field,
            format!("path is {} characters, limit is {}", path.len(), max_len),
        ));
    }
    if let Some(c) = path.chars().find(|c| ILLEGAL_PATH_CHARS.contains(c)) {
        return Err(ProvisionError::validation(
            field,
            format!("'{}' contains illegal character {:?}", path, c),
        ));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(ProvisionError::validation(
            field,
            format!("'{}' contains a parent-directory reference", path),
        ));
    }
    Ok(())
}

/// Everything the backend needs to realize one instance. Shared behind an
/// `Arc` once built; nothing mutates it afterwards.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct VmSpec {
    pub id: u64,
    pub name: String,
    pub partitions: Vec<Partition>,
    pub deployment: Deployment,
    pub nics: Vec<NicBinding>,
    pub kernel: Option<String>,
    pub kernel_args: Option<String>,
    pub customizations: Vec<FileCopy>,
    pub credential: Option<String>,
}

impl VmSpec {
    /// All NICs, `;;`-separated.
    pub fn networking(&self) -> String {
        self.nics
            .iter()
            .map(NicBinding::to_backend_string)
            .collect::<Vec<_>>()
            .join(";;")
    }

    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id,
            name: self.name.clone(),
            nics: self.nics.clone(),
        }
    }
}

/// What a caller gets back for each created instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: u64,
    pub name: String,
    pub nics: Vec<NicBinding>,
}
