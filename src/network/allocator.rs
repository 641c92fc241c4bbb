use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::config::NetworkSettings;
use crate::errors::{ProvisionError, ProvisionResult};
use crate::network::association::{Association, AssociationEntry};
use crate::network::mac::MacAllocator;
use crate::network::persistence::Persistence;

/// Association name -> association.
pub type AddressPool = HashMap<String, Association>;

/// Owns every configured network and leases their entries.
///
/// One mutex guards the whole pool; leasing and retiring hold it across the
/// full read-modify-persist sequence.
pub struct NetworkAllocator {
    pool: Mutex<AddressPool>,
    persistence: Arc<dyn Persistence>,
    macs: MacAllocator,
    config_dir: PathBuf,
}

impl std::fmt::Debug for NetworkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkAllocator")
            .field("config_dir", &self.config_dir)
            .field("mac_prefix", &self.macs.prefix())
            .finish()
    }
}

impl NetworkAllocator {
    /// Seed from persisted state, then reload the config directory so that
    /// leases recorded before a restart survive.
    pub fn new(
        settings: &NetworkSettings,
        persistence: Arc<dyn Persistence>,
    ) -> ProvisionResult<Self> {
        let macs = MacAllocator::new(&settings.mac_prefix)?;
        let previous = persistence.current_associations().map_err(|e| {
            error!(error = %e, "Could not load stored networks");
            ProvisionError::db_problem()
        })?;

        info!(
            config_dir = %settings.config_dir.display(),
            stored = previous.len(),
            "Initializing network allocator"
        );

        let allocator = Self {
            pool: Mutex::new(previous),
            persistence,
            macs,
            config_dir: settings.config_dir.clone(),
        };
        allocator.validate()?;
        Ok(allocator)
    }

    fn pool(&self) -> ProvisionResult<MutexGuard<'_, AddressPool>> {
        self.pool
            .lock()
            .map_err(|_| ProvisionError::manage("network pool lock poisoned"))
    }

    pub fn mac_allocator(&self) -> &MacAllocator {
        &self.macs
    }

    /// All configured network names, sorted.
    pub fn get_association_names(&self) -> ProvisionResult<Vec<String>> {
        let pool = self.pool()?;
        let mut names: Vec<String> = pool.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn association(&self, name: &str) -> ProvisionResult<Option<Association>> {
        Ok(self.pool()?.get(name).cloned())
    }

    /// Number of entries not currently leased.
    pub fn available(&self, name: &str) -> ProvisionResult<usize> {
        let pool = self.pool()?;
        pool.get(name)
            .map(Association::free_count)
            .ok_or_else(|| unknown_network(name))
    }

    /// Lease the first free entry of `name` in file order. Returns the entry
    /// and the network's DNS setting.
    pub fn get_next_entry(
        &self,
        name: &str,
        vm_id: u64,
    ) -> ProvisionResult<(AssociationEntry, Option<String>)> {
        let mut pool = self.pool()?;
        let association = pool.get_mut(name).ok_or_else(|| unknown_network(name))?;
        let total = association.entries.len();

        let entry = association
            .entries
            .iter_mut()
            .find(|e| !e.in_use)
            .ok_or_else(|| {
                ProvisionError::denied(format!(
                    "network '{}' has no free addresses (needed 1, available 0 of {})",
                    name, total
                ))
            })?;

        entry.in_use = true;
        if let Err(e) = self.persistence.replace_association_entry(name, entry) {
            entry.in_use = false;
            error!(network = name, ip = %entry.ip, error = %e, "Could not persist lease");
            return Err(ProvisionError::db_problem());
        }

        info!(network = name, ip = %entry.ip, vm_id, "Leased network address");
        Ok((entry.clone(), association.dns.clone()))
    }

    /// Return a leased entry to its pool.
    pub fn retire_entry(&self, name: &str, ip: &IpAddr, tracking_id: u64) -> ProvisionResult<()> {
        let mut pool = self.pool()?;
        let association = pool.get_mut(name).ok_or_else(|| {
            ProvisionError::manage(format!(
                "cannot retire {} for {}: network '{}' not found",
                ip, tracking_id, name
            ))
        })?;
        let entry = association.entry_mut(ip).ok_or_else(|| {
            ProvisionError::manage(format!(
                "cannot retire {} for {}: no such entry in network '{}'",
                ip, tracking_id, name
            ))
        })?;

        if !entry.in_use {
            warn!(network = name, ip = %ip, vm_id = tracking_id, "Retiring an entry that was not leased");
        }

        entry.in_use = false;
        if let Err(e) = self.persistence.replace_association_entry(name, entry) {
            entry.in_use = true;
            error!(network = name, ip = %ip, error = %e, "Could not persist retirement");
            return Err(ProvisionError::manage(format!(
                "could not persist retirement of {} in network '{}'",
                ip, name
            )));
        }

        info!(network = name, ip = %ip, vm_id = tracking_id, "Retired network address");
        Ok(())
    }

    /// Reload the config directory, reconciling with current state, assign
    /// missing MACs and persist the result.
    pub fn validate(&self) -> ProvisionResult<()> {
        let mut pool = self.pool()?;
        let mut reloaded = AddressPool::new();

        for (name, path) in network_files(&self.config_dir)? {
            let modified = file_time(&path);

            if let Some(previous) = pool.get(&name) {
                if previous.file_time.is_some() && previous.file_time == modified {
                    debug!(network = %name, "Network file unchanged, skipping");
                    reloaded.insert(name, previous.clone());
                    continue;
                }
            }

            let contents = fs::read_to_string(&path).map_err(|e| {
                ProvisionError::manage(format!("cannot read {}: {}", path.display(), e))
            })?;
            let mut association = Association::parse(&name, &contents, modified)?;

            match pool.get(&name) {
                Some(previous) => reconcile(previous, &mut association),
                None => info!(
                    network = %name,
                    entries = association.entries.len(),
                    "Loaded new network"
                ),
            }
            reloaded.insert(name, association);
        }

        for (name, association) in pool.iter() {
            if reloaded.contains_key(name) {
                continue;
            }
            let leased = association.entries.iter().filter(|e| e.in_use).count();
            if leased > 0 {
                // TODO: keep tracking these leases until their VMs are destroyed
                warn!(
                    network = %name,
                    leased,
                    "Network removed from configuration while addresses are still leased"
                );
            } else {
                info!(network = %name, "Network removed from configuration");
            }
        }

        self.assign_macs(&mut reloaded)?;

        self.persistence.replace_associations(&reloaded).map_err(|e| {
            error!(error = %e, "Could not persist reloaded networks");
            ProvisionError::db_problem()
        })?;

        *pool = reloaded;
        Ok(())
    }

    fn assign_macs(&self, pool: &mut AddressPool) -> ProvisionResult<()> {
        let mut taken: HashSet<String> = pool
            .values()
            .flat_map(|a| a.entries.iter())
            .filter_map(|e| e.mac.as_ref().map(|m| m.to_ascii_uppercase()))
            .collect();

        let mut names: Vec<String> = pool.keys().cloned().collect();
        names.sort();

        for name in names {
            let Some(association) = pool.get_mut(&name) else {
                continue;
            };
            for entry in association.entries.iter_mut() {
                if entry.explicit_mac {
                    continue;
                }
                let stale = match &entry.mac {
                    Some(mac) => !self.macs.matches_prefix(mac),
                    None => true,
                };
                if !stale {
                    continue;
                }
                if let Some(old) = entry.mac.take() {
                    taken.remove(&old.to_ascii_uppercase());
                }
                let mac = self.macs.next_mac(&taken)?;
                debug!(network = %name, ip = %entry.ip, mac = %mac, "Assigned MAC address");
                taken.insert(mac.clone());
                entry.mac = Some(mac);
            }
        }
        Ok(())
    }
}

fn unknown_network(name: &str) -> ProvisionError {
    ProvisionError::denied(format!("unknown network '{}'", name))
}

/// `(network name, path)` for every pool file, sorted by name.
fn network_files(dir: &Path) -> ProvisionResult<Vec<(String, PathBuf)>> {
    let listing = fs::read_dir(dir).map_err(|e| {
        ProvisionError::manage(format!("cannot read network directory {}: {}", dir.display(), e))
    })?;

    let mut files = Vec::new();
    for item in listing {
        let item = item.map_err(|e| {
            ProvisionError::manage(format!("cannot list {}: {}", dir.display(), e))
        })?;
        let path = item.path();
        if !path.is_file() {
            continue;
        }
        let name = item.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with('~') {
            continue;
        }
        files.push((name, path));
    }
    files.sort();
    Ok(files)
}

/// Carry runtime state from the previous load into a freshly parsed one.
fn reconcile(previous: &Association, current: &mut Association) {
    if previous.dns != current.dns {
        info!(
            network = %current.name,
            old = ?previous.dns,
            new = ?current.dns,
            "Network DNS setting changed"
        );
    }

    for entry in current.entries.iter_mut() {
        let Some(old) = previous.entry(&entry.ip) else {
            info!(network = %current.name, ip = %entry.ip, "New network entry");
            continue;
        };

        entry.in_use = old.in_use;
        if !entry.explicit_mac && !old.explicit_mac {
            entry.mac = old.mac.clone();
        }

        let changes = old.differences(entry);
        if !changes.is_empty() {
            info!(
                network = %current.name,
                ip = %entry.ip,
                in_use = entry.in_use,
                changes = %changes.join(", "),
                "Network entry changed"
            );
        }
    }

    for old in previous.entries.iter() {
        if current.entry(&old.ip).is_some() {
            continue;
        }
        if old.in_use {
            warn!(network = %current.name, ip = %old.ip, "Leased entry dropped from configuration");
        } else {
            info!(network = %current.name, ip = %old.ip, "Entry dropped from configuration");
        }
    }
}

fn file_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PersistenceError;
    use crate::idempotency::{Reservation, ReservationKey};
    use crate::network::persistence::MemoryPersistence;
    use std::fs::File;
    use std::time::Duration;

    fn settings(dir: &Path) -> NetworkSettings {
        NetworkSettings {
            config_dir: dir.to_path_buf(),
            mac_prefix: "A2:AA:BB".to_string(),
        }
    }

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn allocator(dir: &Path) -> NetworkAllocator {
        NetworkAllocator::new(&settings(dir), Arc::new(MemoryPersistence::new())).unwrap()
    }

    #[test]
    fn lease_retire_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "public", "8.8.8.8\npub01 10.0.0.2 10.0.0.1 none 255.255.255.0\n");
        let allocator = allocator(dir.path());

        let (entry, dns) = allocator.get_next_entry("public", 1).unwrap();
        assert_eq!(entry.ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert!(entry.in_use);
        assert!(entry.mac.as_deref().unwrap().starts_with("A2:AA:BB"));
        assert_eq!(dns.as_deref(), Some("8.8.8.8"));

        let err = allocator.get_next_entry("public", 2).unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceRequestDenied { .. }));

        allocator.retire_entry("public", &entry.ip, 1).unwrap();
        let (again, _) = allocator.get_next_entry("public", 3).unwrap();
        assert_eq!(again.ip, entry.ip);
        assert_eq!(again.mac, entry.mac);
    }

    #[test]
    fn leases_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "private",
            "none\na 192.168.0.10 none none none\nb 192.168.0.5 none none none\n",
        );
        let allocator = allocator(dir.path());

        assert_eq!(allocator.available("private").unwrap(), 2);
        let (first, dns) = allocator.get_next_entry("private", 1).unwrap();
        let (second, _) = allocator.get_next_entry("private", 2).unwrap();
        assert!(dns.is_none());
        assert_eq!(first.hostname, "a");
        assert_eq!(second.hostname, "b");
        assert_eq!(allocator.available("private").unwrap(), 0);
    }

    #[test]
    fn unknown_network_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = allocator(dir.path());
        assert!(allocator.get_association_names().unwrap().is_empty());

        let err = allocator.get_next_entry("nope", 1).unwrap_err();
        assert!(err.to_string().contains("unknown network 'nope'"));
    }

    #[test]
    fn retire_unknown_entry_is_manage_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "public", "none\npub01 10.0.0.2 none none none\n");
        let allocator = allocator(dir.path());

        let ip: IpAddr = "10.9.9.9".parse().unwrap();
        assert!(matches!(
            allocator.retire_entry("public", &ip, 1),
            Err(ProvisionError::Manage { .. })
        ));
        assert!(matches!(
            allocator.retire_entry("missing", &ip, 1),
            Err(ProvisionError::Manage { .. })
        ));
    }

    #[test]
    fn explicit_macs_are_kept_and_avoided() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "public",
            "none\na 10.0.0.2 none none none A2:AA:BB:00:00:00\nb 10.0.0.3 none none none\n",
        );
        let allocator = allocator(dir.path());
        let association = allocator.association("public").unwrap().unwrap();

        assert_eq!(association.entries[0].mac.as_deref(), Some("A2:AA:BB:00:00:00"));
        assert!(association.entries[0].explicit_mac);
        let generated = association.entries[1].mac.clone().unwrap();
        assert_ne!(generated, "A2:AA:BB:00:00:00");
    }

    #[test]
    fn unchanged_file_is_not_reparsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "public", "none\npub01 10.0.0.2 none none none\n");
        let allocator = allocator(dir.path());
        let stamp = file_time(&path).unwrap();

        write(dir.path(), "public", "none\nrenamed 10.0.0.2 none none none\n");
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(stamp)
            .unwrap();
        allocator.validate().unwrap();
        let association = allocator.association("public").unwrap().unwrap();
        assert_eq!(association.entries[0].hostname, "pub01");

        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(stamp + Duration::from_secs(5))
            .unwrap();
        allocator.validate().unwrap();
        let association = allocator.association("public").unwrap().unwrap();
        assert_eq!(association.entries[0].hostname, "renamed");
    }

    #[test]
    fn removed_file_drops_association() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "public", "none\npub01 10.0.0.2 none none none\n");
        write(dir.path(), "private", "none\npriv01 192.168.0.2 none none none\n");
        let allocator = allocator(dir.path());
        allocator.get_next_entry("public", 7).unwrap();

        fs::remove_file(path).unwrap();
        allocator.validate().unwrap();
        assert_eq!(allocator.get_association_names().unwrap(), vec!["private"]);
    }

    #[test]
    fn restart_keeps_leases_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "public", "none\npub01 10.0.0.2 none none none\n");
        let persistence = Arc::new(MemoryPersistence::new());

        let first = NetworkAllocator::new(&settings(dir.path()), persistence.clone()).unwrap();
        let (leased, _) = first.get_next_entry("public", 1).unwrap();
        drop(first);

        let second = NetworkAllocator::new(&settings(dir.path()), persistence).unwrap();
        let association = second.association("public").unwrap().unwrap();
        assert!(association.entries[0].in_use);
        assert_eq!(association.entries[0].mac, leased.mac);
    }

    struct BrokenStore;

    impl Persistence for BrokenStore {
        fn current_associations(&self) -> Result<AddressPool, PersistenceError> {
            Ok(AddressPool::new())
        }
        fn replace_association_entry(
            &self,
            _name: &str,
            _entry: &AssociationEntry,
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::Database("disk on fire".to_string()))
        }
        fn replace_associations(&self, _associations: &AddressPool) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn current_reservations(
            &self,
        ) -> Result<std::collections::HashMap<ReservationKey, Reservation>, PersistenceError> {
            Ok(Default::default())
        }
        fn add_reservation(
            &self,
            _key: &ReservationKey,
            _reservation: &Reservation,
        ) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn remove_reservation(&self, _key: &ReservationKey) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[test]
    fn storage_failure_is_reported_as_db_problem_and_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "public", "none\npub01 10.0.0.2 none none none\n");
        let allocator = NetworkAllocator::new(&settings(dir.path()), Arc::new(BrokenStore)).unwrap();

        let err = allocator.get_next_entry("public", 1).unwrap_err();
        assert_eq!(err, ProvisionError::db_problem());
        assert!(!err.to_string().contains("disk on fire"));
        assert_eq!(allocator.available("public").unwrap(), 1);
    }
}
