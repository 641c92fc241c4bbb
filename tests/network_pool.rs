// Address pool suite: leasing, reloads and MAC assignment against real files.

mod common;

use anyhow::Result;
use futures::future::join_all;
use std::collections::HashSet;
use std::fs::File;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{capture_logs, network_settings, pool_file, write_network};
use vm_provision_core::network::{is_valid_mac, MemoryPersistence, NetworkAllocator};
use vm_provision_core::ProvisionError;

fn bump_mtime(path: &std::path::Path) {
    let later = SystemTime::now() + Duration::from_secs(5);
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(later)
        .unwrap();
}

// Reload keeps leases and reports the attribute that moved
#[tokio::test]
async fn test_reload_preserves_leases_and_logs_changes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_network(
        dir.path(),
        "public",
        "8.8.8.8\nweb01 10.0.0.10 10.0.0.1 10.0.0.255 255.255.255.0\nweb02 10.0.0.11 10.0.0.1 10.0.0.255 255.255.255.0\n",
    );
    let allocator = NetworkAllocator::new(&network_settings(dir.path()), Arc::new(MemoryPersistence::new()))?;

    let (leased, dns) = allocator.get_next_entry("public", 7)?;
    assert_eq!(leased.hostname, "web01");
    assert_eq!(dns.as_deref(), Some("8.8.8.8"));
    let mac_before = leased.mac.clone();

    std::fs::write(
        &path,
        "8.8.8.8\nfrontend01 10.0.0.10 10.0.0.1 10.0.0.255 255.255.255.0\nweb02 10.0.0.11 10.0.0.1 10.0.0.255 255.255.255.0\n",
    )?;
    bump_mtime(&path);

    let (logs, _guard) = capture_logs();
    allocator.validate()?;

    let association = allocator.association("public")?.unwrap();
    let ip: IpAddr = "10.0.0.10".parse()?;
    let entry = association.entry(&ip).unwrap();
    assert!(entry.in_use);
    assert_eq!(entry.hostname, "frontend01");
    assert_eq!(entry.mac, mac_before);
    assert_eq!(allocator.available("public")?, 1);

    let output = logs.contents();
    assert!(output.contains("Network entry changed"), "logs were: {}", output);
    assert!(output.contains("hostname 'web01' -> 'frontend01'"), "logs were: {}", output);
    Ok(())
}

// Editor leftovers and dotfiles are not networks
#[tokio::test]
async fn test_hidden_and_backup_files_are_ignored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_network(dir.path(), "public", &pool_file(0, 2));
    write_network(dir.path(), "public~", &pool_file(1, 2));
    write_network(dir.path(), ".private", &pool_file(2, 2));

    let allocator = NetworkAllocator::new(&network_settings(dir.path()), Arc::new(MemoryPersistence::new()))?;
    assert_eq!(allocator.get_association_names()?, vec!["public".to_string()]);
    Ok(())
}

// Every entry gets a distinct locally administered MAC under the prefix
#[tokio::test]
async fn test_generated_macs_are_unique_and_local() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_network(dir.path(), "a", &pool_file(0, 40));
    write_network(dir.path(), "b", &pool_file(1, 40));

    let allocator = NetworkAllocator::new(&network_settings(dir.path()), Arc::new(MemoryPersistence::new()))?;
    let mut seen = HashSet::new();
    for name in allocator.get_association_names()? {
        for entry in allocator.association(&name)?.unwrap().entries {
            let mac = entry.mac.expect("every entry has a MAC after load");
            assert!(is_valid_mac(&mac, false), "{} is not a valid MAC", mac);
            assert!(mac.starts_with("A2:AA:BB"));
            assert!(seen.insert(mac));
        }
    }
    assert_eq!(seen.len(), 80);
    Ok(())
}

// Concurrent leasers never receive the same address
#[tokio::test]
async fn test_concurrent_leases_are_distinct() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_network(dir.path(), "public", &pool_file(0, 16));
    let allocator = Arc::new(NetworkAllocator::new(
        &network_settings(dir.path()),
        Arc::new(MemoryPersistence::new()),
    )?);

    let handles = (0..20u64).map(|vm_id| {
        let allocator = allocator.clone();
        tokio::spawn(async move { allocator.get_next_entry("public", vm_id) })
    });
    let results = join_all(handles).await;

    let mut ips = HashSet::new();
    let mut denied = 0;
    for result in results {
        match result? {
            Ok((entry, _)) => assert!(ips.insert(entry.ip), "{} leased twice", entry.ip),
            Err(ProvisionError::ResourceRequestDenied { .. }) => denied += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(ips.len(), 16);
    assert_eq!(denied, 4);
    assert_eq!(allocator.available("public")?, 0);
    Ok(())
}

// A malformed file is reported with its location
#[tokio::test]
async fn test_malformed_file_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_network(dir.path(), "broken", "none\nweb01 10.0.0.x 10.0.0.1 10.0.0.255 255.255.255.0\n");

    let err = NetworkAllocator::new(&network_settings(dir.path()), Arc::new(MemoryPersistence::new()))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Validation { .. }));
    assert!(err.to_string().contains("broken:2"), "error was: {}", err);
    Ok(())
}

// Dropping a leased line from the file loses the lease and says so
#[tokio::test]
async fn test_dropped_leased_entry_is_warned() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_network(dir.path(), "public", &pool_file(0, 2));
    let allocator = NetworkAllocator::new(&network_settings(dir.path()), Arc::new(MemoryPersistence::new()))?;

    let (leased, _) = allocator.get_next_entry("public", 3)?;
    assert_eq!(leased.ip.to_string(), "10.0.0.10");

    std::fs::write(
        &path,
        "# test pool\n10.0.0.1\nhost0-1 10.0.0.11 10.0.0.1 10.0.0.255 255.255.255.0\n",
    )?;
    bump_mtime(&path);

    let (logs, _guard) = capture_logs();
    allocator.validate()?;

    let association = allocator.association("public")?.unwrap();
    assert!(association.entry(&leased.ip).is_none());
    assert_eq!(association.entries.len(), 1);
    assert_eq!(allocator.available("public")?, 1);

    let output = logs.contents();
    let line = output
        .lines()
        .find(|l| l.contains("Leased entry dropped from configuration"))
        .unwrap_or_else(|| panic!("logs were: {}", output));
    assert!(line.contains("WARN"), "line was: {}", line);
    assert!(line.contains("10.0.0.10"), "line was: {}", line);
    Ok(())
}

// Removing a network file with live leases drops the network and warns
#[tokio::test]
async fn test_removed_network_with_leases_is_warned() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_network(dir.path(), "public", &pool_file(0, 2));
    let gone = write_network(dir.path(), "lab", &pool_file(1, 2));
    let allocator = NetworkAllocator::new(&network_settings(dir.path()), Arc::new(MemoryPersistence::new()))?;

    allocator.get_next_entry("lab", 5)?;
    std::fs::remove_file(&gone)?;

    let (logs, _guard) = capture_logs();
    allocator.validate()?;

    assert!(allocator.association("lab")?.is_none());
    assert_eq!(allocator.get_association_names()?, vec!["public".to_string()]);

    let output = logs.contents();
    let line = output
        .lines()
        .find(|l| l.contains("Network removed from configuration while addresses are still leased"))
        .unwrap_or_else(|| panic!("logs were: {}", output));
    assert!(line.contains("WARN"), "line was: {}", line);
    assert!(line.contains("leased=1"), "line was: {}", line);
    Ok(())
}
