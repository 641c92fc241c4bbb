// Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use vm_provision_core::config::NetworkSettings;

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Route this thread's log output into a buffer until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

pub fn network_settings(dir: &Path) -> NetworkSettings {
    NetworkSettings {
        config_dir: dir.to_path_buf(),
        mac_prefix: "A2:AA:BB".to_string(),
    }
}

pub fn write_network(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// `hosts` entries on 10.<octet>.0.0/24, starting at .10.
pub fn pool_file(octet: u8, hosts: u8) -> String {
    let mut contents = format!("# test pool\n10.{}.0.1\n", octet);
    for i in 0..hosts {
        contents.push_str(&format!(
            "host{octet}-{i} 10.{octet}.0.{} 10.{octet}.0.1 10.{octet}.0.255 255.255.255.0\n",
            10 + i
        ));
    }
    contents
}
