//! Networks ("associations") and their leasable address entries, plus the
//! parser for the one-file-per-network pool directory.
//!
//! File format: the first non-comment, non-blank line is the DNS setting
//! (`none` or a host/IP). Every following line is
//! `hostname ip gateway broadcast netmask [mac]`, where anything but the
//! hostname and IP may be the literal `none`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::SystemTime;

use crate::errors::{ProvisionError, ProvisionResult};
use crate::network::mac::is_valid_mac;

const NONE: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationEntry {
    pub hostname: String,
    pub ip: IpAddr,
    pub mac: Option<String>,
    pub gateway: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub netmask: Option<IpAddr>,
    pub in_use: bool,
    /// Pinned in the config file; never handed to the MAC allocator.
    pub explicit_mac: bool,
}

impl AssociationEntry {
    /// Human-readable list of attribute changes from `self` to `other`.
    /// The lease flag is runtime state and is not compared.
    pub fn differences(&self, other: &AssociationEntry) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.hostname != other.hostname {
            diffs.push(format!("hostname '{}' -> '{}'", self.hostname, other.hostname));
        }
        if self.gateway != other.gateway {
            diffs.push(format!("gateway {} -> {}", show(&self.gateway), show(&other.gateway)));
        }
        if self.broadcast != other.broadcast {
            diffs.push(format!(
                "broadcast {} -> {}",
                show(&self.broadcast),
                show(&other.broadcast)
            ));
        }
        if self.netmask != other.netmask {
            diffs.push(format!("netmask {} -> {}", show(&self.netmask), show(&other.netmask)));
        }
        if other.explicit_mac && self.mac != other.mac {
            diffs.push(format!("mac {} -> {}", show(&self.mac), show(&other.mac)));
        }
        diffs
    }
}

fn show<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| NONE.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub name: String,
    /// `None` when the file says `none`.
    pub dns: Option<String>,
    pub entries: Vec<AssociationEntry>,
    pub file_time: Option<SystemTime>,
}

impl Association {
    pub fn entry(&self, ip: &IpAddr) -> Option<&AssociationEntry> {
        self.entries.iter().find(|e| &e.ip == ip)
    }

    pub fn entry_mut(&mut self, ip: &IpAddr) -> Option<&mut AssociationEntry> {
        self.entries.iter_mut().find(|e| &e.ip == ip)
    }

    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.in_use).count()
    }

    /// Parse the contents of one pool file.
    pub fn parse(
        name: &str,
        contents: &str,
        file_time: Option<SystemTime>,
    ) -> ProvisionResult<Association> {
        let mut lines = contents
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let dns = match lines.next() {
            Some((_, line)) if line.eq_ignore_ascii_case(NONE) => None,
            Some((lineno, line)) => {
                if line.split_whitespace().count() != 1 {
                    return Err(ProvisionError::validation(
                        "network file",
                        format!("{}:{}: DNS line must be a single token", name, lineno),
                    ));
                }
                Some(line.to_string())
            }
            None => {
                return Err(ProvisionError::validation(
                    "network file",
                    format!("{}: missing DNS line", name),
                ))
            }
        };

        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        for (lineno, line) in lines {
            let entry = parse_entry(name, lineno, line)?;
            if !seen.insert(entry.ip) {
                return Err(ProvisionError::validation(
                    "network file",
                    format!("{}:{}: duplicate IP address {}", name, lineno, entry.ip),
                ));
            }
            entries.push(entry);
        }

        Ok(Association {
            name: name.to_string(),
            dns,
            entries,
            file_time,
        })
    }
}

fn parse_entry(name: &str, lineno: usize, line: &str) -> ProvisionResult<AssociationEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(ProvisionError::validation(
            "network file",
            format!(
                "{}:{}: expected 'hostname ip gateway broadcast netmask [mac]', found {} fields",
                name,
                lineno,
                fields.len()
            ),
        ));
    }

    let ip = parse_ip(name, lineno, "ip", fields[1])?;
    let gateway = parse_optional_ip(name, lineno, "gateway", fields[2])?;
    let broadcast = parse_optional_ip(name, lineno, "broadcast", fields[3])?;
    let netmask = parse_optional_ip(name, lineno, "netmask", fields[4])?;

    let mac = match fields.get(5) {
        Some(mac) if !mac.eq_ignore_ascii_case(NONE) => {
            if !is_valid_mac(mac, false) {
                return Err(ProvisionError::validation(
                    "network file",
                    format!("{}:{}: invalid MAC address '{}'", name, lineno, mac),
                ));
            }
            Some(mac.to_ascii_uppercase())
        }
        _ => None,
    };

    Ok(AssociationEntry {
        hostname: fields[0].to_string(),
        ip,
        explicit_mac: mac.is_some(),
        mac,
        gateway,
        broadcast,
        netmask,
        in_use: false,
    })
}

fn parse_ip(name: &str, lineno: usize, field: &str, value: &str) -> ProvisionResult<IpAddr> {
    value.parse().map_err(|_| {
        ProvisionError::validation(
            "network file",
            format!("{}:{}: invalid {} '{}'", name, lineno, field, value),
        )
    })
}

fn parse_optional_ip(
    name: &str,
    lineno: usize,
    field: &str,
    value: &str,
) -> ProvisionResult<Option<IpAddr>> {
    if value.eq_ignore_ascii_case(NONE) {
        return Ok(None);
    }
    parse_ip(name, lineno, field, value).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC: &str = "\
# public network
8.8.8.8
pub01 10.0.0.2 10.0.0.1 10.0.0.255 255.255.255.0
pub02 10.0.0.3 none none 255.255.255.0 A2:AA:BB:00:00:01
";

    #[test]
    fn parses_dns_and_entries() {
        let assoc = Association::parse("public", PUBLIC, None).unwrap();
        assert_eq!(assoc.dns.as_deref(), Some("8.8.8.8"));
        assert_eq!(assoc.entries.len(), 2);

        let first = &assoc.entries[0];
        assert_eq!(first.hostname, "pub01");
        assert_eq!(first.gateway, Some("10.0.0.1".parse().unwrap()));
        assert!(!first.explicit_mac);
        assert!(first.mac.is_none());

        let second = &assoc.entries[1];
        assert!(second.gateway.is_none());
        assert!(second.explicit_mac);
        assert_eq!(second.mac.as_deref(), Some("A2:AA:BB:00:00:01"));
    }

    #[test]
    fn none_dns_means_absent() {
        let assoc = Association::parse("private", "none\n", None).unwrap();
        assert!(assoc.dns.is_none());
        assert!(assoc.entries.is_empty());
    }

    #[test]
    fn rejects_duplicate_ip() {
        let contents = "none\na 10.0.0.2 none none none\nb 10.0.0.2 none none none\n";
        let err = Association::parse("dup", contents, None).unwrap_err();
        assert!(err.to_string().contains("duplicate IP address 10.0.0.2"));
    }

    #[test]
    fn rejects_short_lines_and_bad_addresses() {
        assert!(Association::parse("x", "none\na 10.0.0.2 none\n", None).is_err());
        assert!(Association::parse("x", "none\na none none none none\n", None).is_err());
        assert!(Association::parse("x", "", None).is_err());
    }

    #[test]
    fn differences_ignore_lease_flag() {
        let assoc = Association::parse("public", PUBLIC, None).unwrap();
        let old = assoc.entries[0].clone();
        let mut new = old.clone();
        new.in_use = true;
        assert!(old.differences(&new).is_empty());

        new.hostname = "renamed".to_string();
        assert_eq!(old.differences(&new), vec!["hostname 'pub01' -> 'renamed'"]);
    }
}
