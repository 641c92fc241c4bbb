//! MAC address generation under a configured prefix.
//!
//! Addresses are 17 characters, `XX:XX:XX:XX:XX:XX`, upper-case. The second
//! hex digit is always one of `2`, `6`, `A`, `E`: locally administered,
//! unicast. Prefixes are validated against the same rules.

use rand::Rng;
use std::collections::HashSet;
use tracing::debug;

use crate::errors::{ProvisionError, ProvisionResult};

pub const MAC_LEN: usize = 17;

const SEPARATOR_POSITIONS: [usize; 5] = [2, 5, 8, 11, 14];
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";
const LOCAL_UNICAST_DIGITS: &[u8; 4] = b"26AE";

// below this many remaining characters the whole space is enumerated
const EXHAUSTIVE_THRESHOLD: usize = 4;

fn is_separator_position(position: usize) -> bool {
    SEPARATOR_POSITIONS.contains(&position)
}

/// Why a MAC or prefix string was rejected; `None` if it is acceptable.
fn mac_violation(mac: &str, prefix_allowed: bool) -> Option<String> {
    let bytes = mac.as_bytes();
    if bytes.len() > MAC_LEN {
        return Some(format!("longer than {} characters", MAC_LEN));
    }
    if !prefix_allowed && bytes.len() != MAC_LEN {
        return Some(format!("must be exactly {} characters", MAC_LEN));
    }
    for (position, &b) in bytes.iter().enumerate() {
        if is_separator_position(position) {
            if b != b':' {
                return Some(format!(
                    "expected ':' at position {}, found '{}'",
                    position, b as char
                ));
            }
        } else if !b.is_ascii_hexdigit() {
            return Some(format!(
                "illegal character '{}' at position {}",
                b as char, position
            ));
        }
    }
    if bytes.len() >= 2 && !LOCAL_UNICAST_DIGITS.contains(&bytes[1].to_ascii_uppercase()) {
        return Some(format!(
            "second character '{}' must be one of 2, 6, A, E (locally administered unicast)",
            bytes[1] as char
        ));
    }
    None
}

/// Format check usable outside of allocation. With `prefix_allowed` a
/// leading fragment of a MAC is accepted as well.
pub fn is_valid_mac(mac: &str, prefix_allowed: bool) -> bool {
    mac_violation(mac, prefix_allowed).is_none()
}

#[derive(Debug, Clone)]
pub struct MacAllocator {
    prefix: String,
}

impl MacAllocator {
    pub fn new(prefix: &str) -> ProvisionResult<Self> {
        if let Some(reason) = mac_violation(prefix, true) {
            return Err(ProvisionError::validation(
                "mac prefix",
                format!("'{}': {}", prefix, reason),
            ));
        }
        Ok(Self {
            prefix: prefix.to_ascii_uppercase(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `mac` was generated under the current prefix.
    pub fn matches_prefix(&self, mac: &str) -> bool {
        mac.to_ascii_uppercase().starts_with(&self.prefix)
    }

    fn needed(&self) -> usize {
        MAC_LEN - self.prefix.len()
    }

    /// Produce one MAC that is not in `taken` (upper-case strings).
    pub fn next_mac(&self, taken: &HashSet<String>) -> ProvisionResult<String> {
        let needed = self.needed();
        if needed < EXHAUSTIVE_THRESHOLD {
            self.next_exhaustive(taken)
        } else {
            self.next_random(taken, needed)
        }
    }

    /// Character choices for every position after the prefix.
    fn slots(&self) -> Vec<&'static [u8]> {
        (self.prefix.len()..MAC_LEN)
            .map(|position| -> &'static [u8] {
                if is_separator_position(position) {
                    &b":"[..]
                } else if position == 1 {
                    &LOCAL_UNICAST_DIGITS[..]
                } else {
                    &HEX_DIGITS[..]
                }
            })
            .collect()
    }

    fn next_exhaustive(&self, taken: &HashSet<String>) -> ProvisionResult<String> {
        let slots = self.slots();
        let total: usize = slots.iter().map(|s| s.len()).product();
        let mut counters = vec![0usize; slots.len()];

        for _ in 0..total {
            let candidate = self.render(&slots, &counters);
            if !taken.contains(&candidate) {
                debug!(mac = %candidate, "Allocated MAC by enumeration");
                return Ok(candidate);
            }
            // odometer increment, rightmost slot first
            for i in (0..slots.len()).rev() {
                counters[i] += 1;
                if counters[i] < slots[i].len() {
                    break;
                }
                counters[i] = 0;
            }
        }

        Err(ProvisionError::denied(format!(
            "MAC address space under prefix '{}' is exhausted ({} addresses, all in use)",
            self.prefix, total
        )))
    }

    fn next_random(&self, taken: &HashSet<String>, needed: usize) -> ProvisionResult<String> {
        let slots = self.slots();
        let attempts = 16u64.checked_pow(needed as u32).unwrap_or(u64::MAX);
        let mut rng = rand::thread_rng();
        let mut counters = vec![0usize; slots.len()];

        for _ in 0..attempts {
            for (counter, slot) in counters.iter_mut().zip(&slots) {
                *counter = rng.gen_range(0..slot.len());
            }
            let candidate = self.render(&slots, &counters);
            if !taken.contains(&candidate) {
                debug!(mac = %candidate, "Allocated random MAC");
                return Ok(candidate);
            }
        }

        Err(ProvisionError::denied(format!(
            "no free MAC address under prefix '{}' after {} attempts",
            self.prefix, attempts
        )))
    }

    fn render(&self, slots: &[&'static [u8]], counters: &[usize]) -> String {
        let mut mac = String::with_capacity(MAC_LEN);
        mac.push_str(&self.prefix);
        for (slot, &index) in slots.iter().zip(counters) {
            mac.push(slot[index] as char);
        }
        mac
    }
}
