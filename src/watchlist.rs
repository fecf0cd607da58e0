use crate::error::WatchError;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use dashmap::DashSet;
use std::path::Path;
use std::str::FromStr;

/// The set of addresses whose transfers trigger notifications. Entries are
/// stored in canonical 20-byte form, so hex casing never affects membership.
/// Safe to read while other tasks add or remove entries.
#[derive(Debug, Default)]
pub struct WatchSet {
    addresses: DashSet<Address>,
}

/// Outcome of a bulk load: how many entries were stored and which lines
/// were rejected. A rejected line never aborts the rest of the load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub accepted: usize,
    pub rejected: Vec<WatchError>,
}

pub fn parse_watch_address(entry: &str) -> Result<Address, WatchError> {
    Address::from_str(entry.trim()).map_err(|e| WatchError::InvalidAddress {
        entry: entry.trim().to_string(),
        reason: e.to_string(),
    })
}

impl WatchSet {
    pub fn new() -> Self {
        WatchSet::default()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.addresses.contains(&address)
    }

    /// Returns true when the address was not already present.
    pub fn add(&self, address: Address) -> bool {
        self.addresses.insert(address)
    }

    /// Returns true when the address was present.
    pub fn remove(&self, address: Address) -> bool {
        self.addresses.remove(&address).is_some()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Loads addresses from raw lines. Blank lines are skipped silently,
    /// malformed ones are collected in the report, valid ones are stored.
    pub fn load_from<I, S>(&self, lines: I) -> LoadReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = LoadReport::default();
        for line in lines {
            let entry = line.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match parse_watch_address(entry) {
                Ok(address) => {
                    self.add(address);
                    report.accepted += 1;
                }
                Err(e) => report.rejected.push(e),
            }
        }
        report
    }

    pub fn load_file(&self, path: &Path) -> Result<LoadReport> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read watch address file {}", path.display()))?;
        Ok(self.load_from(contents.lines()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn membership_ignores_hex_casing() {
        let watch = WatchSet::new();
        let lower = parse_watch_address("0xdac17f958d2ee523a2206206994597c13d831ec7").unwrap();
        let upper = parse_watch_address("0xDAC17F958D2EE523A2206206994597C13D831EC7").unwrap();

        assert!(watch.add(lower));
        assert!(watch.contains(upper));
        assert_eq!(watch.len(), 1);
    }

    #[test]
    fn add_and_remove_report_prior_membership() {
        let watch = WatchSet::new();
        let addr = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        assert!(watch.add(addr));
        assert!(!watch.add(addr));
        assert!(watch.remove(addr));
        assert!(!watch.remove(addr));
        assert!(watch.is_empty());
    }

    #[test]
    fn load_skips_blanks_and_collects_bad_entries() {
        let watch = WatchSet::new();
        let report = watch.load_from([
            "0xdac17f958d2ee523a2206206994597c13d831ec7",
            "",
            "   ",
            "not-an-address",
            "  0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48  ",
            "0x1234",
        ]);

        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected.len(), 2);
        assert!(
            report
                .rejected
                .iter()
                .all(|e| matches!(e, WatchError::InvalidAddress { .. }))
        );
        assert_eq!(watch.len(), 2);
        assert!(watch.contains(address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")));
    }

    #[test]
    fn duplicate_lines_count_as_accepted_but_store_once() {
        let watch = WatchSet::new();
        let report = watch.load_from([
            "0xdac17f958d2ee523a2206206994597c13d831ec7",
            "0xDAC17F958D2EE523A2206206994597C13D831EC7",
        ]);

        assert_eq!(report.accepted, 2);
        assert_eq!(watch.len(), 1);
    }
}
