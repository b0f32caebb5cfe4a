//! Core domain types for the subscriber mapping pipeline.
//!
//! Leases and directory entries are both keyed by the cable modem's hardware
//! address in its plain form (12 uppercase hex digits), so the maps built by
//! the lease aggregator and the directory resolver join on the same key.

use std::collections::btree_map::{self, BTreeMap};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Directory service template identifier (`accessType`).
pub type TemplateId = u32;

/// Billing package identifier used by the downstream provisioning system.
pub type PackageId = u32;

// ── Hardware Address ──────────────────────────────────────────────

/// A 6-octet cable modem hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Plain form: 12 uppercase hex digits, no separators.
    pub fn plain(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddr {
    type Err = CoreError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF`, `aabb.ccdd.eeff`
    /// and `AABBCCDDEEFF`, case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidMac(s.to_string());
        let trimmed = s.trim();

        let digits: String = if trimmed.len() == 12 {
            trimmed.to_string()
        } else if trimmed.len() == 17 {
            let sep = trimmed.as_bytes()[2];
            if sep != b':' && sep != b'-' {
                return Err(invalid());
            }
            let groups: Vec<&str> = trimmed.split(sep as char).collect();
            if groups.len() != 6 || groups.iter().any(|g| g.len() != 2) {
                return Err(invalid());
            }
            groups.concat()
        } else if trimmed.len() == 14 {
            let groups: Vec<&str> = trimmed.split('.').collect();
            if groups.len() != 3 || groups.iter().any(|g| g.len() != 4) {
                return Err(invalid());
            }
            groups.concat()
        } else {
            return Err(invalid());
        };

        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

// ── IP Ranges ─────────────────────────────────────────────────────

/// An inclusive IPv4 interval queried by one lease fetch.
///
/// Configured either as `{ start, end }` bounds or as `{ cidr }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RangeSpec", into = "RangeSpec")]
pub struct IpRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl IpRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if u32::from(start) > u32::from(end) {
            return Err(CoreError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Range covering every address of `net`, network and broadcast included.
    pub fn from_cidr(net: Ipv4Net) -> Self {
        Self {
            start: net.network(),
            end: net.broadcast(),
        }
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.start)..=u32::from(self.end)).contains(&u32::from(ip))
    }

    pub fn overlaps(&self, other: &IpRange) -> bool {
        u32::from(self.start) <= u32::from(other.end)
            && u32::from(other.start) <= u32::from(self.end)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RangeSpec {
    Bounds { start: Ipv4Addr, end: Ipv4Addr },
    Cidr { cidr: Ipv4Net },
}

impl TryFrom<RangeSpec> for IpRange {
    type Error = CoreError;

    fn try_from(spec: RangeSpec) -> Result<Self> {
        match spec {
            RangeSpec::Bounds { start, end } => IpRange::new(start, end),
            RangeSpec::Cidr { cidr } => Ok(IpRange::from_cidr(cidr)),
        }
    }
}

impl From<IpRange> for RangeSpec {
    fn from(range: IpRange) -> Self {
        RangeSpec::Bounds {
            start: range.start,
            end: range.end,
        }
    }
}

// ── Leases ────────────────────────────────────────────────────────

/// One `<ip>,<mac>` row reported by the lease-query tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub ip: String,
    pub mac: String,
}

impl LeaseRecord {
    /// Build a record if it passes the fixed-width checks: the IP field must
    /// be longer than 6 characters and the MAC exactly 12. The MAC is
    /// uppercased so it joins with directory keys.
    pub fn new(ip: &str, mac: &str) -> Option<Self> {
        if ip.len() > 6 && mac.len() == 12 {
            Some(Self {
                ip: ip.to_string(),
                mac: mac.to_ascii_uppercase(),
            })
        } else {
            None
        }
    }
}

/// Cable modem MAC → `;`-joined CPE IP addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmCpeMap(BTreeMap<String, String>);

impl CmCpeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lease. A MAC already present keeps its IPs and gets `;ip`
    /// appended.
    pub fn insert(&mut self, record: LeaseRecord) {
        match self.0.entry(record.mac) {
            btree_map::Entry::Occupied(mut e) => {
                let ips = e.get_mut();
                ips.push(';');
                ips.push_str(&record.ip);
            }
            btree_map::Entry::Vacant(e) => {
                e.insert(record.ip);
            }
        }
    }

    pub fn get(&self, mac: &str) -> Option<&str> {
        self.0.get(mac).map(String::as_str)
    }

    /// Individual IPs recorded for `mac`, in merge order.
    pub fn ips(&self, mac: &str) -> impl Iterator<Item = &str> {
        self.get(mac).into_iter().flat_map(|v| v.split(';'))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in ascending MAC order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Cable modem MAC (plain form) → directory template.
pub type CmTemplateMap = HashMap<String, TemplateId>;

/// Directory template → billing package.
pub type TemplatePackageMap = HashMap<TemplateId, PackageId>;
