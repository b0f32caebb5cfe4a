//! ipmaps: Subscriber to CPE IP mapping generator.
//!
//! Queries the DHCP lease tool for every configured IP range concurrently,
//! resolves each modem's service template from the LDAP directory, maps
//! templates to billing packages, and writes the subscriber CSV report.

pub mod aggregate;
pub mod collect;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod packages;
pub mod report;
