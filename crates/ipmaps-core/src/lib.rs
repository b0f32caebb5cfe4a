//! ipmaps-core: Shared types and error handling for the ipmaps aggregator.
//!
//! This crate provides the foundational types used across the workspace:
//! - Hardware addresses (`MacAddr`) and their canonical plain form
//! - IPv4 query ranges (`IpRange`) loaded from configuration
//! - Lease rows (`LeaseRecord`) and the maps built from them
//! - Common error types

pub mod error;
pub mod types;

pub use error::CoreError;
pub use types::{
    CmCpeMap, CmTemplateMap, IpRange, LeaseRecord, MacAddr, PackageId, TemplateId,
    TemplatePackageMap,
};
