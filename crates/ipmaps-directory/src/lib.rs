//! ipmaps-directory: directory service client for modem templates.
//!
//! Binds to the LDAP directory, walks the modem entries with the paged
//! results control, and turns each entry into a MAC → template mapping.
//! All directory reads flow through the `DirectorySession` trait so the
//! pagination and validation logic can run against any session.

pub mod client;
pub mod search;

pub use client::{DirectoryConfig, DirectoryError, LdapDirectory};
pub use search::{
    collect_templates, resolve_templates, DirectoryEntry, DirectoryPage, DirectorySession,
    ResolveStats, TemplateResolution,
};
