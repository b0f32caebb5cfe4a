//! Paged template search and entry validation.

use std::collections::HashMap;

use async_trait::async_trait;
use ipmaps_core::{CmTemplateMap, MacAddr, TemplateId};

use crate::client::{DirectoryConfig, DirectoryError, LdapDirectory};

/// Attribute holding the modem MAC, in any textual notation.
pub const MAC_ATTRIBUTE: &str = "cn";
/// Attribute holding the decimal template identifier.
pub const TEMPLATE_ATTRIBUTE: &str = "accessType";
/// Attributes requested from the directory, nothing else.
pub const ATTRIBUTES: [&str; 2] = [MAC_ATTRIBUTE, TEMPLATE_ATTRIBUTE];

/// One entry as returned by the directory.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// First value of `name`, or an empty string when absent.
    pub fn attribute(&self, name: &str) -> &str {
        self.attrs
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// One page of search results plus the server's continuation cookie.
#[derive(Debug, Clone, Default)]
pub struct DirectoryPage {
    pub entries: Vec<DirectoryEntry>,
    /// `None` when the server attached no paging control.
    pub cookie: Option<Vec<u8>>,
}

/// A bound directory session able to run the modem search one page at a time.
#[async_trait]
pub trait DirectorySession: Send {
    /// Issue the search with `cookie` attached (empty for the first page).
    async fn search_page(&mut self, cookie: &[u8]) -> Result<DirectoryPage, DirectoryError>;
}

/// Counters for a completed resolution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveStats {
    pub pages: u32,
    pub entries: u64,
    pub invalid_mac: u64,
    pub invalid_template: u64,
    pub duplicates: u64,
}

/// Resolved templates and how they were obtained.
#[derive(Debug, Default)]
pub struct TemplateResolution {
    pub templates: CmTemplateMap,
    pub stats: ResolveStats,
}

/// Connect, bind, and collect every modem template from the directory.
///
/// Any connect, bind, or search failure aborts the resolution; entries read
/// before the failure are discarded.
pub async fn resolve_templates(
    config: &DirectoryConfig,
) -> Result<TemplateResolution, DirectoryError> {
    let mut session = LdapDirectory::connect(config).await?;
    let resolution = collect_templates(&mut session).await;
    session.close().await;

    let resolution = resolution?;
    tracing::info!(
        templates = resolution.templates.len(),
        pages = resolution.stats.pages,
        entries = resolution.stats.entries,
        invalid_mac = resolution.stats.invalid_mac,
        invalid_template = resolution.stats.invalid_template,
        duplicates = resolution.stats.duplicates,
        "Directory templates resolved"
    );
    Ok(resolution)
}

/// Walk all pages of the search and validate each entry.
///
/// The loop ends only when the server returns no cookie or an empty one.
/// Invalid entries and repeated MACs are logged and skipped; the first
/// template seen for a MAC is kept.
pub async fn collect_templates<S>(session: &mut S) -> Result<TemplateResolution, DirectoryError>
where
    S: DirectorySession + ?Sized,
{
    let mut templates = CmTemplateMap::new();
    let mut stats = ResolveStats::default();
    let mut cookie: Vec<u8> = Vec::new();

    loop {
        let page = session.search_page(&cookie).await?;
        stats.pages += 1;
        tracing::debug!(page = stats.pages, entries = page.entries.len(), "Directory page received");

        for entry in &page.entries {
            stats.entries += 1;

            let raw_mac = entry.attribute(MAC_ATTRIBUTE);
            let mac = match raw_mac.parse::<MacAddr>() {
                Ok(mac) => mac.plain(),
                Err(e) => {
                    tracing::warn!(dn = %entry.dn, error = %e, "Skipping entry with invalid MAC");
                    stats.invalid_mac += 1;
                    continue;
                }
            };

            let raw_template = entry.attribute(TEMPLATE_ATTRIBUTE);
            let template = match parse_template(raw_template) {
                Some(t) => t,
                None => {
                    tracing::warn!(
                        dn = %entry.dn,
                        mac = %mac,
                        value = %raw_template,
                        "Skipping entry with invalid template"
                    );
                    stats.invalid_template += 1;
                    continue;
                }
            };

            if let Some(kept) = templates.get(&mac) {
                tracing::warn!(
                    mac = %mac,
                    kept = *kept,
                    dropped = template,
                    "Skipping duplicated MAC"
                );
                stats.duplicates += 1;
                continue;
            }
            templates.insert(mac, template);
        }

        match page.cookie {
            Some(next) if !next.is_empty() => cookie = next,
            _ => break,
        }
    }

    Ok(TemplateResolution { templates, stats })
}

fn parse_template(raw: &str) -> Option<TemplateId> {
    raw.trim().parse::<TemplateId>().ok()
}
