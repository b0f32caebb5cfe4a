//! LDAP connection management and the paged search session.

use std::time::Duration;

use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, PagedResults};
use ldap3::{DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions};

use crate::search::{DirectoryEntry, DirectoryPage, DirectorySession, ATTRIBUTES};

/// Errors from directory operations. All of them abort template resolution.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("Directory bind as {bind_dn:?} failed: {reason}")]
    Bind { bind_dn: String, reason: String },

    #[error("Directory search under {base_dn:?} failed: {reason}")]
    Search { base_dn: String, reason: String },
}

/// Configuration for connecting to and searching the directory.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub host: String,
    pub port: u16,
    pub bind_dn: String,
    pub bind_password: String,
    pub base_dn: String,
    pub filter: String,
    /// Requested paged-results size; the server may return fewer per page.
    pub page_size: u32,
    /// Applied to the TCP connect and to every individual request.
    pub timeout: Duration,
}

impl DirectoryConfig {
    pub fn url(&self) -> String {
        format!("ldap://{}:{}", self.host, self.port)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 389,
            bind_dn: String::new(),
            bind_password: String::new(),
            base_dn: "ou=cms,o=incognito,dc=cabotva,dc=net".to_string(),
            filter: "(objectClass=modemClass)".to_string(),
            page_size: 16 * 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

/// An authenticated LDAP session.
///
/// The session is serial: one search request is outstanding at a time.
pub struct LdapDirectory {
    ldap: Ldap,
    config: DirectoryConfig,
}

impl LdapDirectory {
    /// Dial the directory and perform a simple bind.
    pub async fn connect(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let url = config.url();
        let settings = LdapConnSettings::new().set_conn_timeout(config.timeout);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| DirectoryError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        ldap3::drive!(conn);
        tracing::debug!(url = %url, "Connected to directory");

        ldap.with_timeout(config.timeout)
            .simple_bind(&config.bind_dn, &config.bind_password)
            .await
            .and_then(|res| res.success())
            .map_err(|e| DirectoryError::Bind {
                bind_dn: config.bind_dn.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(url = %url, bind_dn = %config.bind_dn, "Bound to directory");
        Ok(Self {
            ldap,
            config: config.clone(),
        })
    }

    /// Close the session. Failures are logged, never propagated: the search
    /// results are already complete at this point.
    pub async fn close(mut self) {
        if let Err(e) = self.ldap.unbind().await {
            tracing::warn!(error = %e, "Directory unbind failed");
        }
    }

    fn search_error(&self, reason: impl ToString) -> DirectoryError {
        DirectoryError::Search {
            base_dn: self.config.base_dn.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl DirectorySession for LdapDirectory {
    async fn search_page(&mut self, cookie: &[u8]) -> Result<DirectoryPage, DirectoryError> {
        let paging = PagedResults {
            size: i32::try_from(self.config.page_size).unwrap_or(i32::MAX),
            cookie: cookie.to_vec(),
        };

        let result = self
            .ldap
            .with_search_options(SearchOptions::new().deref(DerefAliases::Always))
            .with_controls(paging)
            .with_timeout(self.config.timeout)
            .search(
                &self.config.base_dn,
                Scope::OneLevel,
                &self.config.filter,
                ATTRIBUTES.to_vec(),
            )
            .await
            .map_err(|e| self.search_error(e))?;
        let (raw_entries, res) = result.success().map_err(|e| self.search_error(e))?;

        let entries = raw_entries
            .into_iter()
            .map(|raw| {
                let entry = SearchEntry::construct(raw);
                DirectoryEntry {
                    dn: entry.dn,
                    attrs: entry.attrs,
                }
            })
            .collect();

        let cookie = res.ctrls.iter().find_map(|ctrl| match ctrl {
            Control(Some(ControlType::PagedResults), raw) if raw.val.is_some() => {
                Some(raw.parse::<PagedResults>().cookie)
            }
            _ => None,
        });

        Ok(DirectoryPage { entries, cookie })
    }
}
