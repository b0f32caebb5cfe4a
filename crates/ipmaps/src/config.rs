//! Configuration for the ipmaps generator.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipmaps_core::IpRange;
use ipmaps_directory::DirectoryConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CollectError, Result};

/// Config file prefix read when `-c` is not given.
pub const DEFAULT_CONFIG_PREFIX: &str = "ipmaps_config";

/// File written by `ipmaps --init-config`, found by the default prefix.
pub const DEFAULT_CONFIG_FILE: &str = "ipmaps_config.json";

/// Top-level ipmaps configuration.
///
/// Loaded from `ipmaps_config.{json,toml}` (or another prefix given on the
/// command line) overlaid with `IPMAPS__` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmapsConfig {
    /// Lease-query tool invocation.
    #[serde(default)]
    pub ipcli: IpcliConfig,

    /// Directory service holding modem templates.
    #[serde(default)]
    pub ldap: LdapConfig,

    /// Per lease query deadline, and per directory request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum lease-tool processes running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_fetches: usize,

    /// Capacity of the channel feeding parsed leases to the merge loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// CSV file mapping directory templates to billing packages.
    #[serde(default = "default_package_file")]
    pub template_to_package_file: String,

    /// Subscriber report destination.
    #[serde(default = "default_output_file")]
    pub output_file: String,

    /// Append logs to this file instead of stderr.
    #[serde(default)]
    pub log_file: Option<String>,

    /// Debug logging, also enabled by `-v`.
    #[serde(default)]
    pub verbose: bool,

    /// IP ranges whose leases are queried, one tool invocation each.
    #[serde(default)]
    pub network_leases: Vec<IpRange>,
}

/// Connection parameters passed to the lease-query tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcliConfig {
    /// Path to the tool; bare names are looked up on `PATH`.
    #[serde(default = "default_ipcli_command")]
    pub command: String,

    /// Lease cluster address (`-S`).
    #[serde(default)]
    pub cluster: String,

    /// `-N`
    #[serde(default)]
    pub user: String,

    /// `-P`
    #[serde(default)]
    pub password: String,

    /// Working directory for the tool process.
    #[serde(default)]
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    #[serde(default = "default_ldap_host")]
    pub host: String,

    #[serde(default = "default_ldap_port")]
    pub port: u16,

    /// Base DN; modem entries are its direct children.
    #[serde(default = "default_base_dn")]
    pub base_dn: String,

    #[serde(default)]
    pub bind_dn: String,

    #[serde(default)]
    pub bind_password: String,

    #[serde(default = "default_filter")]
    pub filter: String,

    /// Paged results size. Large enough that most directories fit in one page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    8
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_package_file() -> String {
    "package_maps.csv".to_string()
}

fn default_output_file() -> String {
    "subscribers.csv".to_string()
}

fn default_ipcli_command() -> String {
    "/usr/local/bin/ipcmd".to_string()
}

fn default_ldap_host() -> String {
    "localhost".to_string()
}

fn default_ldap_port() -> u16 {
    389
}

fn default_base_dn() -> String {
    "ou=cms,o=incognito,dc=cabotva,dc=net".to_string()
}

fn default_filter() -> String {
    "(objectClass=modemClass)".to_string()
}

fn default_page_size() -> u32 {
    16 * 1024
}

impl Default for IpcliConfig {
    fn default() -> Self {
        Self {
            command: default_ipcli_command(),
            cluster: String::new(),
            user: String::new(),
            password: String::new(),
            work_dir: None,
        }
    }
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            host: default_ldap_host(),
            port: default_ldap_port(),
            base_dn: default_base_dn(),
            bind_dn: String::new(),
            bind_password: String::new(),
            filter: default_filter(),
            page_size: default_page_size(),
        }
    }
}

impl Default for IpmapsConfig {
    fn default() -> Self {
        Self {
            ipcli: IpcliConfig::default(),
            ldap: LdapConfig::default(),
            timeout_secs: default_timeout_secs(),
            max_concurrent_fetches: default_max_concurrent(),
            channel_capacity: default_channel_capacity(),
            template_to_package_file: default_package_file(),
            output_file: default_output_file(),
            log_file: None,
            verbose: false,
            network_leases: Vec::new(),
        }
    }
}

impl IpmapsConfig {
    /// Load `<file_prefix>.*` (optional) and `IPMAPS__*` overrides, then validate.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("IPMAPS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: IpmapsConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network_leases.is_empty() {
            return Err(CollectError::Config(
                "network_leases must list at least one IP range".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(CollectError::Config(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.ldap.page_size == 0 {
            return Err(CollectError::Config(
                "ldap.page_size must be greater than zero".to_string(),
            ));
        }
        if self.ipcli.command.trim().is_empty() {
            return Err(CollectError::Config("ipcli.command is empty".to_string()));
        }
        Ok(())
    }

    /// Pairs of configured ranges that share addresses. Leases in the
    /// overlap are queried, and reported, twice.
    pub fn overlapping_ranges(&self) -> Vec<(IpRange, IpRange)> {
        let mut pairs = Vec::new();
        for (i, a) in self.network_leases.iter().enumerate() {
            for b in &self.network_leases[i + 1..] {
                if a.overlaps(b) {
                    pairs.push((*a, *b));
                }
            }
        }
        pairs
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_level(&self, cli_verbose: bool) -> &'static str {
        if self.verbose || cli_verbose {
            "debug"
        } else {
            "info"
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            host: self.ldap.host.clone(),
            port: self.ldap.port,
            bind_dn: self.ldap.bind_dn.clone(),
            bind_password: self.ldap.bind_password.clone(),
            base_dn: self.ldap.base_dn.clone(),
            filter: self.ldap.filter.clone(),
            page_size: self.ldap.page_size,
            timeout: self.timeout(),
        }
    }

    /// Placeholder configuration written by `--init-config`.
    pub fn sample() -> Self {
        let range = |a: u8, c: u8| {
            IpRange::new(Ipv4Addr::new(a, 0, c, 0), Ipv4Addr::new(a, 0, c, 255))
        };
        Self {
            ipcli: IpcliConfig {
                cluster: "10.1.1.1".to_string(),
                user: "xxx".to_string(),
                password: "xxx".to_string(),
                ..Default::default()
            },
            ldap: LdapConfig {
                host: "192.168.0.1".to_string(),
                base_dn: "dc=xxx,dc=xx".to_string(),
                bind_dn: "cn=xxx,dc=xxx,dc=xxx".to_string(),
                bind_password: "xxxxx".to_string(),
                ..Default::default()
            },
            network_leases: [range(8, 0), range(7, 0), range(7, 1), range(1, 0)]
                .into_iter()
                .flatten()
                .collect(),
            ..Default::default()
        }
    }

    /// Write this configuration as pretty-printed JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
