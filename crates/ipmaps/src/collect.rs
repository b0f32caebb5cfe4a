//! Run coordinator.
//!
//! Loads the package map, then resolves directory templates and aggregates
//! leases concurrently. The two share no data and are joined before the
//! report stage.

use std::future::Future;
use std::sync::Arc;

use ipmaps_core::{CmCpeMap, CmTemplateMap, TemplatePackageMap};
use ipmaps_directory::{resolve_templates, DirectoryError, ResolveStats, TemplateResolution};
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{aggregate_leases, AggregateOptions, AggregateStats, RangeFailure};
use crate::config::IpmapsConfig;
use crate::error::{CollectError, Result};
use crate::fetcher::{IpcliFetcher, LeaseSource};
use crate::packages::read_template_packages;

/// Everything the report stage needs, produced by one run.
#[derive(Debug)]
pub struct SubscriberMaps {
    pub run_id: Uuid,
    pub leases: CmCpeMap,
    pub templates: CmTemplateMap,
    pub packages: TemplatePackageMap,
    /// Ranges whose leases are missing from `leases`.
    pub range_failures: Vec<RangeFailure>,
    pub lease_stats: AggregateStats,
    pub directory_stats: ResolveStats,
}

/// Run against the configured lease tool and directory.
pub async fn run(config: &IpmapsConfig) -> Result<SubscriberMaps> {
    let fetcher = Arc::new(IpcliFetcher::new(&config.ipcli));
    let directory_config = config.directory_config();
    collect(config, fetcher, resolve_templates(&directory_config)).await
}

/// Collect the three maps from the given lease source and directory
/// resolution.
///
/// Fails if the package map or the directory cannot be read, or if every
/// lease range failed. Individual range failures are returned in
/// `range_failures`.
pub async fn collect<S, F>(
    config: &IpmapsConfig,
    source: Arc<S>,
    directory: F,
) -> Result<SubscriberMaps>
where
    S: LeaseSource,
    F: Future<Output = std::result::Result<TemplateResolution, DirectoryError>>,
{
    let run_id = Uuid::new_v4();
    collect_maps(run_id, config, source, directory)
        .instrument(tracing::info_span!("collect", run_id = %run_id))
        .await
}

async fn collect_maps<S, F>(
    run_id: Uuid,
    config: &IpmapsConfig,
    source: Arc<S>,
    directory: F,
) -> Result<SubscriberMaps>
where
    S: LeaseSource,
    F: Future<Output = std::result::Result<TemplateResolution, DirectoryError>>,
{
    let packages = read_template_packages(&config.template_to_package_file).await?;

    let options = AggregateOptions {
        timeout: config.timeout(),
        max_concurrent: config.max_concurrent_fetches,
        channel_capacity: config.channel_capacity,
    };
    let leases = async {
        Ok::<_, CollectError>(aggregate_leases(source, &config.network_leases, &options).await)
    };
    let directory = async { directory.await.map_err(CollectError::from) };

    let (resolution, aggregate) = tokio::try_join!(directory, leases)?;

    if aggregate.all_failed() {
        for failure in &aggregate.failures {
            tracing::error!(range = %failure.range, error = %failure.error, "Lease range failed");
        }
        return Err(CollectError::NoLeaseData {
            failed: aggregate.failures.len(),
        });
    }

    Ok(SubscriberMaps {
        run_id,
        leases: aggregate.leases,
        templates: resolution.templates,
        packages,
        range_failures: aggregate.failures,
        lease_stats: aggregate.stats,
        directory_stats: resolution.stats,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use async_trait::async_trait;
    use ipmaps_core::{IpRange, LeaseRecord};

    use super::*;
    use crate::fetcher::{FetchStats, LeaseError, LeaseSink};

    /// Serves one lease per range, failing ranges whose first octet is 6.
    struct StaticSource;

    #[async_trait]
    impl LeaseSource for StaticSource {
        async fn fetch(
            &self,
            range: &IpRange,
            _timeout: Duration,
            sink: &LeaseSink,
        ) -> std::result::Result<FetchStats, LeaseError> {
            let a = range.start().octets()[0];
            if a == 6 {
                return Err(LeaseError::Pipe("broken".to_string()));
            }
            let ip = format!("{a}.0.0.5");
            let record = LeaseRecord::new(&ip, "AABBCCDDEEFF").unwrap();
            sink.send(record).await?;
            Ok(FetchStats {
                accepted: 1,
                skipped: 0,
            })
        }
    }

    fn range(a: u8) -> IpRange {
        IpRange::new(Ipv4Addr::new(a, 0, 0, 0), Ipv4Addr::new(a, 0, 0, 255)).unwrap()
    }

    fn test_config(dir: &tempfile::TempDir, ranges: Vec<IpRange>) -> IpmapsConfig {
        let packages = dir.path().join("package_maps.csv");
        std::fs::write(&packages, "0,1\n3,30\n").unwrap();
        IpmapsConfig {
            template_to_package_file: packages.to_string_lossy().into_owned(),
            network_leases: ranges,
            ..Default::default()
        }
    }

    fn resolution() -> TemplateResolution {
        TemplateResolution {
            templates: CmTemplateMap::from([("AABBCCDDEEFF".to_string(), 3)]),
            stats: ResolveStats::default(),
        }
    }

    #[tokio::test]
    async fn test_collect_combines_maps() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, vec![range(8), range(7), range(6)]);

        let maps = collect(&config, Arc::new(StaticSource), async { Ok(resolution()) })
            .await
            .unwrap();

        assert_eq!(maps.leases.ips("AABBCCDDEEFF").count(), 2);
        assert_eq!(maps.templates.get("AABBCCDDEEFF"), Some(&3));
        assert_eq!(maps.packages.get(&3), Some(&30));
        assert_eq!(maps.range_failures.len(), 1);
        assert_eq!(maps.range_failures[0].range, range(6));
    }

    #[tokio::test]
    async fn test_directory_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, vec![range(8)]);

        let err = collect(&config, Arc::new(StaticSource), async {
            Err(DirectoryError::Bind {
                bind_dn: "cn=reader".to_string(),
                reason: "invalid credentials".to_string(),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, CollectError::Directory(DirectoryError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_all_ranges_failed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, vec![range(6)]);

        let err = collect(&config, Arc::new(StaticSource), async { Ok(resolution()) })
            .await
            .unwrap_err();

        assert!(matches!(err, CollectError::NoLeaseData { failed: 1 }));
    }

    #[tokio::test]
    async fn test_missing_package_map_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = IpmapsConfig {
            template_to_package_file: dir.path().join("absent.csv").to_string_lossy().into_owned(),
            ..test_config(&dir, vec![range(8)])
        };

        let err = collect(&config, Arc::new(StaticSource), async { Ok(resolution()) })
            .await
            .unwrap_err();

        assert!(matches!(err, CollectError::Packages(_)));
    }
}
