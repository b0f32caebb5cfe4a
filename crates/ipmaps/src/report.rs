//! Subscriber CSV report.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use ipmaps_core::{CmCpeMap, CmTemplateMap, PackageId, TemplatePackageMap};

use crate::error::Result;

/// Template whose package row is used when a modem has no usable template.
pub const DEFAULT_TEMPLATE: u32 = 0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReportStats {
    /// Subscriber lines written.
    pub written: usize,
    /// Modems with leases but no directory template.
    pub missing_template: usize,
    /// Lines that fell back to the default package, including
    /// `missing_template`.
    pub default_package: usize,
}

/// Render the report: a two-line header, then one
/// `<mac>,,<ip[;ip...]>,<package>` line per modem in ascending MAC order.
pub fn render_report<W: Write>(
    out: &mut W,
    leases: &CmCpeMap,
    templates: &CmTemplateMap,
    packages: &TemplatePackageMap,
    generated: DateTime<Utc>,
) -> std::io::Result<ReportStats> {
    let default_package: PackageId = packages.get(&DEFAULT_TEMPLATE).copied().unwrap_or(0);
    let mut stats = ReportStats::default();

    writeln!(
        out,
        "# SCE Subscribers @{}",
        generated.to_rfc3339_opts(SecondsFormat::Secs, true)
    )?;
    writeln!(out, "# CSV line format: subscriber-id, domain, mappings, package-id")?;

    for (mac, ips) in leases.iter() {
        let package = match templates.get(mac) {
            Some(template) => match packages.get(template) {
                Some(package) => *package,
                None => {
                    tracing::warn!(mac, template, "No package for template, using default");
                    stats.default_package += 1;
                    default_package
                }
            },
            None => {
                tracing::warn!(mac, "Modem not found in directory, using default package");
                stats.missing_template += 1;
                stats.default_package += 1;
                default_package
            }
        };

        writeln!(out, "{mac},,{ips},{package}")?;
        stats.written += 1;
    }

    Ok(stats)
}

/// Write the report to `path`, replacing any existing file.
pub fn write_report(
    path: impl AsRef<Path>,
    leases: &CmCpeMap,
    templates: &CmTemplateMap,
    packages: &TemplatePackageMap,
) -> Result<ReportStats> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    let stats = render_report(&mut out, leases, templates, packages, Utc::now())?;
    out.flush()?;

    tracing::info!(
        path = %path.display(),
        written = stats.written,
        default_package = stats.default_package,
        "Subscriber report written"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ipmaps_core::LeaseRecord;

    use super::*;

    fn leases(rows: &[(&str, &str)]) -> CmCpeMap {
        let mut map = CmCpeMap::new();
        for (ip, mac) in rows {
            map.insert(LeaseRecord::new(ip, mac).unwrap());
        }
        map
    }

    fn render(
        leases: &CmCpeMap,
        templates: &CmTemplateMap,
        packages: &TemplatePackageMap,
    ) -> (String, ReportStats) {
        let generated = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let mut buf = Vec::new();
        let stats = render_report(&mut buf, leases, templates, packages, generated).unwrap();
        (String::from_utf8(buf).unwrap(), stats)
    }

    #[test]
    fn test_report_lines_sorted_with_packages() {
        let leases = leases(&[
            ("10.0.0.20", "BBBBBBBBBBBB"),
            ("10.0.0.10", "AAAAAAAAAAAA"),
            ("10.0.0.11", "AAAAAAAAAAAA"),
        ]);
        let templates = CmTemplateMap::from([
            ("AAAAAAAAAAAA".to_string(), 3),
            ("BBBBBBBBBBBB".to_string(), 4),
        ]);
        let packages = TemplatePackageMap::from([(0, 1), (3, 30), (4, 40)]);

        let (text, stats) = render(&leases, &templates, &packages);

        assert_eq!(
            text,
            "# SCE Subscribers @2024-03-01T12:30:00Z\n\
             # CSV line format: subscriber-id, domain, mappings, package-id\n\
             AAAAAAAAAAAA,,10.0.0.10;10.0.0.11,30\n\
             BBBBBBBBBBBB,,10.0.0.20,40\n"
        );
        assert_eq!(
            stats,
            ReportStats {
                written: 2,
                missing_template: 0,
                default_package: 0,
            }
        );
    }

    #[test]
    fn test_default_package_fallbacks() {
        let leases = leases(&[
            ("10.0.0.1", "000000000001"),
            ("10.0.0.2", "000000000002"),
            ("10.0.0.3", "000000000003"),
        ]);
        let templates = CmTemplateMap::from([
            ("000000000001".to_string(), 9),
            ("000000000003".to_string(), 5),
        ]);
        let packages = TemplatePackageMap::from([(0, 77), (5, 55)]);

        let (text, stats) = render(&leases, &templates, &packages);
        let lines: Vec<&str> = text.lines().skip(2).collect();

        assert_eq!(
            lines,
            [
                "000000000001,,10.0.0.1,77",
                "000000000002,,10.0.0.2,77",
                "000000000003,,10.0.0.3,55",
            ]
        );
        assert_eq!(stats.written, 3);
        assert_eq!(stats.missing_template, 1);
        assert_eq!(stats.default_package, 2);
    }

    #[test]
    fn test_default_package_without_row_zero() {
        let leases = leases(&[("10.0.0.1", "000000000001")]);
        let (text, _) = render(&leases, &CmTemplateMap::new(), &TemplatePackageMap::new());
        assert!(text.ends_with("000000000001,,10.0.0.1,0\n"));
    }

    #[test]
    fn test_write_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscribers.csv");
        let leases = leases(&[("8.0.0.5", "AABBCCDDEEFF")]);
        let templates = CmTemplateMap::from([("AABBCCDDEEFF".to_string(), 2)]);
        let packages = TemplatePackageMap::from([(2, 20)]);

        let stats = write_report(&path, &leases, &templates, &packages).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        assert_eq!(stats.written, 1);
        assert!(text.starts_with("# SCE Subscribers @"));
        assert_eq!(text.lines().count(), 3);
        assert_eq!(text.lines().last(), Some("AABBCCDDEEFF,,8.0.0.5,20"));
    }
}
