//! Template to package map file.
//!
//! Plain CSV, two fields per row: `template, package`. Lines starting with
//! `#` are comments. Template `0` is the default package row.

use std::path::{Path, PathBuf};

use ipmaps_core::{PackageId, TemplateId, TemplatePackageMap};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackageMapError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected 2 fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("Line {line}: {value:?} is not a valid identifier")]
    InvalidNumber { line: usize, value: String },

    #[error("Line {line}: duplicate template {template}")]
    DuplicateTemplate { line: usize, template: TemplateId },
}

/// Read and parse the package map file.
pub async fn read_template_packages(
    path: impl AsRef<Path>,
) -> Result<TemplatePackageMap, PackageMapError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PackageMapError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let packages = parse_template_packages(&text)?;
    tracing::info!(path = %path.display(), packages = packages.len(), "Package map loaded");
    Ok(packages)
}

pub fn parse_template_packages(text: &str) -> Result<TemplatePackageMap, PackageMapError> {
    let mut packages = TemplatePackageMap::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        if raw.trim().is_empty() || raw.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        if fields.len() != 2 {
            return Err(PackageMapError::FieldCount {
                line,
                found: fields.len(),
            });
        }

        let template: TemplateId = parse_id(fields[0], line)?;
        let package: PackageId = parse_id(fields[1], line)?;

        if packages.insert(template, package).is_some() {
            return Err(PackageMapError::DuplicateTemplate { line, template });
        }
    }

    Ok(packages)
}

fn parse_id(value: &str, line: usize) -> Result<u32, PackageMapError> {
    value.parse().map_err(|_| PackageMapError::InvalidNumber {
        line,
        value: value.to_string(),
    })
}
