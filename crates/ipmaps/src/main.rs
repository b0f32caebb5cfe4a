//! CLI entry point for the ipmaps subscriber report generator.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use ipmaps::collect;
use ipmaps::config::{IpmapsConfig, DEFAULT_CONFIG_FILE, DEFAULT_CONFIG_PREFIX};
use ipmaps::report::write_report;

#[derive(Parser)]
#[command(name = "ipmaps")]
#[command(about = "Generate the subscriber to CPE IP mapping file")]
struct Cli {
    /// Config file prefix (default: ipmaps_config).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PREFIX)]
    config: String,

    /// Output file, overriding `output_file` from the config.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Debug logging, on top of `verbose` in the config.
    #[arg(short, long)]
    verbose: bool,

    /// Write a template config to ipmaps_config.json and exit.
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.init_config {
        IpmapsConfig::sample().write_json(DEFAULT_CONFIG_FILE)?;
        println!("Template config written to {DEFAULT_CONFIG_FILE}");
        return Ok(());
    }

    let config = IpmapsConfig::load(&cli.config)?;
    init_logging(&config, cli.verbose)?;

    for (first, second) in config.overlapping_ranges() {
        tracing::warn!(
            first = %first,
            second = %second,
            "Overlapping lease ranges, leases in the overlap are reported twice"
        );
    }

    let started = Instant::now();
    let maps = match collect::run(&config).await {
        Ok(maps) => maps,
        Err(e) => {
            tracing::error!(error = %e, "Collection failed, no report written");
            return Err(e.into());
        }
    };

    let output = cli
        .output
        .unwrap_or_else(|| PathBuf::from(&config.output_file));
    let report = write_report(&output, &maps.leases, &maps.templates, &maps.packages)?;

    tracing::info!(
        run_id = %maps.run_id,
        template_packages = maps.packages.len(),
        cm_templates = maps.templates.len(),
        cm_cpe = maps.leases.len(),
        default_package = report.default_package,
        missing_template = report.missing_template,
        failed_ranges = maps.range_failures.len(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Run complete"
    );

    Ok(())
}

/// JSON logs to stderr, or appended to `log_file` when configured.
fn init_logging(config: &IpmapsConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level(verbose)));
    let builder = fmt().with_env_filter(filter).json();

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}
