//! Lease-query tool wrapper.
//!
//! Runs the lease tool as a child process via `tokio::process::Command`,
//! feeds it one `list lease` query for an IP range on stdin, and streams
//! the CSV rows it prints back to the caller as they arrive.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ipmaps_core::{IpRange, LeaseRecord};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::IpcliConfig;

/// Query template sent on the tool's stdin, followed by the range bounds.
pub const LIST_LEASES: &str = r#"list lease ip "remote id" iprange"#;

/// Failures of a single range query. None of them affect other ranges.
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Lease tool not found: {path}")]
    ToolUnavailable { path: String },

    #[error("Lease tool pipe error: {0}")]
    Pipe(String),

    #[error("Failed to start lease tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Lease tool exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("Failed waiting for lease tool: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Lease query for {range} timed out after {timeout:?}")]
    Timeout { range: IpRange, timeout: Duration },

    #[error("Lease receiver dropped before the fetch finished")]
    ChannelClosed,

    #[error("Lease fetch task failed: {0}")]
    Task(String),
}

/// Row counts for one range query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub accepted: usize,
    pub skipped: usize,
}

/// Messages on the channel shared by all fetches of one aggregation.
#[derive(Debug)]
pub enum FetchEvent {
    /// A parsed lease from range number `range`.
    Lease { range: usize, record: LeaseRecord },
    /// The fetch for range number `range` returned.
    Finished {
        range: usize,
        result: Result<FetchStats, LeaseError>,
    },
}

/// Sending half of the lease channel, tagged with the range it serves.
#[derive(Debug, Clone)]
pub struct LeaseSink {
    range: usize,
    tx: mpsc::Sender<FetchEvent>,
}

impl LeaseSink {
    pub fn new(range: usize, tx: mpsc::Sender<FetchEvent>) -> Self {
        Self { range, tx }
    }

    /// Emit one parsed lease. Waits while the channel is full.
    pub async fn send(&self, record: LeaseRecord) -> Result<(), LeaseError> {
        self.tx
            .send(FetchEvent::Lease {
                range: self.range,
                record,
            })
            .await
            .map_err(|_| LeaseError::ChannelClosed)
    }

    /// Report the outcome of the fetch. Consumes the sink, so the channel
    /// can close once every fetch has finished.
    pub async fn finish(self, result: Result<FetchStats, LeaseError>) {
        let range = self.range;
        if self
            .tx
            .send(FetchEvent::Finished { range, result })
            .await
            .is_err()
        {
            tracing::debug!(range, "Lease receiver gone, dropping fetch result");
        }
    }
}

/// Anything able to list the leases of one IP range.
#[async_trait]
pub trait LeaseSource: Send + Sync + 'static {
    /// Stream every valid lease of `range` into `sink`, giving up after
    /// `timeout`.
    async fn fetch(
        &self,
        range: &IpRange,
        timeout: Duration,
        sink: &LeaseSink,
    ) -> Result<FetchStats, LeaseError>;
}

/// The `list lease` query line for `range`, newline terminated.
pub fn query_line(range: &IpRange) -> String {
    format!("{LIST_LEASES} {} {}\n", range.start(), range.end())
}

/// Parse one `<ip>,<mac>` output row.
///
/// Rows without exactly two fields, or failing the lease length checks,
/// yield `None`. Surrounding double quotes are stripped from each field.
pub fn parse_lease_row(line: &str) -> Option<LeaseRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = line.split(',');
    let (ip, mac) = (fields.next()?, fields.next()?);
    if fields.next().is_some() {
        return None;
    }
    LeaseRecord::new(unquote(ip), unquote(mac))
}

fn unquote(field: &str) -> &str {
    field
        .strip_prefix('"')
        .and_then(|f| f.strip_suffix('"'))
        .unwrap_or(field)
}

/// Wrapper around the lease-query tool binary.
#[derive(Debug, Clone)]
pub struct IpcliFetcher {
    command: String,
    cluster: String,
    user: String,
    password: String,
    work_dir: Option<PathBuf>,
}

impl IpcliFetcher {
    pub fn new(config: &IpcliConfig) -> Self {
        Self {
            command: config.command.clone(),
            cluster: config.cluster.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            work_dir: config
                .work_dir
                .as_deref()
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Locate the tool binary. A command containing a path separator is used
    /// as given, relative to `work_dir` when set; a bare name is searched on
    /// `PATH`. Relative commands resolve to an absolute path.
    pub fn resolve_command(&self) -> Result<PathBuf, LeaseError> {
        let unavailable = || LeaseError::ToolUnavailable {
            path: self.command.clone(),
        };

        let candidate = Path::new(&self.command);
        if self.command.contains(std::path::MAIN_SEPARATOR) {
            let program = if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                let cwd = std::env::current_dir().map_err(|_| unavailable())?;
                match &self.work_dir {
                    Some(dir) => cwd.join(dir).join(candidate),
                    None => cwd.join(candidate),
                }
            };
            return is_executable(&program)
                .then_some(program)
                .ok_or_else(unavailable);
        }

        let path_var = std::env::var_os("PATH").ok_or_else(unavailable)?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(candidate))
            .find(|p| is_executable(p))
            .ok_or_else(unavailable)
    }

    fn args(&self) -> [&str; 8] {
        [
            "-S",
            &self.cluster,
            "-N",
            &self.user,
            "-P",
            &self.password,
            "-OF",
            "CSV",
        ]
    }
}

#[async_trait]
impl LeaseSource for IpcliFetcher {
    async fn fetch(
        &self,
        range: &IpRange,
        timeout: Duration,
        sink: &LeaseSink,
    ) -> Result<FetchStats, LeaseError> {
        let program = self.resolve_command()?;

        let mut cmd = Command::new(&program);
        cmd.args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(range = %range, program = %program.display(), "Starting lease query");
        let mut child = cmd.spawn().map_err(LeaseError::Spawn)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| LeaseError::Pipe("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LeaseError::Pipe("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LeaseError::Pipe("stderr not captured".to_string()))?;

        let run = async {
            match stdin.write_all(query_line(range).as_bytes()).await {
                Ok(()) => {}
                // The tool may exit before reading its query; its exit status tells why.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(LeaseError::Pipe(e.to_string())),
            }
            drop(stdin);

            let (stats, stderr_text) =
                tokio::try_join!(stream_leases(stdout, range, sink), drain(stderr))?;

            let status = child.wait().await.map_err(LeaseError::Wait)?;
            if !status.success() {
                return Err(LeaseError::Exit {
                    status: status.to_string(),
                    stderr: stderr_text.trim().to_string(),
                });
            }
            Ok::<FetchStats, LeaseError>(stats)
        };

        let outcome = tokio::time::timeout(timeout, run).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(range = %range, error = %e, "Lease tool already exited");
                }
                Err(LeaseError::Timeout {
                    range: *range,
                    timeout,
                })
            }
        }
    }
}

/// Read `<ip>,<mac>` rows until EOF, forwarding valid ones while the tool
/// is still running.
async fn stream_leases<R>(
    stdout: R,
    range: &IpRange,
    sink: &LeaseSink,
) -> Result<FetchStats, LeaseError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut stats = FetchStats::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| LeaseError::Pipe(e.to_string()))?;
        if n == 0 {
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        match parse_lease_row(&line) {
            Some(record) => {
                sink.send(record).await?;
                stats.accepted += 1;
            }
            None => {
                tracing::debug!(range = %range, row = %line.trim_end(), "Skipping malformed lease row");
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

async fn drain<R>(mut stderr: R) -> Result<String, LeaseError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    stderr
        .read_to_end(&mut buf)
        .await
        .map_err(|e| LeaseError::Pipe(e.to_string()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn range(a: u8) -> IpRange {
        IpRange::new(Ipv4Addr::new(a, 0, 0, 0), Ipv4Addr::new(a, 0, 0, 255)).unwrap()
    }

    #[test]
    fn test_query_line() {
        assert_eq!(
            query_line(&range(8)),
            "list lease ip \"remote id\" iprange 8.0.0.0 8.0.0.255\n"
        );
    }

    #[test]
    fn test_parse_lease_row() {
        let rec = parse_lease_row("8.0.0.5,AABBCCDDEEFF").unwrap();
        assert_eq!(rec.ip, "8.0.0.5");
        assert_eq!(rec.mac, "AABBCCDDEEFF");

        let rec = parse_lease_row("\"10.20.30.40\",\"0011223344ff\"\r\n").unwrap();
        assert_eq!(rec.ip, "10.20.30.40");
        assert_eq!(rec.mac, "0011223344FF");
    }

    #[test]
    fn test_parse_lease_row_rejects_bad_shapes() {
        for row in [
            "",
            "8.0.0.5",
            "8.0.0.5,AABBCCDDEEFF,extra",
            "1.2.3.,AABBCCDDEEFF",
            "8.0.0.5,AABBCCDDEE",
            "8.0.0.5,AA:BB:CC:DD:EE:FF",
            "ip,remote id",
        ] {
            assert!(parse_lease_row(row).is_none(), "{row:?}");
        }
    }

    #[test]
    fn test_resolve_missing_command() {
        let fetcher = IpcliFetcher::new(&IpcliConfig {
            command: "/nonexistent/ipcmd".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            fetcher.resolve_command(),
            Err(LeaseError::ToolUnavailable { .. })
        ));

        let fetcher = IpcliFetcher::new(&IpcliConfig {
            command: "ipmaps-no-such-tool".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            fetcher.resolve_command(),
            Err(LeaseError::ToolUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_command_resolves_from_work_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        let tool = dir.path().join("bin").join("ipcmd");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let in_work_dir = IpcliFetcher::new(&IpcliConfig {
            command: "bin/ipcmd".to_string(),
            work_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..Default::default()
        });
        assert_eq!(in_work_dir.resolve_command().unwrap(), tool);

        let without_work_dir = IpcliFetcher::new(&IpcliConfig {
            command: "bin/ipcmd".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            without_work_dir.resolve_command(),
            Err(LeaseError::ToolUnavailable { .. })
        ));
    }

    #[test]
    fn test_timeout_message_keeps_sub_second_precision() {
        let err = LeaseError::Timeout {
            range: range(8),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "Lease query for 8.0.0.0-8.0.0.255 timed out after 250ms"
        );
    }

    #[tokio::test]
    async fn test_stream_leases_skips_malformed_rows() {
        let output: &[u8] = b"8.0.0.5,AABBCCDDEEFF\nbad row\n\n8.0.0.6,SHORT\n8.0.0.7,001122334455";
        let (tx, mut rx) = mpsc::channel(16);
        let sink = LeaseSink::new(3, tx);

        let stats = stream_leases(output, &range(8), &sink).await.unwrap();
        drop(sink);

        assert_eq!(stats, FetchStats { accepted: 2, skipped: 2 });

        let mut ips = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Lease { range, record } => {
                    assert_eq!(range, 3);
                    ips.push(record.ip);
                }
                FetchEvent::Finished { .. } => panic!("unexpected finish event"),
            }
        }
        assert_eq!(ips, vec!["8.0.0.5", "8.0.0.7"]);
    }
}
