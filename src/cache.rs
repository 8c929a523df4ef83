use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::CacheRebuild;

const OUTPUT_TAIL_CHARS: usize = 4000;

/// Outcome of the post-sync cache rebuild, included verbatim in the run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRebuildReport {
    pub attempted: bool,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
}

impl CacheRebuildReport {
    fn failed(reason: &str, error: Option<String>) -> Self {
        Self {
            attempted: true,
            ok: false,
            reason: Some(reason.to_string()),
            error,
            ..Self::default()
        }
    }
}

/// Last `limit` characters of `s`, prefixed with `…` when cut.
fn tail(s: &str, limit: usize) -> String {
    let count = s.chars().count();
    if count <= limit {
        return s.to_string();
    }
    let mut out = String::from("…");
    out.extend(s.chars().skip(count - limit.saturating_sub(1)));
    out
}

/// Runs the storefront cache rebuild command after a successful sync.
#[derive(Debug, Clone)]
pub struct CacheRebuilder {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl CacheRebuilder {
    pub fn from_config(cfg: &CacheRebuild) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            working_dir: cfg.working_dir.as_ref().map(PathBuf::from),
            timeout: Duration::from_secs(cfg.timeout_seconds.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Never fails; problems are described in the report.
    pub async fn run(&self) -> CacheRebuildReport {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        info!(program = %self.program, args = ?self.args, "rebuilding albums cache");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                warn!(timeout_s = self.timeout.as_secs(), "albums cache rebuild timed out");
                return CacheRebuildReport::failed("timeout", None);
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(program = %self.program, "albums cache rebuild program not found");
                return CacheRebuildReport::failed("program_not_found", Some(err.to_string()));
            }
            Ok(Err(err)) => {
                warn!(error = %err, "albums cache rebuild could not start");
                return CacheRebuildReport::failed("exception", Some(err.to_string()));
            }
            Ok(Ok(output)) => output,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            combined.push('\n');
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        let ok = output.status.success();
        if ok {
            info!("albums cache rebuilt");
        } else {
            warn!(status = %output.status, "albums cache rebuild failed");
        }
        CacheRebuildReport {
            attempted: true,
            ok,
            exit_code: output.status.code(),
            output_tail: Some(tail(combined.trim(), OUTPUT_TAIL_CHARS)),
            ..CacheRebuildReport::default()
        }
    }
}
