//! Snapshot source backed by an external program (e.g. the terminal-API
//! fetch script). Records are read from the program's stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{parse_records, FetchError, Fetcher, Snapshot};

/// Bytes of stderr kept in error messages.
const STDERR_TAIL: usize = 500;

pub struct CommandFetcher {
    source_id: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    capture_log: Option<PathBuf>,
}

impl CommandFetcher {
    pub fn new(source_id: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            capture_log: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Append the program's stdout/stderr to this file after every call.
    pub fn with_capture_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.capture_log = Some(path.into());
        self
    }

    async fn capture(&self, started: DateTime<Utc>, status: &str, stdout: &[u8], stderr: &[u8]) {
        let Some(path) = &self.capture_log else {
            return;
        };

        let mut text = format!(
            "=== {} source={} program={} status={} ===\n",
            started.to_rfc3339(),
            self.source_id,
            self.program,
            status
        );
        if !stdout.is_empty() {
            text.push_str("--- stdout ---\n");
            text.push_str(&String::from_utf8_lossy(stdout));
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }
        if !stderr.is_empty() {
            text.push_str("--- stderr ---\n");
            text.push_str(&String::from_utf8_lossy(stderr));
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to write collection log");
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for CommandFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, timeout: Duration) -> Result<Snapshot, FetchError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child never outlives this call, including on timeout.
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let started = Utc::now();
        debug!(program = %self.program, args = ?self.args, "spawning fetch command");

        let mut child = cmd.spawn().map_err(|e| {
            FetchError::SourceUnavailable(format!("failed to start '{}': {}", self.program, e))
        })?;

        // Output read before a timeout stays in these buffers.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let waited = tokio::time::timeout(timeout, async {
            let (exit, out, err) = tokio::join!(
                child.wait(),
                drain(stdout_pipe, &mut stdout),
                drain(stderr_pipe, &mut stderr),
            );
            out?;
            err?;
            exit
        })
        .await;

        let exit = match waited {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                return Err(FetchError::SourceUnavailable(format!(
                    "failed to collect output of '{}': {}",
                    self.program, e
                )))
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    debug!(program = %self.program, error = %e, "fetch command already gone");
                }
                self.capture(started, "timeout", &stdout, &stderr).await;
                return Err(FetchError::Timeout(timeout));
            }
        };

        let status = match exit.code() {
            Some(code) => format!("exit={}", code),
            None => "signal".to_string(),
        };
        self.capture(started, &status, &stdout, &stderr).await;

        if !exit.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(FetchError::SourceUnavailable(format!(
                "'{}' failed ({}): {}",
                self.program,
                status,
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }

        let stdout = String::from_utf8_lossy(&stdout);
        let records = parse_records(&stdout)?;
        Ok(Snapshot::new(self.source_id.clone(), Utc::now(), records))
    }
}

/// Read `pipe` to EOF in chunks, appending to `buf` as data arrives.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
