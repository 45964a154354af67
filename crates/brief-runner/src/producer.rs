use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use brief_core::{strip_trailing_line, Digest, ProducerError, QueryContext, Sentiment};
use serde::Deserialize;
use tracing::{debug, warn};

/// The external computation whose output is cached: search, summarize, classify.
pub trait Producer: Send + Sync {
    /// Producers that own outside resources stop them by `deadline` and report
    /// `ProducerError::Timeout`. The orchestrator enforces the deadline for the rest.
    fn produce(&self, ctx: &QueryContext, deadline: Instant) -> Result<Digest, ProducerError>;
}

impl<F> Producer for F
where
    F: Fn(&QueryContext) -> Result<Digest, ProducerError> + Send + Sync,
{
    fn produce(&self, ctx: &QueryContext, _deadline: Instant) -> Result<Digest, ProducerError> {
        self(ctx)
    }
}

/// Exit status a producer command uses to report a transient network failure
/// (`EX_TEMPFAIL`).
pub const EXIT_NETWORK: i32 = 75;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs an external command and reads a JSON digest from its stdout:
///
/// ```json
/// {"summary": "- bullet one\n- bullet two", "sentiment": "positive review"}
/// ```
///
/// The query is passed through `BRIEF_TOPIC`, `BRIEF_QUERY` and `BRIEF_AS_OF`.
pub struct CommandProducer {
    argv: Vec<String>,
    strip_trailing_line: bool,
}

#[derive(Deserialize)]
struct RawDigest {
    summary: String,
    sentiment: String,
}

impl CommandProducer {
    pub fn new(argv: Vec<String>, strip_trailing_line: bool) -> Self {
        Self { argv, strip_trailing_line }
    }

    pub fn parse_output(&self, stdout: &[u8]) -> Result<Digest, ProducerError> {
        let raw: RawDigest =
            serde_json::from_slice(stdout).map_err(|e| ProducerError::Malformed(format!("stdout is not a digest: {e}")))?;
        let summary = if self.strip_trailing_line {
            strip_trailing_line(&raw.summary).to_string()
        } else {
            raw.summary
        };
        let digest = Digest { summary, sentiment: Sentiment::parse_label(&raw.sentiment)? };
        digest.validate()?;
        Ok(digest)
    }
}

impl Producer for CommandProducer {
    fn produce(&self, ctx: &QueryContext, deadline: Instant) -> Result<Digest, ProducerError> {
        let started = Instant::now();
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| ProducerError::Upstream("no producer command configured".into()))?;
        let spawn_err = |e: io::Error| ProducerError::Upstream(format!("spawn {program}: {e}"));
        let io_err = |e: io::Error| ProducerError::Upstream(format!("collect output of {program}: {e}"));

        // output goes to files so a chatty child never blocks on a full pipe
        let mut stdout = tempfile::tempfile().map_err(spawn_err)?;
        let mut stderr = tempfile::tempfile().map_err(spawn_err)?;
        debug!("running producer {} {:?}", program, args);
        let mut child = Command::new(program)
            .args(args)
            .env("BRIEF_TOPIC", &ctx.topic)
            .env("BRIEF_QUERY", &ctx.query)
            .env("BRIEF_AS_OF", ctx.as_of_unix.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone().map_err(spawn_err)?))
            .stderr(Stdio::from(stderr.try_clone().map_err(spawn_err)?))
            .spawn()
            .map_err(spawn_err)?;

        let status = match wait_until(&mut child, deadline).map_err(io_err)? {
            Some(status) => status,
            None => {
                let pid = child.id();
                let _ = child.kill();
                let _ = child.wait();
                warn!("producer {program} (pid {pid}) overran its deadline; killed");
                return Err(ProducerError::Timeout(deadline.saturating_duration_since(started)));
            }
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&read_back(&mut stderr).map_err(io_err)?).trim().to_string();
            return Err(match status.code() {
                Some(EXIT_NETWORK) => ProducerError::Network(stderr),
                _ => ProducerError::Upstream(format!("{program} exited with {status}: {stderr}")),
            });
        }
        self.parse_output(&read_back(&mut stdout).map_err(io_err)?)
    }
}

/// Polls `child` until it exits or `deadline` passes; `None` means it is still running.
fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn read_back(f: &mut File) -> io::Result<Vec<u8>> {
    f.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(buf)
}
