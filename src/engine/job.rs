//! The job body: the slow, fallible external operation a task performs once
//! admitted.
//!
//! Job bodies are synchronous and may run for minutes; the worker always
//! calls them on a blocking thread, never on the coordination path. Each
//! call gets the attempt's deadline. A body that can stop early should.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tracing::{debug, info, warn};

/// Output kept per stream; anything beyond is dropped.
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// How often a running command is checked against its deadline.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Runs one task payload to completion and returns where the result landed.
pub trait JobBody: Send + Sync + 'static {
    fn run(&self, payload: &serde_json::Value, deadline: Instant) -> anyhow::Result<String>;
}

/// Plain closures ignore the deadline; the worker still stops waiting on
/// them once it passes.
impl<F> JobBody for F
where
    F: Fn(&serde_json::Value) -> anyhow::Result<String> + Send + Sync + 'static,
{
    fn run(&self, payload: &serde_json::Value, _deadline: Instant) -> anyhow::Result<String> {
        self(payload)
    }
}

/// Runs an external program (the scraper) per task.
///
/// The JSON payload is passed as the last argument and in `SCRAPEQ_PAYLOAD`.
/// Exit status 0 means success; the last non-empty stdout line is the result
/// location. A program still running at the deadline is killed.
#[derive(Debug, Clone)]
pub struct CommandJobBody {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandJobBody {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl JobBody for CommandJobBody {
    fn run(&self, payload: &serde_json::Value, deadline: Instant) -> anyhow::Result<String> {
        let start = Instant::now();
        let payload_json = serde_json::to_string(payload).context("serialize payload")?;

        // Resolve relative program paths against the process CWD, not the
        // job's working directory.
        let program = if self.program.is_relative() && self.program.components().count() > 1 {
            std::env::current_dir()?.join(&self.program)
        } else {
            self.program.clone()
        };

        debug!(program = %program.display(), "running job command");

        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .arg(&payload_json)
            .env("SCRAPEQ_PAYLOAD", &payload_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))?;
        // Drained on their own threads so a chatty child never blocks on a
        // full pipe while we wait on it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_until(&mut child, deadline)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    program = %program.display(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "job command passed its deadline, killed"
                );
                // Reader threads are left to finish on their own: a
                // grandchild may still hold the pipes open.
                bail!(
                    "{} killed after running past its deadline ({:.1}s)",
                    program.display(),
                    start.elapsed().as_secs_f64()
                );
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            let tail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            warn!(
                program = %program.display(),
                code = status.code().unwrap_or(-1),
                duration_ms,
                "job command failed"
            );
            bail!(
                "{} exited with status {}: {}",
                program.display(),
                status.code().unwrap_or(-1),
                tail.trim()
            );
        }

        let Some(location) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
            bail!("{} printed no result location", program.display());
        };

        info!(program = %program.display(), duration_ms, result = location, "job command finished");
        Ok(location.to_string())
    }
}

/// Wait for the child to exit. `None` if the deadline came first.
fn wait_until(child: &mut Child, deadline: Instant) -> anyhow::Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait().context("waiting on job command")? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(WAIT_POLL.min(deadline - now));
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|s| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = reader.and_then(|h| h.join().ok()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[test]
    fn closures_are_job_bodies() {
        let body = |payload: &serde_json::Value| -> anyhow::Result<String> {
            Ok(format!("/out/{}", payload["id"].as_str().unwrap_or("none")))
        };
        assert_eq!(body.run(&json!({"id": "a1"}), later()).unwrap(), "/out/a1");
    }

    #[test]
    fn command_result_is_last_stdout_line() {
        let body = CommandJobBody::new("sh")
            .arg("-c")
            .arg("echo scraping; echo /results/out.csv")
            .arg("sh");
        let location = body.run(&json!({"csv_path": "/tmp/in.csv"}), later()).unwrap();
        assert_eq!(location, "/results/out.csv");
    }

    #[test]
    fn command_receives_payload_as_last_argument() {
        let body = CommandJobBody::new("sh").arg("-c").arg("echo \"$1\"").arg("sh");
        let location = body.run(&json!({"csv_path": "/tmp/in.csv"}), later()).unwrap();
        assert_eq!(location, r#"{"csv_path":"/tmp/in.csv"}"#);
    }

    #[test]
    fn command_failure_carries_stderr() {
        let body = CommandJobBody::new("sh")
            .arg("-c")
            .arg("echo 'site unreachable' >&2; exit 3")
            .arg("sh");
        let err = body.run(&json!({"csv_path": "/tmp/in.csv"}), later()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status 3"), "{msg}");
        assert!(msg.contains("site unreachable"), "{msg}");
    }

    #[test]
    fn command_without_output_fails() {
        let body = CommandJobBody::new("true");
        assert!(body.run(&json!({"csv_path": "/tmp/in.csv"}), later()).is_err());
    }

    #[test]
    fn command_past_deadline_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let body = CommandJobBody::new("sh")
            .arg("-c")
            .arg(format!("sleep 1; touch '{}'; echo /r", marker.display()))
            .arg("sh");

        let start = Instant::now();
        let err = body
            .run(&json!({"csv_path": "/tmp/in.csv"}), start + Duration::from_millis(100))
            .unwrap_err();
        assert!(err.to_string().contains("deadline"), "{err}");
        assert!(start.elapsed() < Duration::from_millis(900));

        // Had the shell survived, it would have touched the marker by now.
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }
}
