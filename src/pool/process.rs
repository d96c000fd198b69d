//! Child-process execution units.
//!
//! Every task runs in a fresh interpreter process inside the unit's private
//! scratch directory. The instrumented plugin is wrapped in a small bootstrap
//! that reads the payload as JSON from stdin and answers with one JSON line
//! on stdout:
//!
//! ```text
//! {"status":"ok","value":...}
//! {"status":"error","kind":"timeout"|"error","message":"..."}
//! ```
//!
//! The process is killed when the hard deadline passes or when the
//! execution future is dropped.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::transform::{GUARD_FN, TIMEOUT_ERROR_CLASS};

use super::task::WorkerTask;
use super::unit::{ExecutionUnit, UnitFactory, UnitOutcome};

/// File the bootstrapped plugin is written to inside the scratch directory.
const SCRIPT_FILE: &str = "entry.js";

/// Default cap on captured stdout/stderr per stream.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Characters of stderr kept in crash reports.
const STDERR_TAIL: usize = 512;

/// Interpreter invoked as `program args... <script>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RuntimeCommand {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: Vec::new(),
        }
    }
}

impl RuntimeCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Wraps an instrumented plugin into a runnable entry script.
///
/// The plugin is evaluated inside a function scope with CommonJS-style
/// `module`/`exports`; its entry point is either a top-level `run`
/// function or `module.exports.run`. The returned value is awaited through
/// the plugin's own budget guard, and a run that exhausted its budget is
/// reported as a timeout even when the plugin swallowed the error.
pub fn bootstrap(source: &str) -> String {
    format!(
        r#"const __sbx_entry = () => {{
  const module = {{ exports: {{}} }};
  return (function (module, exports) {{
{source}
;return {{
    run: typeof run === "function" ? run : (module.exports && module.exports.run) || module.exports,
    guard: typeof {GUARD_FN} === "function" ? {GUARD_FN} : null,
    expired: () => typeof __sbx_expired !== "undefined" && __sbx_expired === true,
  }};
  }})(module, module.exports);
}};

let __sbx_input = "";
process.stdin.setEncoding("utf8");
process.stdin.on("data", (chunk) => {{ __sbx_input += chunk; }});
process.stdin.on("end", async () => {{
  const reply = (body) => {{
    process.stdout.write("\n" + JSON.stringify(body) + "\n", () => process.exit(0));
  }};
  let sandbox = null;
  const expired = () => sandbox !== null && sandbox.expired();
  try {{
    const payload = __sbx_input.length > 0 ? JSON.parse(__sbx_input) : null;
    sandbox = __sbx_entry();
    if (typeof sandbox.run !== "function") {{
      throw new Error("plugin does not export a run function");
    }}
    const result = sandbox.run(payload);
    const value = sandbox.guard ? await sandbox.guard(result, "result") : await result;
    if (expired()) {{
      reply({{ status: "error", kind: "timeout", message: "execution budget exceeded" }});
      return;
    }}
    reply({{ status: "ok", value: value === undefined ? null : value }});
  }} catch (err) {{
    const timeout = expired() || (!!err && err.name === "{TIMEOUT_ERROR_CLASS}");
    const message = err && err.message !== undefined ? String(err.message) : String(err);
    reply({{ status: "error", kind: timeout ? "timeout" : "error", message }});
  }}
}});
"#
    )
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Reply {
    Ok {
        #[serde(default)]
        value: serde_json::Value,
    },
    Error {
        #[serde(default)]
        kind: String,
        #[serde(default)]
        message: String,
    },
}

/// Finds the last stdout line that is a well-formed reply.
fn parse_reply(stdout: &[u8]) -> Option<Reply> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Reply>(line).ok())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL);
    text.chars().skip(skip).collect()
}

fn outcome_from(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> UnitOutcome {
    match parse_reply(stdout) {
        Some(Reply::Ok { value }) => UnitOutcome::Completed(value),
        Some(Reply::Error { kind, .. }) if kind == "timeout" => UnitOutcome::TimedOut,
        Some(Reply::Error { message, .. }) => UnitOutcome::Failed { message },
        None if status.success() => UnitOutcome::Failed {
            message: "plugin exited without a reply".to_string(),
        },
        None => {
            let tail = stderr_tail(stderr);
            let reason = if tail.is_empty() {
                format!("runtime exited with {status}")
            } else {
                format!("runtime exited with {status}: {tail}")
            };
            UnitOutcome::Crashed { reason }
        }
    }
}

/// Reads up to `limit` bytes and discards the rest so the child never
/// blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let Some(mut reader) = reader else {
        return buf;
    };
    let mut limited = (&mut reader).take(limit as u64);
    if limited.read_to_end(&mut buf).await.is_err() {
        return buf;
    }
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    buf
}

/// One isolated interpreter slot.
pub struct ProcessUnit {
    slot: usize,
    runtime: RuntimeCommand,
    scratch: TempDir,
    output_limit: usize,
    executions: u64,
}

impl ProcessUnit {
    pub fn new(slot: usize, runtime: RuntimeCommand) -> Result<Self, PoolError> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("plugin-runner-slot{slot}-"))
            .tempdir()
            .map_err(|e| PoolError::UnitCreation {
                slot,
                reason: e.to_string(),
            })?;
        Ok(Self {
            slot,
            runtime,
            scratch,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            executions: 0,
        })
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn script_path(&self) -> PathBuf {
        self.scratch.path().join(SCRIPT_FILE)
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.runtime.program);
        command
            .args(&self.runtime.args)
            .arg(self.script_path())
            .current_dir(self.scratch.path())
            .env_clear()
            .env("HOME", self.scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
    }
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    async fn execute(&mut self, task: &WorkerTask, deadline: Instant) -> UnitOutcome {
        self.executions += 1;

        let script_path = self.script_path();
        if let Err(e) = tokio::fs::write(&script_path, bootstrap(&task.script.source)).await {
            return UnitOutcome::Crashed {
                reason: format!("failed to write {}: {e}", script_path.display()),
            };
        }
        let payload = match serde_json::to_vec(&task.job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return UnitOutcome::Failed {
                    message: format!("payload is not serializable: {e}"),
                }
            }
        };

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                return UnitOutcome::Crashed {
                    reason: format!("failed to spawn '{}': {e}", self.runtime.program),
                }
            }
        };
        debug!(slot = self.slot, job_id = %task.job.id, pid = ?child.id(), "Spawned runtime");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.output_limit;

        let io = async {
            let write = async move {
                if let Some(mut stdin) = stdin {
                    // A plugin may exit without reading its input.
                    let _ = stdin.write_all(&payload).await;
                    let _ = stdin.shutdown().await;
                }
            };
            let (_, out, err) =
                tokio::join!(write, read_capped(stdout, limit), read_capped(stderr, limit));
            let status = child.wait().await;
            (status, out, err)
        };

        let result = tokio::time::timeout_at(deadline, io).await;
        match result {
            Ok((Ok(status), out, err)) => outcome_from(status, &out, &err),
            Ok((Err(e), _, _)) => UnitOutcome::Crashed {
                reason: format!("failed to wait for runtime: {e}"),
            },
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(slot = self.slot, error = %e, "Failed to kill runtime after deadline");
                }
                UnitOutcome::TimedOut
            }
        }
    }

    async fn shutdown(&mut self) {
        debug!(slot = self.slot, executions = self.executions, "Discarding process unit");
    }
}

/// Creates [`ProcessUnit`]s running the configured interpreter.
#[derive(Debug, Clone, Default)]
pub struct ProcessUnitFactory {
    runtime: RuntimeCommand,
    output_limit: Option<usize>,
}

impl ProcessUnitFactory {
    pub fn new(runtime: RuntimeCommand) -> Self {
        Self {
            runtime,
            output_limit: None,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = Some(limit);
        self
    }

    pub fn runtime(&self) -> &RuntimeCommand {
        &self.runtime
    }
}

impl UnitFactory for ProcessUnitFactory {
    fn create(&self, slot: usize) -> Result<Box<dyn ExecutionUnit>, PoolError> {
        let mut unit = ProcessUnit::new(slot, self.runtime.clone())?;
        if let Some(limit) = self.output_limit {
            unit = unit.with_output_limit(limit);
        }
        Ok(Box::new(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Job, JobStatus};
    use crate::transform::CodeTransformer;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn task(source: &str, budget: Duration) -> WorkerTask {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            queue: "default".into(),
            task_kind: "test".into(),
            payload: serde_json::json!({"n": 3}),
            status: JobStatus::Claimed,
            attempts: 0,
            max_attempts: 3,
            scheduled_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
            claimed_at: Some(now),
            finished_at: None,
        };
        let script = CodeTransformer::new(budget).compile(source).expect("compile");
        WorkerTask::new(job, Arc::new(script))
    }

    /// A `sh` runtime: the script path arrives as `$0` and is ignored.
    fn shell_unit(script: &str) -> ProcessUnit {
        let runtime = RuntimeCommand::new("sh").with_args(["-c", script]);
        ProcessUnit::new(0, runtime).unwrap()
    }

    fn deadline(after: Duration) -> Instant {
        Instant::now() + after
    }

    #[test]
    fn test_parse_reply_picks_last_reply_line() {
        let out = b"log line\n{\"not\":\"a reply\"}\n\n{\"status\":\"ok\",\"value\":42}\n";
        assert!(matches!(
            parse_reply(out),
            Some(Reply::Ok { value }) if value == serde_json::json!(42)
        ));
        assert!(parse_reply(b"nothing here\n").is_none());
    }

    #[test]
    fn test_bootstrap_embeds_source() {
        let script = bootstrap("function run(p) { return p; }");
        assert!(script.contains("function run(p) { return p; }"));
        assert!(script.contains("ExecutionTimeoutError"));
        assert!(script.contains("process.stdin.on(\"end\""));
        assert!(script.contains("await sandbox.guard(result, \"result\")"));
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let long = "x".repeat(STDERR_TAIL * 2);
        assert_eq!(stderr_tail(long.as_bytes()).len(), STDERR_TAIL);
    }

    #[tokio::test]
    async fn test_ok_reply_completes() {
        let mut unit = shell_unit(r#"printf '\n{"status":"ok","value":{"n":3}}\n'"#);
        let outcome = unit
            .execute(&task("", Duration::from_secs(5)), deadline(Duration::from_secs(5)))
            .await;
        assert_eq!(outcome, UnitOutcome::Completed(serde_json::json!({"n": 3})));
        assert!(unit.script_path().exists());
        assert_eq!(unit.executions(), 1);
    }

    #[tokio::test]
    async fn test_error_replies() {
        let mut unit =
            shell_unit(r#"printf '{"status":"error","kind":"error","message":"boom"}\n'"#);
        let outcome = unit
            .execute(&task("", Duration::from_secs(5)), deadline(Duration::from_secs(5)))
            .await;
        assert_eq!(outcome, UnitOutcome::Failed { message: "boom".into() });

        let mut unit =
            shell_unit(r#"printf '{"status":"error","kind":"timeout","message":"late"}\n'"#);
        let outcome = unit
            .execute(&task("", Duration::from_secs(5)), deadline(Duration::from_secs(5)))
            .await;
        assert_eq!(outcome, UnitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_reply_is_crash() {
        let mut unit = shell_unit("echo 'out of memory' >&2; exit 3");
        let outcome = unit
            .execute(&task("", Duration::from_secs(5)), deadline(Duration::from_secs(5)))
            .await;
        match outcome {
            UnitOutcome::Crashed { reason } => assert!(reason.contains("out of memory")),
            other => panic!("expected crash, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_exit_without_reply_is_failure() {
        let mut unit = shell_unit("exit 0");
        let outcome = unit
            .execute(&task("", Duration::from_secs(5)), deadline(Duration::from_secs(5)))
            .await;
        assert!(matches!(outcome, UnitOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_runaway_process_is_killed_at_deadline() {
        let mut unit = shell_unit("while :; do :; done");
        let started = std::time::Instant::now();
        let outcome = unit
            .execute(&task("", Duration::from_millis(50)), deadline(Duration::from_millis(100)))
            .await;
        assert_eq!(outcome, UnitOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_missing_program_is_crash() {
        let runtime = RuntimeCommand::new("plugin-runner-no-such-runtime");
        let mut unit = ProcessUnit::new(0, runtime).unwrap();
        let outcome = unit
            .execute(&task("", Duration::from_secs(1)), deadline(Duration::from_secs(1)))
            .await;
        assert!(matches!(outcome, UnitOutcome::Crashed { .. }));
    }

    #[test]
    fn test_factory_creates_separate_scratch_dirs() {
        let factory = ProcessUnitFactory::new(RuntimeCommand::new("sh"));
        let a = ProcessUnit::new(0, factory.runtime().clone()).unwrap();
        let b = ProcessUnit::new(1, factory.runtime().clone()).unwrap();
        assert_ne!(a.script_path(), b.script_path());
        assert!(factory.create(2).is_ok());
    }

    #[tokio::test]
    #[ignore = "requires node on PATH"]
    async fn test_node_instrumented_loop_times_out() {
        let mut unit = ProcessUnit::new(0, RuntimeCommand::default()).unwrap();
        let budget = Duration::from_millis(50);
        let started = std::time::Instant::now();
        let outcome = unit
            .execute(
                &task("function run() { while (true) {} }", budget),
                deadline(Duration::from_secs(5)),
            )
            .await;
        assert_eq!(outcome, UnitOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    #[ignore = "requires node on PATH"]
    async fn test_node_runs_plugin() {
        let mut unit = ProcessUnit::new(0, RuntimeCommand::default()).unwrap();
        let outcome = unit
            .execute(
                &task("async function run(p) { return p.n * 2; }", Duration::from_secs(1)),
                deadline(Duration::from_secs(5)),
            )
            .await;
        assert_eq!(outcome, UnitOutcome::Completed(serde_json::json!(6)));
    }
}
