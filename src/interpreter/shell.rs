//! Shell interpreter - runs each paragraph with `sh -c`

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::{Completion, FormType, Interpreter, InterpreterContext, InterpreterResult, ResultCode};
use crate::scheduler::SchedulingPolicy;
use crate::{AtelierError, Result};

/// Property bounding one command's run time
pub const COMMAND_TIMEOUT_PROPERTY: &str = "shell.command.timeout.millisecs";
/// Property allowing paragraphs to run concurrently (`true`/`false`)
pub const CONCURRENT_PROPERTY: &str = "shell.concurrent";
/// Property setting concurrency width when concurrent
pub const MAX_CONCURRENCY_PROPERTY: &str = "shell.concurrent.max";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const KEYWORDS: &[&str] = &[
    "case", "do", "done", "echo", "elif", "else", "esac", "export", "fi", "for", "function", "if",
    "in", "then", "until", "while",
];

/// Stdout is streamed to the paragraph output line by line; stderr is
/// returned with the result when the command fails.
pub struct ShellInterpreter {
    timeout: Duration,
    policy: SchedulingPolicy,
    opened: AtomicBool,
}

impl ShellInterpreter {
    pub const CLASS_NAME: &'static str = "sh";

    pub fn new(properties: &HashMap<String, String>) -> Self {
        let timeout = properties
            .get(COMMAND_TIMEOUT_PROPERTY)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);

        let concurrent = properties
            .get(CONCURRENT_PROPERTY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let policy = if concurrent {
            let width = properties
                .get(MAX_CONCURRENCY_PROPERTY)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(10);
            SchedulingPolicy::Parallel(width)
        } else {
            SchedulingPolicy::Fifo
        };

        Self {
            timeout,
            policy,
            opened: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interpreter for ShellInterpreter {
    fn class_name(&self) -> &str {
        Self::CLASS_NAME
    }

    async fn open(&self) -> Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn interpret(&self, script: &str, ctx: &InterpreterContext) -> Result<InterpreterResult> {
        tracing::info!(paragraph = %ctx.paragraph_id, "Running shell command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|e| AtelierError::Interpreter(format!("failed to start sh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AtelierError::Interpreter("no stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AtelierError::Interpreter("no stderr pipe".to_string()))?;

        let out = ctx.out.clone();
        let pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out.write(&line);
                out.write("\n");
            }
        });
        let errors = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let cancel = ctx.cancellation().clone();
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(paragraph = %ctx.paragraph_id, "Shell command timed out after {:?}", self.timeout);
                None
            }
        };

        let Some(status) = status else {
            kill_process_group(&child);
            let _ = child.kill().await;
            let _ = pump.await;
            let stderr = errors.await.unwrap_or_default();
            let reason = if cancel.is_cancelled() {
                "Paragraph received a SIGTERM".to_string()
            } else {
                format!("Paragraph timed out after {} ms", self.timeout.as_millis())
            };
            return Ok(InterpreterResult::error(join_nonempty(&stderr, &reason)));
        };

        let _ = pump.await;
        let stderr = errors.await.unwrap_or_default();

        if status.success() {
            let mut result = InterpreterResult::new(ResultCode::Success);
            if !stderr.trim().is_empty() {
                result.push(super::ResultMessage::text(stderr));
            }
            Ok(result)
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            tracing::info!(paragraph = %ctx.paragraph_id, exit_code = %code, "Shell command failed");
            Ok(InterpreterResult::error(join_nonempty(
                &stderr,
                &format!("ExitValue: {}", code),
            )))
        }
    }

    async fn cancel(&self, ctx: &InterpreterContext) -> Result<()> {
        // The running command watches the job's token and kills its child
        tracing::debug!(paragraph = %ctx.paragraph_id, "Shell cancel requested");
        Ok(())
    }

    async fn completion(
        &self,
        buffer: &str,
        cursor: usize,
        _ctx: &InterpreterContext,
    ) -> Result<Vec<Completion>> {
        let cursor = cursor.min(buffer.len());
        let head = buffer.get(..cursor).unwrap_or(buffer);
        let word = head
            .rsplit(|c: char| c.is_whitespace() || c == ';' || c == '|')
            .next()
            .unwrap_or("");
        if word.is_empty() {
            return Ok(Vec::new());
        }
        Ok(KEYWORDS
            .iter()
            .filter(|k| k.starts_with(word))
            .map(|k| Completion::new(*k, *k, Some("keyword")))
            .collect())
    }

    fn form_type(&self) -> FormType {
        FormType::Simple
    }

    fn scheduling(&self) -> SchedulingPolicy {
        self.policy
    }
}

/// The command runs in its own process group so its children die with it.
fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: the group was created for this child by process_group(0)
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

fn join_nonempty(first: &str, second: &str) -> String {
    let first = first.trim_end();
    if first.is_empty() {
        second.to_string()
    } else {
        format!("{}\n{}", first, second)
    }
}
