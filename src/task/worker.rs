//! Worker lifecycle: subprocess, function, or command execution with
//! cooperative cancel and a forceful-termination grace period.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

use super::descriptor::TaskKind;
use super::registry::FunctionRegistry;
use crate::concurrency::CancelToken;

/// Outcome of one worker run.
pub struct WorkerOutcome {
    pub exit_code: i32,
    pub stderr_tail: String,
}

/// Run one task to completion, or until `cancel` fires.
///
/// Subprocess kinds (`Script`, `Command`) are spawned as child processes and
/// killed on cancel after `grace` has elapsed since the cooperative signal.
/// `Function` tasks run in-process and can only check `cancel` between steps
/// — there is no way to forcibly preempt synchronous in-process work, so the
/// grace period does not apply to them. `functions` resolves the symbolic
/// name against whatever the embedding application has registered; a name
/// with nothing registered is treated as an immediate failure.
pub async fn run(kind: &TaskKind, cancel: CancelToken, grace: Duration, functions: &FunctionRegistry) -> WorkerOutcome {
    match kind {
        TaskKind::Script { path, args } => run_subprocess(path, args, cancel, grace).await,
        TaskKind::Command { program, args } => run_subprocess(program, args, cancel, grace).await,
        TaskKind::Function { name, args } => run_function(name, args, cancel, functions).await,
    }
}

async fn run_subprocess(program: &str, args: &[String], cancel: CancelToken, grace: Duration) -> WorkerOutcome {
    let mut child = match Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            return WorkerOutcome {
                exit_code: -1,
                stderr_tail: format!("failed to spawn: {e}"),
            }
        }
    };

    // Drain stderr on its own task so a chatty child can't block the
    // cancel race below on a full pipe; it naturally finishes once the
    // child exits (or is killed) and closes the pipe.
    let mut stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(s) = stderr.as_mut() {
            let _ = s.read_to_string(&mut buf).await;
        }
        buf
    });

    let exit_code = tokio::select! {
        status = child.wait() => status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1),
        _ = cancel.cancelled() => {
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(grace) => {
                    warn!(program, "grace period elapsed, killing worker");
                    let _ = child.kill().await;
                }
            }
            -1
        }
    };

    let stderr_buf = stderr_task.await.unwrap_or_default();
    WorkerOutcome { exit_code, stderr_tail: tail(&stderr_buf) }
}

async fn run_function(name: &str, args: &[String], cancel: CancelToken, functions: &FunctionRegistry) -> WorkerOutcome {
    let Some(executor) = functions.get(name) else {
        return WorkerOutcome {
            exit_code: 127,
            stderr_tail: format!("no function registered under name `{name}`"),
        };
    };

    tokio::select! {
        _ = cancel.cancelled() => WorkerOutcome {
            exit_code: -1,
            stderr_tail: "cancelled before function ran".to_string(),
        },
        result = executor.call(args, cancel.clone()) => match result {
            Ok(()) => WorkerOutcome { exit_code: 0, stderr_tail: String::new() },
            Err(message) => WorkerOutcome { exit_code: 1, stderr_tail: message },
        },
    }
}

fn tail(s: &str) -> String {
    const MAX: usize = 4096;
    if s.len() <= MAX {
        s.to_string()
    } else {
        s[s.len() - MAX..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_exits_zero() {
        let outcome = run(
            &TaskKind::Command {
                program: "true".into(),
                args: vec![],
            },
            CancelToken::new(),
            Duration::from_secs(1),
            &FunctionRegistry::new(),
        )
        .await;
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit() {
        let outcome = run(
            &TaskKind::Command {
                program: "false".into(),
                args: vec![],
            },
            CancelToken::new(),
            Duration::from_secs(1),
            &FunctionRegistry::new(),
        )
        .await;
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn cancel_before_start_kills_long_sleep() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = run(
            &TaskKind::Command {
                program: "sleep".into(),
                args: vec!["5".into()],
            },
            cancel,
            Duration::from_millis(50),
            &FunctionRegistry::new(),
        )
        .await;
        assert_eq!(outcome.exit_code, -1);
    }

    #[tokio::test]
    async fn unresolved_function_fails() {
        let outcome = run(
            &TaskKind::Function {
                name: "does-not-exist".into(),
                args: vec![],
            },
            CancelToken::new(),
            Duration::from_secs(1),
            &FunctionRegistry::new(),
        )
        .await;
        assert_eq!(outcome.exit_code, 127);
    }

    #[tokio::test]
    async fn registered_function_runs_and_reports_success() {
        struct AlwaysOk;
        #[async_trait::async_trait]
        impl super::super::registry::FunctionExecutor for AlwaysOk {
            async fn call(&self, _args: &[String], _cancel: CancelToken) -> Result<(), String> {
                Ok(())
            }
        }
        let registry = FunctionRegistry::new();
        registry.register("noop", std::sync::Arc::new(AlwaysOk));

        let outcome = run(
            &TaskKind::Function {
                name: "noop".into(),
                args: vec![],
            },
            CancelToken::new(),
            Duration::from_secs(1),
            &registry,
        )
        .await;
        assert_eq!(outcome.exit_code, 0);
    }
}
