//! External command execution for CLI-backed providers.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{Error, Result};

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs a program and captures its output. Providers never spawn processes
/// directly, so tests can substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Like [`run`](Self::run), with `input` fed to the program's stdin.
    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> Result<CommandOutput>;
}

fn spawn_error(program: &str, e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotFound => Error::MissingTool(program.to_string()),
        _ => Error::Io(e),
    }
}

fn captured(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program, args = ?args, "exec");

        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(program, e))?;

        Ok(captured(output))
    }

    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> Result<CommandOutput> {
        debug!(program, args = ?args, input_bytes = input.len(), "exec with stdin");

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("child stdin not captured")))?;
        let feed = async move {
            let written = stdin.write_all(input.as_bytes()).await;
            // Closing stdin signals end of input.
            drop(stdin);
            written
        };

        let (written, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if let Err(e) = written {
            // A program that exits early closes the pipe; its status says why.
            debug!(program, error = %e, "stdin not fully consumed");
        }
        Ok(captured(output))
    }
}

/// Locate `program` on `PATH`.
pub fn find_tool(program: impl AsRef<OsStr>) -> Option<PathBuf> {
    let program = program.as_ref();
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Fail with [`Error::MissingTool`] unless `program` is on `PATH`.
pub fn require_tool(program: &str) -> Result<PathBuf> {
    find_tool(program).ok_or_else(|| Error::MissingTool(program.to_string()))
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays canned outputs. A rule matches when its needle appears in the
    /// space-joined argument list; its last output repeats once the queue
    /// is down to one. Unmatched commands fail with exit code 127.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        rules: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
        calls: Mutex<Vec<String>>,
        inputs: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn on(self, needle: &str, outputs: Vec<CommandOutput>) -> Self {
            self.rules
                .lock()
                .unwrap()
                .push((needle.to_string(), outputs.into_iter().collect()));
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn called(&self, needle: &str) -> bool {
            self.calls().iter().any(|c| c.contains(needle))
        }

        pub(crate) fn position(&self, needle: &str) -> Option<usize> {
            self.calls().iter().position(|c| c.contains(needle))
        }

        /// Everything fed to stdin, in call order.
        pub(crate) fn inputs(&self) -> Vec<String> {
            self.inputs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let line = format!("{program} {}", args.join(" "));
            self.calls.lock().unwrap().push(line.clone());

            let mut rules = self.rules.lock().unwrap();
            for (needle, outputs) in rules.iter_mut() {
                if line.contains(needle.as_str()) {
                    let out = if outputs.len() > 1 {
                        outputs.pop_front()
                    } else {
                        outputs.front().cloned()
                    };
                    return Ok(out.unwrap_or_default());
                }
            }
            Ok(CommandOutput::failed(127, format!("unscripted command: {line}")))
        }

        async fn run_with_input(
            &self,
            program: &str,
            args: &[String],
            input: &str,
        ) -> Result<CommandOutput> {
            self.inputs.lock().unwrap().push(input.to_string());
            self.run(program, args).await
        }
    }
}
