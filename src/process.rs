//! External tool invocation.
//!
//! Stages never call `std::process::Command` directly. They describe the
//! invocation as a [`ToolCommand`] and hand it to a [`ProcessRunner`], which
//! lets tests substitute a scripted runner for real binaries.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ExternalToolError;

/// A single synchronous child-process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// File connected to the tool's stdin; null when unset.
    pub stdin: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_path(self, key: impl Into<String>, value: &Path) -> Self {
        self.env(key, value.to_string_lossy().into_owned())
    }

    pub fn stdin_file(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    /// Program plus arguments, for log lines.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Exit status and captured output of a finished tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero or interrupted exit into an [`ExternalToolError`].
    pub fn check(self, command: &ToolCommand) -> Result<ToolOutput, ExternalToolError> {
        match self.code {
            Some(0) => Ok(self),
            Some(code) => Err(ExternalToolError::Failed {
                program: command.program.clone(),
                args: command.args.clone(),
                code,
                stdout: self.stdout,
                stderr: self.stderr,
            }),
            None => Err(ExternalToolError::Interrupted {
                program: command.program.clone(),
                args: command.args.clone(),
                stdout: self.stdout,
                stderr: self.stderr,
            }),
        }
    }
}

/// Capability to run external tools: command, args, working directory in;
/// exit code and captured output out.
pub trait ProcessRunner {
    /// Run the command to completion. Only spawn failures are errors here;
    /// exit status is reported in [`ToolOutput`].
    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ExternalToolError>;

    /// Run and require a zero exit.
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ExternalToolError> {
        self.execute(command)?.check(command)
    }
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for &R {
    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ExternalToolError> {
        (**self).execute(command)
    }
}

/// Runs tools as real child processes, blocking until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ExternalToolError> {
        debug!(command = %command.display(), cwd = ?command.cwd, "running external tool");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(path) = &command.stdin {
            let file = File::open(path).map_err(|source| ExternalToolError::Spawn {
                program: command.program.clone(),
                source,
            })?;
            cmd.stdin(Stdio::from(file));
        }

        let output = cmd.output().map_err(|source| ExternalToolError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %command.program, code = ?result.code, "external tool finished");
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for unit tests.

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    type Effect = Box<dyn Fn(&ToolCommand)>;

    /// Returns queued outputs in order (success once the queue is empty) and
    /// records every command it sees.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        pub(crate) calls: RefCell<Vec<ToolCommand>>,
        outputs: RefCell<VecDeque<ToolOutput>>,
        effect: Option<Effect>,
    }

    impl ScriptedRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn then_exit(self, code: Option<i32>, stderr: &str) -> Self {
            self.outputs.borrow_mut().push_back(ToolOutput {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            });
            self
        }

        /// Side effect applied to every command before it "exits".
        pub(crate) fn with_effect(mut self, effect: impl Fn(&ToolCommand) + 'static) -> Self {
            self.effect = Some(Box::new(effect));
            self
        }

        pub(crate) fn programs(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.program.clone()).collect()
        }
    }

    impl ProcessRunner for ScriptedRunner {
        fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ExternalToolError> {
            self.calls.borrow_mut().push(command.clone());
            if let Some(effect) = &self.effect {
                effect(command);
            }
            Ok(self.outputs.borrow_mut().pop_front().unwrap_or(ToolOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_args_and_env() {
        let cmd = ToolCommand::new("grub-mkrescue")
            .arg("-o")
            .arg_path(Path::new("/tmp/out.iso"))
            .args(["iso"])
            .env("LC_ALL", "C")
            .current_dir(Path::new("/tmp"));

        assert_eq!(cmd.display(), "grub-mkrescue -o /tmp/out.iso iso");
        assert_eq!(cmd.env, vec![("LC_ALL".to_string(), "C".to_string())]);
        assert_eq!(cmd.cwd.as_deref(), Some(Path::new("/tmp")));
    }

    #[test]
    fn check_maps_exit_status() {
        let cmd = ToolCommand::new("false");
        let ok = ToolOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.check(&cmd).is_ok());

        let failed = ToolOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "boom".into(),
        };
        assert!(matches!(
            failed.check(&cmd),
            Err(ExternalToolError::Failed { code: 2, .. })
        ));

        let killed = ToolOutput {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(killed.check(&cmd).unwrap_err().is_interrupted());
    }

    #[test]
    fn system_runner_captures_output() {
        let output = SystemRunner
            .run(&ToolCommand::new("sh").args(["-c", "printf hello; printf oops >&2"]))
            .unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "oops");
    }

    #[test]
    fn system_runner_reports_nonzero_exit() {
        let err = SystemRunner
            .run(&ToolCommand::new("sh").args(["-c", "exit 7"]))
            .unwrap_err();
        assert!(matches!(err, ExternalToolError::Failed { code: 7, .. }));
    }

    #[test]
    fn system_runner_feeds_stdin_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let input = temp.path().join("list");
        std::fs::write(&input, "bin\0etc\0").unwrap();

        let output = SystemRunner
            .run(&ToolCommand::new("cat").stdin_file(&input))
            .unwrap();
        assert_eq!(output.stdout, "bin\0etc\0");
    }

    #[test]
    fn system_runner_reports_missing_binary() {
        let err = SystemRunner
            .execute(&ToolCommand::new("definitely_not_a_real_command_12345"))
            .unwrap_err();
        assert!(matches!(err, ExternalToolError::Spawn { .. }));
    }
}
