//! External command execution.
//!
//! Every host tool the pipeline drives (losetup, parted, mkfs, mount, xz, ...)
//! is described as a [`Cmd`] and executed through a [`Runner`]. The real
//! [`HostRunner`] spawns processes; tests swap in a recording fake so the
//! pipeline can be exercised without root or block devices.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::BuildError;

/// A host command description: program and arguments plus run options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
    inherit_output: bool,
}

/// Captured result of running a [`Cmd`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status: {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
            inherit_output: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message used as error context when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Non-zero exit is returned as output instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Stream stdout/stderr to the terminal instead of capturing them.
    ///
    /// Used for long-running tools (pacstrap, xz) whose progress output
    /// the operator wants to see.
    pub fn inherit_output(mut self) -> Self {
        self.inherit_output = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn inherits_output(&self) -> bool {
        self.inherit_output
    }

    /// Run through `runner`, turning a non-zero exit into a typed
    /// [`BuildError::ToolInvocation`] unless [`Cmd::allow_fail`] was set.
    pub fn run(&self, runner: &dyn Runner) -> Result<CmdOutput> {
        tracing::debug!("exec: {self}");
        let output = runner
            .execute(self)
            .with_context(|| format!("spawning {}", self.program))?;
        if output.success() || self.allow_fail {
            return Ok(output);
        }

        let err = anyhow::Error::from(BuildError::ToolInvocation {
            program: self.program.clone(),
            status: output.status_text(),
            detail: output.stderr.trim().to_string(),
        });
        Err(match &self.error_msg {
            Some(msg) => err.context(msg.clone()),
            None => err,
        })
    }

    /// Like [`Cmd::run`], but return trimmed stdout.
    pub fn read(&self, runner: &dyn Runner) -> Result<String> {
        Ok(self.run(runner)?.stdout.trim().to_string())
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Executes [`Cmd`]s. Implementations must be shareable across the split
/// image sub-pipelines, which run on separate threads.
pub trait Runner: Send + Sync {
    fn execute(&self, cmd: &Cmd) -> Result<CmdOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let mut command = Command::new(cmd.program());
        command.args(cmd.get_args());
        command.stdin(Stdio::null());
        if cmd.inherits_output() {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let output = command
            .spawn()
            .with_context(|| format!("Failed to run {}", cmd.program()))?
            .wait_with_output()
            .with_context(|| format!("waiting for {}", cmd.program()))?;

        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Check if a command exists on the host `PATH`.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake for [`Runner`].

    use super::*;
    use std::sync::Mutex;

    type Trigger = Box<dyn Fn(&Cmd) + Send + Sync>;

    /// Records every command line and answers from canned replies.
    ///
    /// Replies and failures match on the rendered command line prefix;
    /// unmatched commands succeed with empty output.
    #[derive(Default)]
    pub(crate) struct RecordingRunner {
        log: Mutex<Vec<String>>,
        replies: Vec<(String, String)>,
        failures: Vec<String>,
        triggers: Vec<(String, Trigger)>,
    }

    impl RecordingRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn reply(mut self, prefix: &str, stdout: &str) -> Self {
            self.replies.push((prefix.to_string(), stdout.to_string()));
            self
        }

        pub(crate) fn fail(mut self, prefix: &str) -> Self {
            self.failures.push(prefix.to_string());
            self
        }

        pub(crate) fn on(
            mut self,
            prefix: &str,
            trigger: impl Fn(&Cmd) + Send + Sync + 'static,
        ) -> Self {
            self.triggers.push((prefix.to_string(), Box::new(trigger)));
            self
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.log.lock().map(|log| log.clone()).unwrap_or_default()
        }

        pub(crate) fn position(&self, prefix: &str) -> Option<usize> {
            self.commands().iter().position(|c| c.starts_with(prefix))
        }

        pub(crate) fn ran(&self, prefix: &str) -> bool {
            self.position(prefix).is_some()
        }
    }

    impl Runner for RecordingRunner {
        fn execute(&self, cmd: &Cmd) -> Result<CmdOutput> {
            let line = cmd.to_string();
            self.log.lock().unwrap().push(line.clone());

            for (prefix, trigger) in &self.triggers {
                if line.starts_with(prefix.as_str()) {
                    trigger(cmd);
                }
            }
            if self.failures.iter().any(|p| line.starts_with(p.as_str())) {
                return Ok(CmdOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: format!("simulated failure: {line}"),
                });
            }
            let stdout = self
                .replies
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default();
            Ok(CmdOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            })
        }
    }
}
