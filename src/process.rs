//! External command execution.
//!
//! Every external tool the pipeline drives goes through [`Cmd`]: the argv is
//! logged before launch, `eatmydata` is prefixed where requested and
//! available on the host, and a nonzero exit becomes a typed error naming
//! the tool and its status. Calls block until the child exits; the tools are
//! expected to write their own diagnostics to stderr, which stays inherited.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::error::{BuildError, Result};

static EATMYDATA: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Path to `eatmydata` when the host has it.
fn eatmydata() -> Option<&'static Path> {
    EATMYDATA
        .get_or_init(|| which::which("eatmydata").ok())
        .as_deref()
}

/// One external tool invocation.
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    eatmydata: bool,
    nice: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            eatmydata: false,
            nice: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Run under `eatmydata` when the host has it. Used for the fsync-heavy
    /// package operations; pointless for tools like mksquashfs.
    pub fn eatmydata(mut self) -> Self {
        self.eatmydata = true;
        self
    }

    /// Run under `nice`.
    pub fn nice(mut self) -> Self {
        self.nice = true;
        self
    }

    /// Tool name used in error values.
    fn tool(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn command(&self) -> Command {
        let mut argv: Vec<&OsStr> = Vec::new();
        if self.eatmydata {
            if let Some(wrapper) = eatmydata() {
                argv.push(wrapper.as_os_str());
            }
        }
        if self.nice {
            argv.push(OsStr::new("nice"));
        }
        argv.push(&self.program);
        argv.extend(self.args.iter().map(OsString::as_os_str));

        debug!(command = %render(&argv), "run");

        let mut command = Command::new(argv[0]);
        command.args(&argv[1..]);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }

    /// Run to completion with stdout/stderr inherited. Nonzero exit is fatal.
    pub fn run(&self) -> Result<()> {
        let status = self.command().status().map_err(|source| BuildError::ToolSpawn {
            tool: self.tool(),
            source,
        })?;
        if !status.success() {
            return Err(BuildError::ToolFailed {
                tool: self.tool(),
                status,
            });
        }
        Ok(())
    }

    /// Run to completion, tolerating a nonzero exit (logged at warn).
    /// Failing to launch the tool at all is still fatal.
    pub fn run_unchecked(&self) -> Result<()> {
        let status = self.command().status().map_err(|source| BuildError::ToolSpawn {
            tool: self.tool(),
            source,
        })?;
        if !status.success() {
            warn!(tool = %self.tool(), %status, "command failed (ignored)");
        }
        Ok(())
    }

    /// Run with stdout and stderr captured. The exit status is returned to
    /// the caller inside [`Output`] rather than turned into an error, for
    /// tools whose report has to be parsed before judging the run.
    pub fn output(&self) -> Result<Output> {
        self.command()
            .output()
            .map_err(|source| BuildError::ToolSpawn {
                tool: self.tool(),
                source,
            })
    }
}

fn render(argv: &[&OsStr]) -> String {
    argv.iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_succeeds_for_zero_exit() {
        Cmd::new("true").run().unwrap();
    }

    #[test]
    fn run_fails_for_nonzero_exit() {
        let err = Cmd::new("false").run().unwrap_err();
        match err {
            BuildError::ToolFailed { tool, .. } => assert_eq!(tool, "false"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn spawn_failure_names_the_tool() {
        let err = Cmd::new("definitely-not-a-real-command-xyz").run().unwrap_err();
        match err {
            BuildError::ToolSpawn { tool, .. } => {
                assert_eq!(tool, "definitely-not-a-real-command-xyz")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn run_unchecked_tolerates_failure() {
        Cmd::new("false").run_unchecked().unwrap();
    }

    #[test]
    fn output_captures_stdout() {
        let output = Cmd::new("sh").args(["-c", "echo hello"]).output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn env_reaches_the_child() {
        let output = Cmd::new("sh")
            .args(["-c", "printf %s \"$MARKER\""])
            .env("MARKER", "set")
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "set");
    }
}
