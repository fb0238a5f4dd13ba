//! Thin builder-style wrapper over `std::process::Command` for invoking
//! external tools with captured output and contextual errors.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::process::Command;

/// Check if a command exists on the host system.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// An external command invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(|a| a.into()));
        self
    }

    /// Extra hint appended to the failure message (e.g. install instructions).
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Run the command, discarding stdout. Fails if the command cannot be
    /// spawned or exits nonzero.
    pub fn run(self) -> Result<()> {
        self.capture().map(|_| ())
    }

    /// Run the command and return its trimmed stdout. Fails if the command
    /// cannot be spawned or exits nonzero; stderr is folded into the error.
    pub fn capture(self) -> Result<String> {
        let rendered = self.rendered();
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("running `{rendered}`"))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let hint = match &self.error_msg {
            Some(msg) => format!("\n{msg}"),
            None => String::new(),
        };
        bail!(
            "`{}` failed with {}: {}\n{}{}",
            rendered,
            output.status,
            stdout.trim(),
            stderr.trim(),
            hint
        )
    }

    fn rendered(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_stdout() {
        let out = Cmd::new("echo").arg("hello").capture().unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_run_failure_includes_command() {
        let err = Cmd::new("false").run().unwrap_err();
        assert!(err.to_string().contains("false"));
    }

    #[test]
    fn test_spawn_failure_has_context() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_error_msg_hint_appended() {
        let err = Cmd::new("false")
            .error_msg("install: some-package")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("install: some-package"));
    }

    #[test]
    fn test_exists() {
        assert!(exists("ls"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }
}
