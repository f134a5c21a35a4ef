//! External process invocation helper.
//!
//! Every external tool this crate runs (isoinfo, file, createrepo_c, dnf)
//! goes through [`Cmd`] so failures surface the exact command line and exit
//! status instead of a bare io error.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Builder for a synchronous external command.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(OsString::from(arg));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for a in args {
            self.args.push(OsString::from(a.as_ref()));
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Message used instead of the generic failure text when the command
    /// exits non-zero.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// A non-zero exit is returned in [`CmdOutput`] instead of being an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Human-readable command line, for error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(&a.to_string_lossy());
        }
        line
    }

    /// Run, capturing stdout and stderr.
    pub fn run(self) -> Result<CmdOutput> {
        let line = self.command_line();
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        let output = command
            .output()
            .with_context(|| format!("failed to spawn '{}'", line))?;
        let result = CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status,
        };
        if !result.success() && !self.allow_fail {
            let detail = match &self.error_msg {
                Some(msg) => msg.clone(),
                None => "command failed".to_string(),
            };
            bail!(
                "{}: '{}' exited with {}\n{}",
                detail,
                line,
                result.status,
                result.stderr.trim_end()
            );
        }
        Ok(result)
    }

    /// Run with stdout redirected to a file (extraction-style usage).
    ///
    /// The file is created (parent directories must already exist); stderr is
    /// still captured for the error message.
    pub fn run_to_file(self, target: &Path) -> Result<()> {
        let line = self.command_line();
        let out = File::create(target)
            .with_context(|| format!("creating output file '{}'", target.display()))?;
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        let output = command
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to spawn '{}'", line))?;
        if !output.status.success() {
            let detail = match &self.error_msg {
                Some(msg) => msg.clone(),
                None => "command failed".to_string(),
            };
            bail!(
                "{}: '{}' exited with {}\n{}",
                detail,
                line,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        Ok(())
    }

    /// Run with inherited stdio (operator sees output as it happens).
    pub fn run_interactive(self) -> Result<()> {
        let line = self.command_line();
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        let status = command
            .status()
            .with_context(|| format!("failed to spawn '{}'", line))?;
        if !status.success() && !self.allow_fail {
            let detail = match &self.error_msg {
                Some(msg) => msg.clone(),
                None => "command failed".to_string(),
            };
            bail!("{}: '{}' exited with {}", detail, line, status);
        }
        Ok(())
    }
}
