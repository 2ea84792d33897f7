//! Command execution and host filesystem access
//!
//! Every probe and the orchestrator talk to the live system through
//! [`CommandRunner`]. Read-only queries go through [`CommandRunner::run`];
//! anything that changes the host goes through [`CommandRunner::execute`] or
//! the write helpers, which honor dry-run mode.

use crate::error::{Result, TakeoverError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 when terminated by a signal
    pub code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok<S: Into<String>>(stdout: S) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed<S: Into<String>>(code: i32, stderr: S) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command exited successfully
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Convert a failed output into an [`TakeoverError::ExternalToolFailure`]
    pub fn into_result(self, cmd: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(TakeoverError::ExternalToolFailure {
                cmd: cmd.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Render a program and its arguments as a single display string
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The I/O boundary between the engine and the host
pub trait CommandRunner {
    /// Run a read-only query. Non-zero exits are returned, not raised.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command that changes the host. Non-zero exits are raised.
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a long command with inherited stdio so progress stays visible
    fn execute_interactive(&self, program: &str, args: &[&str]) -> Result<()>;

    /// Whether a program can be found on `PATH`
    fn has_command(&self, name: &str) -> bool;

    /// Read a whole file
    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Whether a path exists (symlinks are followed)
    fn exists(&self, path: &Path) -> bool;

    /// Whether a path is itself a symlink
    fn is_symlink(&self, path: &Path) -> bool;

    /// List the entries of a directory
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Resolve symlinks to an absolute path
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Create a directory and its parents
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Write (replace) a file
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Rename a file or symlink
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Remove a file
    fn remove_file(&self, path: &Path) -> Result<()>;
}

/// [`CommandRunner`] backed by the real host
pub struct SystemRunner {
    dry_run: bool,
}

impl SystemRunner {
    /// Create a new runner
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    fn capture(program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        log::debug!("Querying: {}", command_line(program, args));
        Self::capture(program, args)
    }

    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let cmd_str = command_line(program, args);

        if self.dry_run {
            log::info!("[DRY RUN] Would execute: {}", cmd_str);
            return Ok(CommandOutput::default());
        }

        log::debug!("Executing: {}", cmd_str);
        Self::capture(program, args)?.into_result(&cmd_str)
    }

    fn execute_interactive(&self, program: &str, args: &[&str]) -> Result<()> {
        let cmd_str = command_line(program, args);

        if self.dry_run {
            log::info!("[DRY RUN] Would execute: {}", cmd_str);
            return Ok(());
        }

        log::debug!("Executing: {}", cmd_str);
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()?;

        if !status.success() {
            return Err(TakeoverError::ExternalToolFailure {
                cmd: cmd_str,
                code: status.code().unwrap_or(-1),
                stderr: "see output above".to_string(),
            });
        }
        Ok(())
    }

    fn has_command(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path)?)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_symlink(&self, path: &Path) -> bool {
        path.is_symlink()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::canonicalize(path)?)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            log::info!("[DRY RUN] Would create directory: {}", path.display());
            return Ok(());
        }
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if self.dry_run {
            log::info!("[DRY RUN] Would write to: {}", path.display());
            return Ok(());
        }
        fs::write(path, contents)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if self.dry_run {
            log::info!(
                "[DRY RUN] Would move {} to {}",
                from.display(),
                to.display()
            );
            return Ok(());
        }
        fs::rename(from, to)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            log::info!("[DRY RUN] Would remove: {}", path.display());
            return Ok(());
        }
        fs::remove_file(path)?;
        Ok(())
    }
}
