//! Temporary swap file backing the system build

use crate::error::{Result, TakeoverError};
use crate::runner::CommandRunner;
use bytesize::ByteSize;
use std::path::{Path, PathBuf};

/// Size of the temporary swap file
pub const SWAP_SIZE: ByteSize = ByteSize::gib(1);

/// A swap file under `/tmp`, active between provisioning and teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapFile {
    path: PathBuf,
    size: ByteSize,
}

impl SwapFile {
    /// Fresh randomly named swap file in `/tmp`
    pub fn temporary() -> Self {
        Self::at(format!("/tmp/nixos-takeover.{}.swp", uuid::Uuid::new_v4().simple()))
    }

    /// Swap file at a fixed path
    pub fn at<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            size: SWAP_SIZE,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> ByteSize {
        self.size
    }

    fn path_str(&self) -> Result<&str> {
        self.path.to_str().ok_or_else(|| {
            TakeoverError::config(format!("swap path {} is not UTF-8", self.path.display()))
        })
    }

    /// Allocate, format and enable the swap file
    pub fn provision<R: CommandRunner + ?Sized>(&self, runner: &R) -> Result<()> {
        let path = self.path_str()?;
        let mib = self.size.as_u64() / ByteSize::mib(1).as_u64();
        log::info!("Provisioning {} temporary swap at {}", self.size, path);

        let of = format!("of={}", path);
        let count = format!("count={}", mib);
        runner.execute("dd", &["if=/dev/zero", &of, "bs=1M", &count])?;
        runner.execute("chmod", &["0600", path])?;
        runner.execute("mkswap", &[path])?;
        runner.execute("swapon", &[path])?;
        Ok(())
    }

    /// Disable and delete the swap file. Failures are logged, never raised.
    pub fn teardown<R: CommandRunner + ?Sized>(&self, runner: &R) {
        let path = match self.path_str() {
            Ok(path) => path,
            Err(e) => {
                log::warn!("{}", TakeoverError::best_effort("swap teardown", e));
                return;
            }
        };
        log::info!("Removing temporary swap {}", path);

        if let Err(e) = runner.execute("swapoff", &[path]) {
            log::warn!("{}", TakeoverError::best_effort("swapoff", e));
        }
        if let Err(e) = runner.remove_file(&self.path) {
            log::warn!("{}", TakeoverError::best_effort("remove swap file", e));
        }
    }
}
