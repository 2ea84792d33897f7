//! Swap classification

use crate::error::Result;
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};

/// What the run should do about swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapState {
    /// Swap is active on a persistent block device; referenced by the config
    ExistingDevice { path: String },
    /// No usable swap and a temporary file was not wanted
    Absent,
    /// A temporary swap file must back the install step
    NeedsTemporaryFile,
}

impl SwapState {
    /// Whether the temporary swap file is provisioned and torn down
    pub fn needs_temporary_file(&self) -> bool {
        matches!(self, Self::NeedsTemporaryFile)
    }

    /// The persistent swap device, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::ExistingDevice { path } => Some(path.as_str()),
            _ => None,
        }
    }
}

/// One row of `swapon --show=NAME,TYPE --noheadings --raw`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapArea {
    pub name: String,
    pub kind: String,
}

impl SwapArea {
    /// Backed by a real block device that survives the reboot
    pub fn is_persistent_device(&self) -> bool {
        self.kind == "partition"
            && self.name.starts_with("/dev/")
            && !self.name.starts_with("/dev/zram")
    }
}

/// Parse raw `swapon` output
pub fn parse_swapon(text: &str) -> Vec<SwapArea> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let kind = fields.next().unwrap_or("");
            Some(SwapArea {
                name: name.replace("\\x20", " "),
                kind: kind.to_string(),
            })
        })
        .collect()
}

/// Decides whether the run needs a temporary swap file
pub struct SwapClassifier<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
}

impl<'a, R: CommandRunner + ?Sized> SwapClassifier<'a, R> {
    /// Create a new classifier
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// Active swap areas; a failing query counts as none
    pub fn active_areas(&self) -> Result<Vec<SwapArea>> {
        let output = self
            .runner
            .run("swapon", &["--show=NAME,TYPE", "--noheadings", "--raw"])?;
        if !output.success() {
            log::debug!("swapon query failed: {}", output.stderr.trim());
            return Ok(Vec::new());
        }
        Ok(parse_swapon(&output.stdout))
    }

    /// Classify the host's swap. Read-only.
    pub fn classify(&self, no_swap: bool) -> Result<SwapState> {
        let areas = self.active_areas()?;

        if let Some(area) = areas.iter().find(|a| a.is_persistent_device()) {
            log::info!("Existing swap device {} will be kept", area.name);
            return Ok(SwapState::ExistingDevice {
                path: area.name.clone(),
            });
        }

        if no_swap {
            Ok(SwapState::Absent)
        } else {
            Ok(SwapState::NeedsTemporaryFile)
        }
    }
}
