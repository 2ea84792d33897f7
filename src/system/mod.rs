//! Host-level plumbing: privileges and the temporary swap file

pub mod swapfile;

pub use swapfile::SwapFile;

/// Check if running as root
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}
