//! Root SSH key discovery

use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const KEY_TYPE_PREFIXES: &[&str] = &["ssh-", "ecdsa-sha2-", "sk-ssh-", "sk-ecdsa-sha2-"];

/// One public key from an `authorized_keys` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedKey {
    pub algorithm: String,
    pub key_material: String,
    pub comment: Option<String>,
}

impl std::fmt::Display for AuthorizedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.algorithm, self.key_material)?;
        if let Some(comment) = &self.comment {
            write!(f, " {}", comment)?;
        }
        Ok(())
    }
}

fn is_key_type(token: &str) -> bool {
    KEY_TYPE_PREFIXES.iter().any(|p| token.starts_with(p))
}

/// Parse one `authorized_keys` line
///
/// Leading options are dropped and runs of whitespace in the comment collapse
/// to a single space.
pub fn parse_key_line(line: &str) -> Option<AuthorizedKey> {
    let line = line.replace('\r', "");
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let at = tokens.iter().position(|t| is_key_type(t))?;
    let key_material = tokens.get(at + 1)?;
    let comment = tokens[at + 2..].join(" ");

    Some(AuthorizedKey {
        algorithm: tokens[at].to_string(),
        key_material: key_material.to_string(),
        comment: if comment.is_empty() { None } else { Some(comment) },
    })
}

/// Parse a whole `authorized_keys` file
pub fn parse_authorized_keys(text: &str) -> Vec<AuthorizedKey> {
    text.lines().filter_map(parse_key_line).collect()
}

/// Files searched for keys, highest priority first
pub fn candidate_paths(sudo_user: Option<&str>, home: Option<&str>) -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/root/.ssh/authorized_keys")];
    if let Some(user) = sudo_user.filter(|u| !u.is_empty() && *u != "root") {
        paths.push(Path::new("/home").join(user).join(".ssh/authorized_keys"));
    }
    if let Some(home) = home.filter(|h| !h.is_empty()) {
        let path = Path::new(home).join(".ssh/authorized_keys");
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Keys from the first readable candidate that holds at least one key
pub fn find_authorized_keys<R: CommandRunner + ?Sized>(
    runner: &R,
    sudo_user: Option<&str>,
    home: Option<&str>,
) -> Vec<AuthorizedKey> {
    for path in candidate_paths(sudo_user, home) {
        let Ok(text) = runner.read_to_string(&path) else {
            continue;
        };
        let keys = parse_authorized_keys(&text);
        if !keys.is_empty() {
            log::info!("Using {} SSH key(s) from {}", keys.len(), path.display());
            return keys;
        }
    }

    log::warn!("No authorized SSH keys found; root will not be reachable over SSH");
    Vec::new()
}
