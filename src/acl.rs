//! Agent-scoped namespace authorization.
//!
//! The workspace is a shared root plus per-agent namespaces under
//! `agents/<agent_id>/`. The ACL file `mem-os-acl.json` enumerates, per
//! agent pattern, the namespaces (workspace-relative path prefixes) the
//! agent may read and write. Patterns are exact ids, trailing-`*` globs, or
//! the bare wildcard `*`; the namespace literal `*` grants the whole tree.
//!
//! Regardless of the file's content, an agent always owns its private
//! namespace. [`AclPolicy::can_write`] is a pure predicate consulted by the
//! apply engine pre-check; retrieval filters the corpus through
//! [`AclPolicy::can_read`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::MemError;

/// One pattern's grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    /// Agent pattern: exact id, `prefix-*` glob, or `*`.
    pub pattern: String,
    /// Readable namespace prefixes.
    #[serde(default)]
    pub read: Vec<String>,
    /// Writable namespace prefixes.
    #[serde(default)]
    pub write: Vec<String>,
}

/// The workspace access policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclPolicy {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub agents: Vec<AclEntry>,
}

fn default_version() -> u32 {
    1
}

impl Default for AclPolicy {
    /// Single-host default: every agent reads and writes the whole tree.
    fn default() -> Self {
        Self {
            version: 1,
            agents: vec![AclEntry {
                pattern: "*".to_string(),
                read: vec!["*".to_string()],
                write: vec!["*".to_string()],
            }],
        }
    }
}

impl AclPolicy {
    /// Load the policy from `mem-os-acl.json`; a missing file yields the
    /// permissive default.
    pub fn load(path: &Path) -> Result<Self, MemError> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| MemError::InvalidAcl(path.to_path_buf(), err.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no acl file, using permissive default");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether `agent` may write the workspace-relative `path`.
    pub fn can_write(&self, agent: &str, path: &Path) -> bool {
        self.granted(agent, path, |entry| &entry.write)
    }

    /// Whether `agent` may read the workspace-relative `path`.
    pub fn can_read(&self, agent: &str, path: &Path) -> bool {
        self.granted(agent, path, |entry| &entry.read)
    }

    /// Union of namespace prefixes visible to `agent`.
    pub fn readable_namespaces(&self, agent: &str) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| pattern_matches(&entry.pattern, agent))
            .flat_map(|entry| entry.read.iter().cloned())
            .collect();
        namespaces.push(format!("agents/{agent}"));
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    fn granted(
        &self,
        agent: &str,
        path: &Path,
        grants: impl Fn(&AclEntry) -> &Vec<String>,
    ) -> bool {
        // Own namespace is always granted.
        if path.starts_with(own_namespace(agent)) {
            return true;
        }
        // Another agent's namespace needs an explicit (non-wildcard) grant.
        let foreign_agent_space = path.starts_with("agents");
        self.agents
            .iter()
            .filter(|entry| pattern_matches(&entry.pattern, agent))
            .flat_map(|entry| grants(entry).iter())
            .any(|namespace| {
                if namespace == "*" {
                    !foreign_agent_space
                } else {
                    path.starts_with(namespace)
                }
            })
    }
}

fn own_namespace(agent: &str) -> PathBuf {
    Path::new("agents").join(agent)
}

/// Exact, trailing-`*` glob, or bare wildcard.
fn pattern_matches(pattern: &str, agent: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => agent.starts_with(prefix),
        None => pattern == agent,
    }
}
