//! Cache generation naming.
//!
//! A generation is one versioned snapshot of the precache. Its name combines
//! the fixed application prefix with a version token that changes on every
//! deployment; the reaper deletes every generation whose name does not match
//! the current one.

use sha2::{Digest, Sha256};

/// A single cache generation, identified by `"{prefix}-{version}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  prefix: String,
  version: String,
}

impl Generation {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Full cache name, used as the storage key for this generation.
  pub fn name(&self) -> String {
    format!("{}-{}", self.prefix, self.version)
  }
}

/// Build the default version token for a deployment.
///
/// Combines the crate version with a short digest of the precache manifest,
/// so a new app release or a changed asset list rolls the generation while
/// repeated runs of the same build reuse it.
pub fn version_token(app_version: &str, manifest: &[String]) -> String {
  let mut hasher = Sha256::new();
  for path in manifest {
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
  }
  let digest = hex::encode(hasher.finalize());
  format!("{}-{}", app_version, &digest[..8])
}
