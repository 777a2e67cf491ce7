//! Tracked groups and alias resolution.
//!
//! Groups are defined by deployment configuration and never mutated at
//! runtime. Callers may refer to a group by its id, its role key, its name,
//! or any alias; everything downstream works with the canonical
//! [`TrackedGroup`].

use serde::{Deserialize, Serialize};

use crate::{Error, Result, membership::GroupId};

/// A configured group whose membership is reconciled against a role snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedGroup {
  pub id:      GroupId,
  /// Display name, e.g. "Requiem Sun".
  pub name:    String,
  /// The external role whose holders make up the group.
  pub role_id: String,
  #[serde(default)]
  pub aliases: Vec<String>,
}

impl TrackedGroup {
  fn answers_to(&self, key: &str) -> bool {
    let key = key.trim();
    self.id.as_str() == key
      || self.role_id == key
      || self.name.eq_ignore_ascii_case(key)
      || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(key))
  }
}

/// Read-only lookup over the configured groups.
#[derive(Debug, Clone, Default)]
pub struct GroupRegistry {
  groups: Vec<TrackedGroup>,
}

impl GroupRegistry {
  pub fn new(groups: Vec<TrackedGroup>) -> Self { Self { groups } }

  pub fn all(&self) -> &[TrackedGroup] { &self.groups }

  pub fn get(&self, id: &GroupId) -> Option<&TrackedGroup> {
    self.groups.iter().find(|g| &g.id == id)
  }

  /// Resolve a user-supplied key to its canonical group.
  pub fn resolve(&self, key: &str) -> Result<&TrackedGroup> {
    self
      .groups
      .iter()
      .find(|g| g.answers_to(key))
      .ok_or_else(|| Error::UnknownGroup(key.to_owned()))
  }

  /// Resolve an optional filter; `None` means "all groups".
  pub fn resolve_opt(&self, key: Option<&str>) -> Result<Option<&TrackedGroup>> {
    key.map(|k| self.resolve(k)).transpose()
  }
}
