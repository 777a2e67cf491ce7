//! Identities and membership history records.
//!
//! Membership intervals are append-only: a row is opened once and closed at
//! most once. The "current members" of a group are exactly the users with an
//! open interval.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// An external user identifier (a Discord snowflake in production).
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for UserId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for UserId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

/// The canonical identifier of a tracked group.
#[derive(
  Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for GroupId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for GroupId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

// ─── Intervals ───────────────────────────────────────────────────────────────

/// One continuous stretch of membership of `user_id` in `group_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipInterval {
  /// Monotonic row id; orders intervals of the same pair.
  pub id:        i64,
  pub user_id:   UserId,
  pub group_id:  GroupId,
  pub joined_at: DateTime<Utc>,
  /// `None` while the membership is still open.
  pub left_at:   Option<DateTime<Utc>>,
}

impl MembershipInterval {
  pub fn is_open(&self) -> bool { self.left_at.is_none() }

  /// The most recent event on this interval (leave if closed, else join).
  pub fn last_event_at(&self) -> DateTime<Utc> {
    self.left_at.unwrap_or(self.joined_at)
  }
}

// ─── Profiles ────────────────────────────────────────────────────────────────

/// Display metadata for a user. Never required for correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
  pub user_id:      UserId,
  pub username:     String,
  pub display_name: Option<String>,
}
