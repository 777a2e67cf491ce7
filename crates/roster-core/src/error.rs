//! Error types for `roster-core`.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{afk::AfkState, membership::{GroupId, UserId}};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error("invalid range: {0}")]
  InvalidRange(String),

  #[error("afk window {start} .. {end} overlaps existing entry {existing}")]
  OverlapConflict {
    existing: i64,
    start:    DateTime<Utc>,
    end:      DateTime<Utc>,
  },

  #[error("afk entry not found: {0}")]
  NotFound(i64),

  #[error("user {actor} may not modify afk entries of {owner}")]
  Forbidden { actor: UserId, owner: UserId },

  #[error("afk entry {0} has already expired")]
  AlreadyExpired(i64),

  #[error("afk entry {0} has already ended ({1})")]
  AlreadyEnded(i64, AfkState),

  #[error("afk entry {0} was modified concurrently")]
  ConcurrentUpdate(i64),

  #[error("user {0} has no active afk entry")]
  NoActiveAfk(UserId),

  #[error("afk window of {hours}h exceeds the configured maximum of {max_hours}h")]
  TooLong { hours: i64, max_hours: i64 },

  #[error("user {user} already has an open interval in {group}")]
  AlreadyOpen { user: UserId, group: GroupId },

  #[error("user {user} has no open interval in {group}")]
  NoOpenInterval { user: UserId, group: GroupId },

  #[error("unknown tracked group: {0:?}")]
  UnknownGroup(String),

  #[error("membership snapshot unavailable: {0}")]
  SnapshotUnavailable(String),

  /// Transient backend failure (timeout, busy database, closed connection).
  #[error("store unavailable: {0}")]
  StoreUnavailable(String),

  /// Permanent backend failure; never retried.
  #[error("store error: {0}")]
  Store(String),
}

impl Error {
  /// Only transient store failures are eligible for automatic retry.
  pub fn is_retryable(&self) -> bool { matches!(self, Self::StoreUnavailable(_)) }

  /// Stable snake_case name of the variant, used in API error bodies.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::InvalidRange(_) => "invalid_range",
      Self::OverlapConflict { .. } => "overlap_conflict",
      Self::NotFound(_) => "not_found",
      Self::Forbidden { .. } => "forbidden",
      Self::AlreadyExpired(_) => "already_expired",
      Self::AlreadyEnded(..) => "already_ended",
      Self::ConcurrentUpdate(_) => "concurrent_update",
      Self::NoActiveAfk(_) => "no_active_afk",
      Self::TooLong { .. } => "too_long",
      Self::AlreadyOpen { .. } => "already_open",
      Self::NoOpenInterval { .. } => "no_open_interval",
      Self::UnknownGroup(_) => "unknown_group",
      Self::SnapshotUnavailable(_) => "snapshot_unavailable",
      Self::StoreUnavailable(_) => "store_unavailable",
      Self::Store(_) => "store",
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
