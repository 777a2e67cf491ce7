//! The storage traits implemented by backends (e.g. `roster-store-sqlite`).
//!
//! Engines in this crate and the API layer depend on these abstractions, not
//! on any concrete backend. Every method takes the current time from its
//! caller rather than reading a clock, so behaviour is reproducible.
//!
//! All methods return `Send` futures so the traits can be used in
//! multi-threaded async runtimes (e.g. tokio with `axum`).

use std::{
  collections::{HashMap, HashSet},
  future::Future,
};

use chrono::{DateTime, Utc};

use crate::{
  afk::{AfkEntry, NewAfkEntry},
  membership::{GroupId, MemberProfile, MembershipInterval, UserId},
};

// ─── AFK entries ─────────────────────────────────────────────────────────────

/// Persistence for AFK entries.
///
/// Entries are never hard-deleted. Each mutating method is a single atomic
/// write so concurrent commands on the same entry cannot lose updates.
pub trait AfkStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static + Into<crate::Error>;

  /// Persist a new entry. Fails with `InvalidRange` if `start_at >= end_at`
  /// and with `OverlapConflict` if a live entry of the same owner (see
  /// [`AfkStore::overlapping_afk`]) intersects the window at `at`. The check
  /// and the insert are one transaction, so a replayed create cannot
  /// duplicate an entry.
  fn create_afk(
    &self,
    input: NewAfkEntry,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<AfkEntry, Self::Error>> + Send + '_;

  /// Retrieve an entry by id, deleted or not.
  fn get_afk(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<AfkEntry>, Self::Error>> + Send + '_;

  /// Compare-and-set `end_at` from `from` to `to`. An entry already at `to`
  /// is returned unchanged, so replaying the call is harmless. Fails with
  /// `NotFound` for an unknown id and `ConcurrentUpdate` when `end_at` is
  /// neither value.
  fn extend_afk(
    &self,
    id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
  ) -> impl Future<Output = Result<AfkEntry, Self::Error>> + Send + '_;

  /// End an entry early: `is_active = false`, `ended_at = at`, and `end_at`
  /// pulled back to `at` if the window had already started. Idempotent on an
  /// entry that has already ended.
  fn end_afk_now(
    &self,
    id: i64,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<AfkEntry, Self::Error>> + Send + '_;

  /// Soft-delete one entry. A second call leaves the entry untouched.
  fn soft_delete_afk(
    &self,
    id: i64,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<AfkEntry, Self::Error>> + Send + '_;

  /// Soft-delete every not-yet-deleted entry of `owner`; returns how many
  /// entries changed.
  fn soft_delete_all_afk<'a>(
    &'a self,
    owner: &'a UserId,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

  /// Entries flagged `is_active` and not deleted. Whether each one is
  /// running right now is for the caller to decide.
  fn list_active_afk(
    &self,
  ) -> impl Future<Output = Result<Vec<AfkEntry>, Self::Error>> + Send + '_;

  /// An owner's entries, newest first.
  fn list_afk_for_owner<'a>(
    &'a self,
    owner: &'a UserId,
    include_deleted: bool,
    limit: Option<usize>,
  ) -> impl Future<Output = Result<Vec<AfkEntry>, Self::Error>> + Send + 'a;

  /// Every entry, for statistics.
  fn list_all_afk(
    &self,
    include_deleted: bool,
  ) -> impl Future<Output = Result<Vec<AfkEntry>, Self::Error>> + Send + '_;

  /// The overlap query: `owner`'s entries that are still live at `now`
  /// (not deleted, not ended, `end_at >= now`) and whose window intersects
  /// `[start, end]`, skipping `exclude`.
  fn overlapping_afk<'a>(
    &'a self,
    owner: &'a UserId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    exclude: Option<i64>,
  ) -> impl Future<Output = Result<Vec<AfkEntry>, Self::Error>> + Send + 'a;

  /// Clear `is_active` on entries whose window closed before `now`. Leaves
  /// `ended_at` alone. Returns the number of rows touched.
  fn sweep_expired_afk(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}

// ─── Membership history ──────────────────────────────────────────────────────

/// Append-only membership history.
///
/// At most one open interval exists per (user, group) pair; the backend
/// enforces this with a unique constraint, not only a pre-check.
pub trait MembershipStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static + Into<crate::Error>;

  /// Open an interval at `at`. Fails with `AlreadyOpen` if one is open.
  fn open_interval<'a>(
    &'a self,
    user: &'a UserId,
    group: &'a GroupId,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<MembershipInterval, Self::Error>> + Send + 'a;

  /// Close the open interval at `at`. Fails with `NoOpenInterval` if none.
  fn close_interval<'a>(
    &'a self,
    user: &'a UserId,
    group: &'a GroupId,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<MembershipInterval, Self::Error>> + Send + 'a;

  /// Users with an open interval in `group`.
  fn current_members<'a>(
    &'a self,
    group: &'a GroupId,
  ) -> impl Future<Output = Result<HashSet<UserId>, Self::Error>> + Send + 'a;

  /// Open intervals of `group`, ordered by `joined_at`.
  fn open_intervals<'a>(
    &'a self,
    group: &'a GroupId,
  ) -> impl Future<Output = Result<Vec<MembershipInterval>, Self::Error>> + Send + 'a;

  /// A user's intervals ordered by `joined_at` ascending. With
  /// `include_inactive = false` only open intervals are returned.
  fn history<'a>(
    &'a self,
    user: &'a UserId,
    group: Option<&'a GroupId>,
    include_inactive: bool,
  ) -> impl Future<Output = Result<Vec<MembershipInterval>, Self::Error>> + Send + 'a;

  /// Intervals that joined or left at or after `cutoff`, most recent event
  /// first.
  fn changes_since<'a>(
    &'a self,
    cutoff: DateTime<Utc>,
    group: Option<&'a GroupId>,
  ) -> impl Future<Output = Result<Vec<MembershipInterval>, Self::Error>> + Send + 'a;

  /// Insert or refresh display metadata for a user.
  fn upsert_profile<'a>(
    &'a self,
    profile: &'a MemberProfile,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Profiles for the given users; unknown users are simply absent.
  fn profiles<'a>(
    &'a self,
    users: &'a [UserId],
  ) -> impl Future<Output = Result<HashMap<UserId, MemberProfile>, Self::Error>> + Send + 'a;
}
