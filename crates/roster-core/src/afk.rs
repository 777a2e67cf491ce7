//! AFK entries: scheduled or active "away" windows for a single user.
//!
//! Stored flags (`is_active`, `is_deleted`, `ended_at`) record explicit
//! writes only. Whether an entry is currently running, still upcoming, or has
//! run out is derived from those flags and the current time by
//! [`AfkState::of`]; it is never cached.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::membership::UserId;

// ─── Entry ───────────────────────────────────────────────────────────────────

/// A persisted AFK window. Entries are never hard-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfkEntry {
  /// Store-assigned, monotonic.
  pub id:         i64,
  pub user_id:    UserId,
  pub start_at:   DateTime<Utc>,
  /// Always strictly after `start_at`.
  pub end_at:     DateTime<Utc>,
  pub reason:     String,
  pub is_active:  bool,
  pub is_deleted: bool,
  pub created_at: DateTime<Utc>,
  /// Set on early return or soft deletion.
  pub ended_at:   Option<DateTime<Utc>>,
}

impl AfkEntry {
  pub fn state(&self, now: DateTime<Utc>) -> AfkState { AfkState::of(self, now) }

  /// Closed intersection test against `[start, end]`.
  pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    windows_overlap(self.start_at, self.end_at, start, end)
  }

  pub fn duration(&self) -> chrono::Duration { self.end_at - self.start_at }
}

/// Input to [`crate::store::AfkStore::create_afk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAfkEntry {
  pub user_id:  UserId,
  pub start_at: DateTime<Utc>,
  pub end_at:   DateTime<Utc>,
  pub reason:   String,
}

/// Two windows overlap when they share any instant. Both ends are inclusive,
/// matching [`AfkState::Active`], so windows that touch do conflict.
pub fn windows_overlap(
  a_start: DateTime<Utc>,
  a_end: DateTime<Utc>,
  b_start: DateTime<Utc>,
  b_end: DateTime<Utc>,
) -> bool {
  a_start <= b_end && b_start <= a_end
}

/// Whether `t` falls in years 0000..=9999, the range whose fixed-width text
/// encoding sorts chronologically.
pub fn is_storable(t: DateTime<Utc>) -> bool { (0..=9999).contains(&t.year()) }

// ─── Derived state ───────────────────────────────────────────────────────────

/// The lifecycle state of an entry at a given instant.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AfkState {
  /// Starts in the future.
  Scheduled,
  /// `start_at <= now <= end_at`.
  Active,
  /// `end_at` has passed without an explicit return.
  Expired,
  /// Ended early by the owner.
  Returned,
  /// Soft-deleted.
  Deleted,
}

impl AfkState {
  pub fn of(entry: &AfkEntry, now: DateTime<Utc>) -> Self {
    if entry.is_deleted {
      Self::Deleted
    } else if entry.ended_at.is_some() {
      Self::Returned
    } else if now > entry.end_at || !entry.is_active {
      Self::Expired
    } else if now < entry.start_at {
      Self::Scheduled
    } else {
      Self::Active
    }
  }

  /// `Scheduled` and `Active` entries can still be extended, returned from,
  /// and conflict with new windows.
  pub fn is_live(self) -> bool { matches!(self, Self::Scheduled | Self::Active) }

  pub fn is_terminal(self) -> bool { !self.is_live() }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
