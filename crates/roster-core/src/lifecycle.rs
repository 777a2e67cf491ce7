//! The AFK lifecycle engine.
//!
//! ```text
//!  create ──▶ Scheduled ──(start passes)──▶ Active ──(end passes)──▶ Expired
//!                 │                            │
//!                 └──────── delete ────────────┴──▶ Deleted
//!                                              └── return ──▶ Returned
//! ```
//!
//! Only `create`, `extend`, `return` and `delete` are writes. The move into
//! `Expired` is read off the clock by [`AfkState::of`]. Commands for the
//! same owner are serialized so overlap checks and writes cannot interleave.

use std::sync::Arc;

use chrono::{DateTime, Days, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  afk::{AfkEntry, AfkState, NewAfkEntry, is_storable},
  clock::Clock,
  locks::KeyedLocks,
  membership::UserId,
  retry::retry_once,
  store::AfkStore,
};

// ─── Policy & actors ─────────────────────────────────────────────────────────

/// Deployment policy for AFK windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AfkPolicy {
  /// Upper bound on `end_at - start_at`, checked on create and extend.
  /// `None` leaves the length unbounded.
  pub max_duration: Option<Duration>,
}

/// Who is issuing a lifecycle command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Actor {
  /// A user acting on their own entries.
  User(UserId),
  /// An officer or admin acting on anyone's entries.
  Admin,
}

impl Actor {
  fn authorize(&self, owner: &UserId) -> Result<()> {
    match self {
      Self::User(u) if u != owner => Err(Error::Forbidden {
        actor: u.clone(),
        owner: owner.clone(),
      }),
      _ => Ok(()),
    }
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct AfkLifecycle<S> {
  store:  Arc<S>,
  clock:  Arc<dyn Clock>,
  policy: AfkPolicy,
  owners: KeyedLocks<UserId>,
}

impl<S: AfkStore> AfkLifecycle<S> {
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      clock,
      policy: AfkPolicy::default(),
      owners: KeyedLocks::default(),
    }
  }

  pub fn with_policy(mut self, policy: AfkPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn policy(&self) -> AfkPolicy { self.policy }

  pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

  /// The state of `entry` right now.
  pub fn state_of(&self, entry: &AfkEntry) -> AfkState { entry.state(self.clock.now()) }

  // ── Commands ──────────────────────────────────────────────────────────────

  /// Schedule a new AFK window for `owner`.
  ///
  /// Rejects malformed or already-finished windows (`InvalidRange`),
  /// windows over the policy maximum (`TooLong`), and windows intersecting
  /// one of the owner's live entries (`OverlapConflict`).
  pub async fn create(
    &self,
    owner: UserId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    reason: impl Into<String>,
  ) -> Result<AfkEntry> {
    let now = self.clock.now();
    if start >= end {
      return Err(Error::InvalidRange(format!(
        "start {start} must be before end {end}"
      )));
    }
    if end <= now {
      return Err(Error::InvalidRange(format!("window ending {end} is already over")));
    }
    if !is_storable(start) || !is_storable(end) {
      return Err(Error::InvalidRange(format!(
        "window {start} .. {end} is outside years 0000..=9999"
      )));
    }
    self.check_length(start, end)?;

    // The store checks overlap in the same transaction as the insert.
    let _guard = self.owners.lock(&owner).await;

    let input = NewAfkEntry {
      user_id: owner,
      start_at: start,
      end_at: end,
      reason: reason.into(),
    };
    let entry =
      retry_once("create_afk", || self.store.create_afk(input.clone(), now)).await?;

    tracing::info!(
      id = entry.id,
      user = %entry.user_id,
      start = %entry.start_at,
      end = %entry.end_at,
      state = %entry.state(now),
      "afk entry created"
    );
    Ok(entry)
  }

  /// "AFK until end of day": from now until 23:59:59 UTC today, or `days`
  /// days from today.
  pub async fn quick(
    &self,
    owner: UserId,
    reason: impl Into<String>,
    days: Option<u32>,
  ) -> Result<AfkEntry> {
    let now = self.clock.now();
    let (start, end) = quick_window(now, days)?;
    self.create(owner, start, end, reason).await
  }

  /// Push `end_at` of a live entry forward by `extra`.
  pub async fn extend(&self, actor: &Actor, id: i64, extra: Duration) -> Result<AfkEntry> {
    if extra <= Duration::zero() {
      return Err(Error::InvalidRange(format!(
        "extension must be positive, got {}s",
        extra.num_seconds()
      )));
    }

    let owner = self.fetch(id).await?.user_id;
    actor.authorize(&owner)?;
    let _guard = self.owners.lock(&owner).await;

    // Re-read under the owner lock; a concurrent command may have won.
    let entry = self.fetch(id).await?;
    let now = self.clock.now();
    match entry.state(now) {
      AfkState::Expired => return Err(Error::AlreadyExpired(id)),
      s @ (AfkState::Returned | AfkState::Deleted) => {
        return Err(Error::AlreadyEnded(id, s));
      }
      AfkState::Scheduled | AfkState::Active => {}
    }

    let new_end = entry
      .end_at
      .checked_add_signed(extra)
      .filter(|t| is_storable(*t))
      .ok_or_else(|| {
        Error::InvalidRange(format!(
          "extending {} by {}m is out of range",
          entry.end_at,
          extra.num_minutes()
        ))
      })?;
    self.check_length(entry.start_at, new_end)?;
    self
      .ensure_no_overlap(&owner, entry.start_at, new_end, now, Some(id))
      .await?;

    let updated = retry_once("extend_afk", || {
      self.store.extend_afk(id, entry.end_at, new_end)
    })
    .await?;
    tracing::info!(
      id,
      user = %owner,
      from = %entry.end_at,
      to = %updated.end_at,
      "afk entry extended"
    );
    Ok(updated)
  }

  /// End the owner's currently running entry.
  pub async fn return_early(&self, owner: &UserId) -> Result<AfkEntry> {
    let _guard = self.owners.lock(owner).await;
    let now = self.clock.now();

    let entries = retry_once("list_afk_for_owner", || {
      self.store.list_afk_for_owner(owner, false, None)
    })
    .await?;
    let running = entries
      .into_iter()
      .find(|e| e.state(now) == AfkState::Active)
      .ok_or_else(|| Error::NoActiveAfk(owner.clone()))?;

    let ended =
      retry_once("end_afk_now", || self.store.end_afk_now(running.id, now)).await?;
    tracing::info!(id = ended.id, user = %owner, "returned from afk");
    Ok(ended)
  }

  /// Soft-delete one entry. Deleting an already-deleted entry succeeds and
  /// returns it unchanged.
  pub async fn delete(&self, actor: &Actor, id: i64) -> Result<AfkEntry> {
    let owner = self.fetch(id).await?.user_id;
    actor.authorize(&owner)?;
    let _guard = self.owners.lock(&owner).await;
    let now = self.clock.now();

    let deleted =
      retry_once("soft_delete_afk", || self.store.soft_delete_afk(id, now)).await?;
    tracing::info!(id, user = %owner, actor = ?actor, "afk entry deleted");
    Ok(deleted)
  }

  /// Soft-delete all of `owner`'s entries; returns how many were newly
  /// deleted.
  pub async fn delete_for_owner(&self, actor: &Actor, owner: &UserId) -> Result<usize> {
    actor.authorize(owner)?;
    let _guard = self.owners.lock(owner).await;
    let now = self.clock.now();

    let count = retry_once("soft_delete_all_afk", || {
      self.store.soft_delete_all_afk(owner, now)
    })
    .await?;
    tracing::info!(user = %owner, count, actor = ?actor, "afk entries deleted");
    Ok(count)
  }

  /// Clear the stored active flag on entries whose window has passed. Reads
  /// never depend on this; it only keeps `list_active_afk` small.
  pub async fn sweep_expired(&self) -> Result<usize> {
    let now = self.clock.now();
    let count =
      retry_once("sweep_expired_afk", || self.store.sweep_expired_afk(now)).await?;
    if count > 0 {
      tracing::info!(count, "expired afk entries swept");
    }
    Ok(count)
  }

  // ── Helpers ───────────────────────────────────────────────────────────────

  async fn fetch(&self, id: i64) -> Result<AfkEntry> {
    retry_once("get_afk", || self.store.get_afk(id))
      .await?
      .ok_or(Error::NotFound(id))
  }

  fn check_length(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    match self.policy.max_duration {
      Some(max) if end - start > max => Err(Error::TooLong {
        hours:     (end - start).num_hours(),
        max_hours: max.num_hours(),
      }),
      _ => Ok(()),
    }
  }

  async fn ensure_no_overlap(
    &self,
    owner: &UserId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    exclude: Option<i64>,
  ) -> Result<()> {
    let candidates = retry_once("overlapping_afk", || {
      self.store.overlapping_afk(owner, start, end, now, exclude)
    })
    .await?;

    match candidates
      .iter()
      .find(|e| Some(e.id) != exclude && e.state(now).is_live() && e.overlaps(start, end))
    {
      Some(existing) => Err(Error::OverlapConflict {
        existing: existing.id,
        start,
        end,
      }),
      None => Ok(()),
    }
  }
}

/// The window used by [`AfkLifecycle::quick`].
pub fn quick_window(
  now: DateTime<Utc>,
  days: Option<u32>,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
  let days = match days {
    Some(0) => {
      return Err(Error::InvalidRange("number of days must be positive".into()));
    }
    Some(d) => d,
    None => 0,
  };

  let end = now
    .date_naive()
    .checked_add_days(Days::new(u64::from(days)))
    .and_then(|d| d.and_hms_opt(23, 59, 59))
    .map(|dt| dt.and_utc())
    .ok_or_else(|| Error::InvalidRange(format!("{days} days from now is out of range")))?;

  if end <= now {
    return Err(Error::InvalidRange("the day is already over".into()));
  }
  Ok((now, end))
}
