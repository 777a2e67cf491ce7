//! Read projections over AFK entries and membership history.
//!
//! Nothing here writes. "Currently active" is always recomputed from the
//! clock, so a stale `is_active` flag on an expired entry never leaks into a
//! report.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
  Result,
  afk::{AfkEntry, AfkState},
  clock::Clock,
  membership::{GroupId, MemberProfile, MembershipInterval, UserId},
  retry::retry_once,
  store::{AfkStore, MembershipStore},
};

/// Aggregate figures over non-deleted AFK entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AfkStatistics {
  pub total:             usize,
  pub unique_users:      usize,
  pub active_now:        usize,
  pub scheduled_future:  usize,
  /// Mean of `min(ended_at, end_at) - start_at`, in days. Zero when there
  /// are no entries.
  pub avg_duration_days: f64,
}

impl AfkStatistics {
  pub fn compute(entries: &[AfkEntry], now: DateTime<Utc>) -> Self {
    let live: Vec<&AfkEntry> = entries.iter().filter(|e| !e.is_deleted).collect();
    if live.is_empty() {
      return Self::default();
    }

    let mut users = HashSet::new();
    let mut stats = Self {
      total: live.len(),
      ..Self::default()
    };
    let mut total_secs = 0i64;
    for e in &live {
      users.insert(&e.user_id);
      match e.state(now) {
        AfkState::Active => stats.active_now += 1,
        AfkState::Scheduled => stats.scheduled_future += 1,
        _ => {}
      }
      let stop = e.ended_at.map_or(e.end_at, |ended| ended.min(e.end_at));
      total_secs += (stop - e.start_at).num_seconds().max(0);
    }

    stats.unique_users = users.len();
    stats.avg_duration_days = total_secs as f64 / 86_400.0 / live.len() as f64;
    stats
  }
}

/// A membership interval joined with whatever profile data is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipRecord {
  pub interval: MembershipInterval,
  pub profile:  Option<MemberProfile>,
}

pub struct Reports<S> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
}

impl<S> Reports<S>
where
  S: AfkStore + MembershipStore,
{
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self { Self { store, clock } }

  pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

  /// Entries running right now, optionally only for current members of
  /// `group`.
  pub async fn active_afk(&self, group: Option<&GroupId>) -> Result<Vec<AfkEntry>> {
    let now = self.clock.now();
    let entries =
      retry_once("list_active_afk", || AfkStore::list_active_afk(&*self.store)).await?;
    let members = self.member_filter(group).await?;

    let mut active: Vec<AfkEntry> = entries
      .into_iter()
      .filter(|e| e.state(now) == AfkState::Active)
      .filter(|e| members.as_ref().is_none_or(|m| m.contains(&e.user_id)))
      .collect();
    active.sort_by(|a, b| a.end_at.cmp(&b.end_at).then(a.id.cmp(&b.id)));
    Ok(active)
  }

  /// An owner's entries, newest first, each paired with its state.
  pub async fn afk_history(
    &self,
    owner: &UserId,
    limit: Option<usize>,
    include_deleted: bool,
  ) -> Result<Vec<(AfkEntry, AfkState)>> {
    let now = self.clock.now();
    let entries = retry_once("list_afk_for_owner", || {
      self.store.list_afk_for_owner(owner, include_deleted, limit)
    })
    .await?;
    Ok(
      entries
        .into_iter()
        .map(|e| {
          let state = e.state(now);
          (e, state)
        })
        .collect(),
    )
  }

  pub async fn afk_statistics(&self, group: Option<&GroupId>) -> Result<AfkStatistics> {
    let now = self.clock.now();
    let mut entries =
      retry_once("list_all_afk", || AfkStore::list_all_afk(&*self.store, false)).await?;
    if let Some(members) = self.member_filter(group).await? {
      entries.retain(|e| members.contains(&e.user_id));
    }
    Ok(AfkStatistics::compute(&entries, now))
  }

  /// Current members of `group`, longest-standing first.
  pub async fn group_members(&self, group: &GroupId) -> Result<Vec<MembershipRecord>> {
    let intervals =
      retry_once("open_intervals", || self.store.open_intervals(group)).await?;
    self.with_profiles(intervals).await
  }

  pub async fn membership_history(
    &self,
    user: &UserId,
    group: Option<&GroupId>,
    include_inactive: bool,
  ) -> Result<Vec<MembershipRecord>> {
    let intervals = retry_once("history", || {
      self.store.history(user, group, include_inactive)
    })
    .await?;
    self.with_profiles(intervals).await
  }

  /// Joins and leaves at or after `since`, most recent first.
  pub async fn membership_changes(
    &self,
    since: DateTime<Utc>,
    group: Option<&GroupId>,
  ) -> Result<Vec<MembershipRecord>> {
    let intervals =
      retry_once("changes_since", || self.store.changes_since(since, group)).await?;
    self.with_profiles(intervals).await
  }

  async fn member_filter(&self, group: Option<&GroupId>) -> Result<Option<HashSet<UserId>>> {
    match group {
      Some(g) => Ok(Some(
        retry_once("current_members", || self.store.current_members(g)).await?,
      )),
      None => Ok(None),
    }
  }

  async fn with_profiles(
    &self,
    intervals: Vec<MembershipInterval>,
  ) -> Result<Vec<MembershipRecord>> {
    let mut users: Vec<UserId> = intervals.iter().map(|i| i.user_id.clone()).collect();
    users.sort();
    users.dedup();
    let profiles = retry_once("profiles", || self.store.profiles(&users)).await?;

    Ok(
      intervals
        .into_iter()
        .map(|interval| MembershipRecord {
          profile: profiles.get(&interval.user_id).cloned(),
          interval,
        })
        .collect(),
    )
  }
}
