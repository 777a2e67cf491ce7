//! Membership reconciliation: snapshot → minimal open/close transitions.
//!
//! Each tick re-reads the currently open intervals from the store and diffs
//! them against a fresh snapshot. No diff state survives between ticks, so a
//! write that failed on one tick simply shows up again in the next diff.

use std::{
  collections::{BTreeSet, HashSet},
  future::Future,
  sync::Arc,
  time::Duration,
};

use serde::Serialize;
use tokio::{sync::broadcast, task::JoinSet, time::MissedTickBehavior};

use crate::{
  Error, Result,
  clock::Clock,
  group::TrackedGroup,
  locks::KeyedLocks,
  membership::{GroupId, MemberProfile, UserId},
  retry::retry_once,
  store::MembershipStore,
};

/// Default time between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

// ─── Snapshot source ─────────────────────────────────────────────────────────

/// The external source of truth for who currently holds a group's role.
pub trait SnapshotSource: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Users currently holding `group.role_id`.
  fn members<'a>(
    &'a self,
    group: &'a TrackedGroup,
  ) -> impl Future<Output = Result<HashSet<UserId>, Self::Error>> + Send + 'a;

  /// Display metadata for some of the group's members. Sources that cannot
  /// describe users keep the default, which describes nobody.
  fn profiles<'a>(
    &'a self,
    group: &'a TrackedGroup,
    users: &'a [UserId],
  ) -> impl Future<Output = Result<Vec<MemberProfile>, Self::Error>> + Send + 'a {
    let _ = (group, users);
    async { Ok(Vec::new()) }
  }
}

// ─── Diff ────────────────────────────────────────────────────────────────────

/// The transitions needed to move stored membership to the observed one.
/// Both sides are sorted so ticks write in a deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
  pub to_open:  BTreeSet<UserId>,
  pub to_close: BTreeSet<UserId>,
}

impl MembershipDiff {
  pub fn compute(observed: &HashSet<UserId>, known: &HashSet<UserId>) -> Self {
    Self {
      to_open:  observed.difference(known).cloned().collect(),
      to_close: known.difference(observed).cloned().collect(),
    }
  }

  pub fn is_empty(&self) -> bool { self.to_open.is_empty() && self.to_close.is_empty() }

  pub fn len(&self) -> usize { self.to_open.len() + self.to_close.len() }
}

// ─── Report ──────────────────────────────────────────────────────────────────

/// What a single tick did for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
  pub group:   GroupId,
  pub opened:  Vec<UserId>,
  pub closed:  Vec<UserId>,
  /// Transitions the store already reflected (`AlreadyOpen`/`NoOpenInterval`).
  pub skipped: Vec<UserId>,
  /// Transitions that failed and will be retried by the next tick.
  pub failed:  Vec<(UserId, String)>,
}

impl TickReport {
  /// Number of intervals actually opened or closed.
  pub fn writes(&self) -> usize { self.opened.len() + self.closed.len() }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct Reconciler<M, P> {
  store:    Arc<M>,
  source:   Arc<P>,
  clock:    Arc<dyn Clock>,
  interval: Duration,
  groups:   KeyedLocks<GroupId>,
}

impl<M, P> Reconciler<M, P>
where
  M: MembershipStore + 'static,
  P: SnapshotSource + 'static,
{
  pub fn new(store: Arc<M>, source: Arc<P>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      source,
      clock,
      interval: DEFAULT_TICK_INTERVAL,
      groups: KeyedLocks::default(),
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Run one diff-and-write cycle for `group`.
  ///
  /// Fails only when the snapshot or the stored member set cannot be read;
  /// individual write failures are isolated into [`TickReport::failed`].
  pub async fn tick(&self, group: &TrackedGroup) -> Result<TickReport> {
    let _guard = self.groups.lock(&group.id).await;

    let observed = self
      .source
      .members(group)
      .await
      .map_err(|e| Error::SnapshotUnavailable(e.to_string()))?;
    let known =
      retry_once("current_members", || self.store.current_members(&group.id)).await?;

    let diff = MembershipDiff::compute(&observed, &known);
    let mut report = TickReport {
      group: group.id.clone(),
      ..TickReport::default()
    };
    if diff.is_empty() {
      tracing::debug!(group = %group.id, members = known.len(), "membership unchanged");
      return Ok(report);
    }

    let now = self.clock.now();

    for user in &diff.to_open {
      match retry_once("open_interval", || self.store.open_interval(user, &group.id, now))
        .await
      {
        Ok(_) => report.opened.push(user.clone()),
        Err(Error::AlreadyOpen { .. }) => report.skipped.push(user.clone()),
        Err(e) => {
          tracing::warn!(group = %group.id, user = %user, error = %e, "failed to open interval");
          report.failed.push((user.clone(), e.to_string()));
        }
      }
    }

    for user in &diff.to_close {
      match retry_once("close_interval", || self.store.close_interval(user, &group.id, now))
        .await
      {
        Ok(_) => report.closed.push(user.clone()),
        Err(Error::NoOpenInterval { .. }) => report.skipped.push(user.clone()),
        Err(e) => {
          tracing::warn!(group = %group.id, user = %user, error = %e, "failed to close interval");
          report.failed.push((user.clone(), e.to_string()));
        }
      }
    }

    if !report.opened.is_empty() {
      self.refresh_profiles(group, &report.opened).await;
    }

    tracing::info!(
      group = %group.id,
      opened = report.opened.len(),
      closed = report.closed.len(),
      skipped = report.skipped.len(),
      failed = report.failed.len(),
      "reconciliation tick"
    );
    Ok(report)
  }

  /// Tick every group concurrently. A failing group is logged and does not
  /// affect the others.
  pub async fn tick_all(self: &Arc<Self>, groups: &[TrackedGroup]) -> Vec<TickReport> {
    let mut tasks = JoinSet::new();
    for group in groups.iter().cloned() {
      let this = Arc::clone(self);
      tasks.spawn(async move {
        let result = this.tick(&group).await;
        (group.id, result)
      });
    }

    let mut reports = Vec::with_capacity(groups.len());
    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((_, Ok(report))) => reports.push(report),
        Ok((group, Err(e))) => {
          tracing::warn!(group = %group, error = %e, "reconciliation tick failed");
        }
        Err(e) => tracing::error!(error = %e, "reconciliation task panicked"),
      }
    }
    reports
  }

  /// Tick all `groups` on a fixed schedule until `shutdown` fires. A tick
  /// already in progress is allowed to finish first.
  pub async fn run(
    self: Arc<Self>,
    groups: Vec<TrackedGroup>,
    mut shutdown: broadcast::Receiver<()>,
  ) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(
      groups = groups.len(),
      interval_secs = self.interval.as_secs(),
      "reconciliation loop started"
    );

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          self.tick_all(&groups).await;
        }
        _ = shutdown.recv() => {
          tracing::info!("reconciliation loop stopping");
          break;
        }
      }
    }
  }

  async fn refresh_profiles(&self, group: &TrackedGroup, users: &[UserId]) {
    let profiles = match self.source.profiles(group, users).await {
      Ok(p) => p,
      Err(e) => {
        tracing::warn!(group = %group.id, error = %e, "could not describe new members");
        return;
      }
    };

    let now = self.clock.now();
    for profile in &profiles {
      if let Err(e) =
        retry_once("upsert_profile", || self.store.upsert_profile(profile, now)).await
      {
        tracing::warn!(user = %profile.user_id, error = %e, "failed to store profile");
      }
    }
  }
}
