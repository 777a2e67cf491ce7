//! Handlers for group and membership-history endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/groups` | Configured tracked groups |
//! | `GET`  | `/groups/{group}/members` | `{group}` may be an id, role, name or alias |
//! | `GET`  | `/members/{user_id}/history` | `?group=&include_inactive=` |
//! | `GET`  | `/memberships/changes` | `?since=<rfc3339>` or `?hours=<n>`, plus `?group=` |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use chrono::{DateTime, Duration, Utc};
use roster_core::{
  group::{GroupRegistry, TrackedGroup},
  membership::UserId,
  report::MembershipRecord,
  store::{AfkStore, MembershipStore},
};
use serde::{Deserialize, Serialize};

use crate::{ApiState, error::ApiError};

/// Window used by `/memberships/changes` when neither `since` nor `hours`
/// is given.
const DEFAULT_CHANGE_HOURS: i64 = 24;

// ─── Wire types ──────────────────────────────────────────────────────────────

/// One membership interval as served over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
  pub discord_id:   UserId,
  pub username:     Option<String>,
  pub display_name: Option<String>,
  pub clan_role_id: String,
  pub clan_name:    String,
  pub joined_at:    DateTime<Utc>,
  pub left_at:      Option<DateTime<Utc>>,
  pub is_active:    bool,
}

impl MembershipView {
  /// Intervals of a group that has since been removed from configuration
  /// fall back to the raw group id for both role and name.
  pub fn new(record: MembershipRecord, groups: &GroupRegistry) -> Self {
    let MembershipRecord { interval, profile } = record;
    let (clan_role_id, clan_name) = match groups.get(&interval.group_id) {
      Some(g) => (g.role_id.clone(), g.name.clone()),
      None => (interval.group_id.to_string(), interval.group_id.to_string()),
    };
    let (username, display_name) = match profile {
      Some(p) => (Some(p.username), p.display_name),
      None => (None, None),
    };
    Self {
      is_active: interval.is_open(),
      discord_id: interval.user_id,
      username,
      display_name,
      clan_role_id,
      clan_name,
      joined_at: interval.joined_at,
      left_at: interval.left_at,
    }
  }
}

fn views<S>(state: &ApiState<S>, records: Vec<MembershipRecord>) -> Vec<MembershipView> {
  records
    .into_iter()
    .map(|r| MembershipView::new(r, &state.groups))
    .collect()
}

// ─── Groups ──────────────────────────────────────────────────────────────────

/// `GET /groups`
pub async fn groups<S>(State(state): State<ApiState<S>>) -> Json<Vec<TrackedGroup>>
where
  S: AfkStore + MembershipStore,
{
  Json(state.groups.all().to_vec())
}

/// `GET /groups/{group}/members`
pub async fn members<S>(
  State(state): State<ApiState<S>>,
  Path(key): Path<String>,
) -> Result<Json<Vec<MembershipView>>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let group = state.groups.resolve(&key)?.id.clone();
  let records = state.reports.group_members(&group).await?;
  Ok(Json(views(&state, records)))
}

// ─── History ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
  pub group:            Option<String>,
  #[serde(default = "default_true")]
  pub include_inactive: bool,
}

fn default_true() -> bool { true }

/// `GET /members/{user_id}/history[?group=&include_inactive=]`
pub async fn history<S>(
  State(state): State<ApiState<S>>,
  Path(user): Path<UserId>,
  Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<MembershipView>>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let group = state
    .groups
    .resolve_opt(params.group.as_deref())?
    .map(|g| g.id.clone());
  let records = state
    .reports
    .membership_history(&user, group.as_ref(), params.include_inactive)
    .await?;
  Ok(Json(views(&state, records)))
}

// ─── Changes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ChangesParams {
  pub since: Option<DateTime<Utc>>,
  pub hours: Option<i64>,
  pub group: Option<String>,
}

impl ChangesParams {
  /// `since` wins over `hours`.
  fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ApiError> {
    if let Some(since) = self.since {
      return Ok(since);
    }
    let hours = self.hours.unwrap_or(DEFAULT_CHANGE_HOURS);
    if hours <= 0 {
      return Err(ApiError::BadRequest(format!("hours must be positive, got {hours}")));
    }
    Duration::try_hours(hours)
      .and_then(|d| now.checked_sub_signed(d))
      .ok_or_else(|| ApiError::BadRequest(format!("{hours} hours is out of range")))
  }
}

/// `GET /memberships/changes?since=<rfc3339>|hours=<n>[&group=]`
pub async fn changes<S>(
  State(state): State<ApiState<S>>,
  Query(params): Query<ChangesParams>,
) -> Result<Json<Vec<MembershipView>>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let cutoff = params.cutoff(state.reports.now())?;
  let group = state
    .groups
    .resolve_opt(params.group.as_deref())?
    .map(|g| g.id.clone());
  let records = state.reports.membership_changes(cutoff, group.as_ref()).await?;
  Ok(Json(views(&state, records)))
}
