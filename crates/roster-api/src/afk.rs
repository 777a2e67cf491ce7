//! Handlers for `/afk` endpoints.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `GET`    | `/afk` | Currently active entries; optional `?group=` |
//! | `POST`   | `/afk` | Body: `user_id`, `start_date`, `end_date`, `reason` |
//! | `POST`   | `/afk/quick` | Until end of day, or `days` days from today |
//! | `GET`    | `/afk/stats` | Optional `?group=` |
//! | `POST`   | `/afk/{id}/extend` | Body: `minutes`, optional `acting_user` |
//! | `DELETE` | `/afk/{id}` | Optional `?acting_user=` |
//! | `GET`    | `/afk/users/{user_id}` | `?limit=&include_deleted=` |
//! | `POST`   | `/afk/users/{user_id}/return` | Ends the running entry |
//! | `DELETE` | `/afk/users/{user_id}` | Optional `?acting_user=` |

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, Duration, Utc};
use roster_core::{
  afk::{AfkEntry, AfkState},
  membership::{GroupId, MemberProfile, UserId},
  report::AfkStatistics,
  store::{AfkStore, MembershipStore},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{ApiState, actor, error::ApiError};

// ─── Wire types ──────────────────────────────────────────────────────────────

/// An AFK entry as served over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfkView {
  pub id:         i64,
  pub user_id:    UserId,
  pub start_date: DateTime<Utc>,
  pub end_date:   DateTime<Utc>,
  pub reason:     String,
  pub is_active:  bool,
  pub is_deleted: bool,
  pub created_at: DateTime<Utc>,
  pub ended_at:   Option<DateTime<Utc>>,
  pub state:      AfkState,
}

impl AfkView {
  pub fn new(entry: AfkEntry, state: AfkState) -> Self {
    Self {
      id: entry.id,
      user_id: entry.user_id,
      start_date: entry.start_at,
      end_date: entry.end_at,
      reason: entry.reason,
      is_active: entry.is_active,
      is_deleted: entry.is_deleted,
      created_at: entry.created_at,
      ended_at: entry.ended_at,
      state,
    }
  }
}

fn view<S: AfkStore>(state: &ApiState<S>, entry: AfkEntry) -> AfkView {
  let s = state.afk.state_of(&entry);
  AfkView::new(entry, s)
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupParams {
  pub group: Option<String>,
}

impl GroupParams {
  fn resolve<S>(&self, state: &ApiState<S>) -> Result<Option<GroupId>, ApiError> {
    Ok(
      state
        .groups
        .resolve_opt(self.group.as_deref())?
        .map(|g| g.id.clone()),
    )
  }
}

#[derive(Debug, Default, Deserialize)]
pub struct ActingParams {
  pub acting_user: Option<UserId>,
}

// ─── Active list ─────────────────────────────────────────────────────────────

/// `GET /afk[?group=<key>]`
pub async fn list_active<S>(
  State(state): State<ApiState<S>>,
  Query(params): Query<GroupParams>,
) -> Result<Json<Vec<AfkView>>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let group = params.resolve(&state)?;
  let entries = state.reports.active_afk(group.as_ref()).await?;
  Ok(Json(entries.into_iter().map(|e| view(&state, e)).collect()))
}

// ─── Create ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  pub user_id:      UserId,
  pub start_date:   DateTime<Utc>,
  pub end_date:     DateTime<Utc>,
  #[serde(default)]
  pub reason:       String,
  pub username:     Option<String>,
  pub display_name: Option<String>,
}

/// `POST /afk`
pub async fn create<S>(
  State(state): State<ApiState<S>>,
  Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: AfkStore + MembershipStore,
{
  remember_profile(&state, &body.user_id, body.username, body.display_name).await;
  let entry = state
    .afk
    .create(body.user_id, body.start_date, body.end_date, body.reason)
    .await?;
  Ok((StatusCode::CREATED, Json(view(&state, entry))))
}

#[derive(Debug, Deserialize)]
pub struct QuickBody {
  pub user_id: UserId,
  #[serde(default)]
  pub reason:  String,
  pub days:    Option<u32>,
}

/// `POST /afk/quick`
pub async fn quick<S>(
  State(state): State<ApiState<S>>,
  Json(body): Json<QuickBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let entry = state.afk.quick(body.user_id, body.reason, body.days).await?;
  Ok((StatusCode::CREATED, Json(view(&state, entry))))
}

/// Profiles are display-only, so a failed upsert must not fail the request.
async fn remember_profile<S>(
  state: &ApiState<S>,
  user: &UserId,
  username: Option<String>,
  display_name: Option<String>,
) where
  S: AfkStore + MembershipStore,
{
  let Some(username) = username else { return };
  let profile = MemberProfile {
    user_id: user.clone(),
    username,
    display_name,
  };
  let now = state.afk.now();
  if let Err(e) = state.store.upsert_profile(&profile, now).await {
    tracing::warn!(user = %user, error = %e, "failed to store profile");
  }
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// `GET /afk/stats[?group=<key>]`
pub async fn stats<S>(
  State(state): State<ApiState<S>>,
  Query(params): Query<GroupParams>,
) -> Result<Json<AfkStatistics>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let group = params.resolve(&state)?;
  Ok(Json(state.reports.afk_statistics(group.as_ref()).await?))
}

// ─── Extend / delete one ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExtendBody {
  pub minutes:     i64,
  pub acting_user: Option<UserId>,
}

/// `POST /afk/{id}/extend`
pub async fn extend<S>(
  State(state): State<ApiState<S>>,
  Path(id): Path<i64>,
  Json(body): Json<ExtendBody>,
) -> Result<Json<AfkView>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let extra = Duration::try_minutes(body.minutes)
    .ok_or_else(|| ApiError::BadRequest(format!("{} minutes is out of range", body.minutes)))?;
  let entry = state.afk.extend(&actor(body.acting_user), id, extra).await?;
  Ok(Json(view(&state, entry)))
}

/// `DELETE /afk/{id}[?acting_user=<id>]`
pub async fn delete_one<S>(
  State(state): State<ApiState<S>>,
  Path(id): Path<i64>,
  Query(params): Query<ActingParams>,
) -> Result<Json<AfkView>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let entry = state.afk.delete(&actor(params.acting_user), id).await?;
  Ok(Json(view(&state, entry)))
}

// ─── Per-user ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
  pub limit:           Option<usize>,
  #[serde(default)]
  pub include_deleted: bool,
}

/// `GET /afk/users/{user_id}[?limit=&include_deleted=]`
pub async fn history<S>(
  State(state): State<ApiState<S>>,
  Path(user): Path<UserId>,
  Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<AfkView>>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let entries = state
    .reports
    .afk_history(&user, params.limit, params.include_deleted)
    .await?;
  Ok(Json(
    entries
      .into_iter()
      .map(|(e, s)| AfkView::new(e, s))
      .collect(),
  ))
}

/// `POST /afk/users/{user_id}/return`
pub async fn return_early<S>(
  State(state): State<ApiState<S>>,
  Path(user): Path<UserId>,
) -> Result<Json<AfkView>, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let entry = state.afk.return_early(&user).await?;
  Ok(Json(view(&state, entry)))
}

/// `DELETE /afk/users/{user_id}[?acting_user=<id>]`
pub async fn delete_all<S>(
  State(state): State<ApiState<S>>,
  Path(user): Path<UserId>,
  Query(params): Query<ActingParams>,
) -> Result<impl IntoResponse, ApiError>
where
  S: AfkStore + MembershipStore,
{
  let deleted = state
    .afk
    .delete_for_owner(&actor(params.acting_user), &user)
    .await?;
  Ok(Json(json!({ "user_id": user, "deleted": deleted })))
}
