//! JSON REST API for Roster.
//!
//! Exposes an axum [`Router`] over the AFK lifecycle engine, the read
//! projections and the tracked-group registry. Auth, TLS, and transport
//! concerns are the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", roster_api::api_router(state))
//! ```

pub mod afk;
pub mod error;
pub mod membership;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use roster_core::{
  clock::Clock,
  group::GroupRegistry,
  lifecycle::{Actor, AfkLifecycle, AfkPolicy},
  membership::UserId,
  report::Reports,
  store::{AfkStore, MembershipStore},
};

pub use error::ApiError;

// ─── State ───────────────────────────────────────────────────────────────────

/// Shared state threaded through all handlers.
pub struct ApiState<S> {
  pub store:   Arc<S>,
  pub afk:     Arc<AfkLifecycle<S>>,
  pub reports: Arc<Reports<S>>,
  pub groups:  Arc<GroupRegistry>,
}

// Derived `Clone` would require `S: Clone`.
impl<S> Clone for ApiState<S> {
  fn clone(&self) -> Self {
    Self {
      store:   Arc::clone(&self.store),
      afk:     Arc::clone(&self.afk),
      reports: Arc::clone(&self.reports),
      groups:  Arc::clone(&self.groups),
    }
  }
}

impl<S> ApiState<S>
where
  S: AfkStore + MembershipStore,
{
  pub fn new(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: AfkPolicy,
    groups: GroupRegistry,
  ) -> Self {
    Self {
      afk: Arc::new(
        AfkLifecycle::new(Arc::clone(&store), Arc::clone(&clock)).with_policy(policy),
      ),
      reports: Arc::new(Reports::new(Arc::clone(&store), clock)),
      groups: Arc::new(groups),
      store,
    }
  }
}

/// A missing `acting_user` means the bearer holder acts as admin.
pub(crate) fn actor(acting_user: Option<UserId>) -> Actor {
  acting_user.map_or(Actor::Admin, Actor::User)
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build a fully-materialised API router.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(state: ApiState<S>) -> Router<()>
where
  S: AfkStore + MembershipStore + 'static,
{
  Router::new()
    // AFK
    .route("/afk", get(afk::list_active::<S>).post(afk::create::<S>))
    .route("/afk/quick", post(afk::quick::<S>))
    .route("/afk/stats", get(afk::stats::<S>))
    .route("/afk/{id}", axum::routing::delete(afk::delete_one::<S>))
    .route("/afk/{id}/extend", post(afk::extend::<S>))
    .route(
      "/afk/users/{user_id}",
      get(afk::history::<S>).delete(afk::delete_all::<S>),
    )
    .route("/afk/users/{user_id}/return", post(afk::return_early::<S>))
    // Membership
    .route("/groups", get(membership::groups::<S>))
    .route("/groups/{group}/members", get(membership::members::<S>))
    .route("/members/{user_id}/history", get(membership::history::<S>))
    .route("/memberships/changes", get(membership::changes::<S>))
    .with_state(state)
}
