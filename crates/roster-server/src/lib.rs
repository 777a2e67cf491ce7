//! HTTP server wiring for Roster.
//!
//! Mounts the [`roster_api`] router under `/api` behind bearer auth and
//! request tracing, and provides the HTTP-backed membership snapshot source
//! the reconciliation loop polls.

pub mod auth;
pub mod error;
pub mod snapshot;

pub use error::Error;

use std::{path::PathBuf, time::Duration};

use axum::{Router, middleware};
use chrono::Duration as ChronoDuration;
use roster_api::ApiState;
use roster_core::{
  group::TrackedGroup,
  lifecycle::AfkPolicy,
  store::{AfkStore, MembershipStore},
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use auth::{AuthConfig, require_bearer};
use snapshot::SnapshotConfig;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:                    String,
  #[serde(default = "default_port")]
  pub port:                    u16,
  pub store_path:              PathBuf,
  /// Lowercase hex SHA-256 of the API bearer token.
  pub api_token_sha256:        String,
  #[serde(default = "default_store_timeout_ms")]
  pub store_timeout_ms:        u64,
  #[serde(default = "default_reconcile_interval_secs")]
  pub reconcile_interval_secs: u64,
  #[serde(default)]
  pub afk:                     AfkConfig,
  /// Without a snapshot source, membership history is served but never
  /// reconciled.
  pub snapshot:                Option<SnapshotConfig>,
  #[serde(default)]
  pub groups:                  Vec<TrackedGroup>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct AfkConfig {
  pub max_duration_hours: Option<i64>,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8080 }
fn default_store_timeout_ms() -> u64 { 5_000 }
fn default_reconcile_interval_secs() -> u64 { 60 }

impl ServerConfig {
  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

  pub fn store_timeout(&self) -> Duration { Duration::from_millis(self.store_timeout_ms) }

  pub fn reconcile_interval(&self) -> Duration {
    Duration::from_secs(self.reconcile_interval_secs.max(1))
  }

  pub fn auth(&self) -> AuthConfig {
    AuthConfig { token_sha256: self.api_token_sha256.clone() }
  }

  pub fn afk_policy(&self) -> Result<AfkPolicy, Error> {
    let max_duration = match self.afk.max_duration_hours {
      None => None,
      Some(h) if h > 0 => Some(ChronoDuration::try_hours(h).ok_or_else(|| {
        Error::Config(format!("afk.max_duration_hours {h} is out of range"))
      })?),
      Some(h) => {
        return Err(Error::Config(format!(
          "afk.max_duration_hours must be positive, got {h}"
        )));
      }
    };
    Ok(AfkPolicy { max_duration })
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the server's axum [`Router`]: the JSON API under `/api`, every
/// route requiring a bearer token.
pub fn router<S>(state: ApiState<S>, auth: AuthConfig) -> Router
where
  S: AfkStore + MembershipStore + 'static,
{
  let api = roster_api::api_router(state)
    .layer(middleware::from_fn_with_state(auth, require_bearer));
  Router::new()
    .nest("/api", api)
    .layer(TraceLayer::new_for_http())
}
