//! Role-membership snapshots fetched over HTTP.
//!
//! The upstream endpoint answers `GET <url_template with {role_id}>` with a
//! JSON array of `{discord_id, username, display_name, roles}` objects.

use std::{
  collections::{HashMap, HashSet},
  sync::{Mutex, PoisonError},
  time::Duration,
};

use reqwest::{Client, header};
use roster_core::{
  group::TrackedGroup,
  membership::{GroupId, MemberProfile, UserId},
  reconcile::SnapshotSource,
};
use serde::Deserialize;

use crate::error::Error;

const ROLE_PLACEHOLDER: &str = "{role_id}";

/// `[snapshot]` section of the server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
  /// e.g. `http://bot.internal/api/discord/role/{role_id}/members`
  pub url_template: String,
  /// Sent as `Authorization: Bearer <token>` when present.
  pub token:        Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 { 10 }

#[derive(Debug, Deserialize)]
struct RoleMember {
  discord_id:   UserId,
  #[serde(default)]
  username:     Option<String>,
  #[serde(default)]
  display_name: Option<String>,
  /// Absent when the endpoint already filtered by role.
  #[serde(default)]
  roles:        Option<Vec<String>>,
}

impl RoleMember {
  /// Endpoints that omit `roles` are trusted to have filtered already; an
  /// explicit empty list holds nothing.
  fn holds(&self, role_id: &str) -> bool {
    self
      .roles
      .as_ref()
      .is_none_or(|roles| roles.iter().any(|r| r == role_id))
  }

  fn profile(&self) -> Option<MemberProfile> {
    Some(MemberProfile {
      user_id:      self.discord_id.clone(),
      username:     self.username.clone()?,
      display_name: self.display_name.clone(),
    })
  }
}

/// [`SnapshotSource`] backed by an HTTP role-members endpoint.
///
/// Profiles are served from the most recent snapshot of each group, so the
/// reconciler's profile refresh costs no extra request.
pub struct HttpSnapshotSource {
  client:       Client,
  url_template: String,
  token:        Option<String>,
  profiles:     Mutex<HashMap<GroupId, HashMap<UserId, MemberProfile>>>,
}

impl HttpSnapshotSource {
  pub fn new(config: &SnapshotConfig) -> Result<Self, Error> {
    if !config.url_template.contains(ROLE_PLACEHOLDER) {
      return Err(Error::Config(format!(
        "snapshot.url_template must contain {ROLE_PLACEHOLDER}"
      )));
    }
    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;
    Ok(Self {
      client,
      url_template: config.url_template.clone(),
      token: config.token.clone(),
      profiles: Mutex::new(HashMap::new()),
    })
  }

  fn url_for(&self, group: &TrackedGroup) -> String {
    self.url_template.replace(ROLE_PLACEHOLDER, &group.role_id)
  }

  async fn fetch(&self, url: &str) -> Result<Vec<RoleMember>, Error> {
    let mut req = self.client.get(url).header(header::ACCEPT, "application/json");
    if let Some(token) = &self.token {
      req = req.bearer_auth(token);
    }
    let res = req.send().await?;
    if !res.status().is_success() {
      return Err(Error::UnexpectedStatus {
        status: res.status().as_u16(),
        url:    url.to_string(),
      });
    }
    Ok(res.json().await?)
  }
}

/// Members of `role_id` in a fetched payload, with whatever profiles the
/// payload carries.
fn collect_members(
  payload: Vec<RoleMember>,
  role_id: &str,
) -> (HashSet<UserId>, HashMap<UserId, MemberProfile>) {
  let mut ids = HashSet::new();
  let mut profiles = HashMap::new();
  for member in payload.into_iter().filter(|m| m.holds(role_id)) {
    if let Some(p) = member.profile() {
      profiles.insert(member.discord_id.clone(), p);
    }
    ids.insert(member.discord_id);
  }
  (ids, profiles)
}

impl SnapshotSource for HttpSnapshotSource {
  type Error = Error;

  async fn members(&self, group: &TrackedGroup) -> Result<HashSet<UserId>, Error> {
    let url = self.url_for(group);
    let payload = self.fetch(&url).await?;
    let (ids, profiles) = collect_members(payload, &group.role_id);
    tracing::debug!(group = %group.id, members = ids.len(), "fetched role snapshot");
    self
      .profiles
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(group.id.clone(), profiles);
    Ok(ids)
  }

  async fn profiles(
    &self,
    group: &TrackedGroup,
    users: &[UserId],
  ) -> Result<Vec<MemberProfile>, Error> {
    let cache = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(known) = cache.get(&group.id) else {
      return Ok(Vec::new());
    };
    Ok(users.iter().filter_map(|u| known.get(u).cloned()).collect())
  }
}
