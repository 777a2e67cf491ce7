//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.

use chrono::{DateTime, SecondsFormat, Utc};
use roster_core::{
  afk::AfkEntry,
  membership::{GroupId, MemberProfile, MembershipInterval, UserId},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

/// Fixed-width so that lexicographic order equals time order.
pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const AFK_COLUMNS: &str =
  "id, user_id, start_at, end_at, reason, is_active, is_deleted, created_at, ended_at";

/// Raw values read directly from an `afk_entries` row.
pub struct RawAfkEntry {
  pub id:         i64,
  pub user_id:    String,
  pub start_at:   String,
  pub end_at:     String,
  pub reason:     String,
  pub is_active:  bool,
  pub is_deleted: bool,
  pub created_at: String,
  pub ended_at:   Option<String>,
}

impl RawAfkEntry {
  /// Row mapper for queries selecting [`AFK_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:         row.get(0)?,
      user_id:    row.get(1)?,
      start_at:   row.get(2)?,
      end_at:     row.get(3)?,
      reason:     row.get(4)?,
      is_active:  row.get(5)?,
      is_deleted: row.get(6)?,
      created_at: row.get(7)?,
      ended_at:   row.get(8)?,
    })
  }

  pub fn into_entry(self) -> Result<AfkEntry> {
    Ok(AfkEntry {
      id:         self.id,
      user_id:    UserId(self.user_id),
      start_at:   decode_dt(&self.start_at)?,
      end_at:     decode_dt(&self.end_at)?,
      reason:     self.reason,
      is_active:  self.is_active,
      is_deleted: self.is_deleted,
      created_at: decode_dt(&self.created_at)?,
      ended_at:   decode_opt_dt(self.ended_at.as_deref())?,
    })
  }
}

pub const INTERVAL_COLUMNS: &str = "id, user_id, group_id, joined_at, left_at";

/// Raw values read directly from a `memberships` row.
pub struct RawInterval {
  pub id:        i64,
  pub user_id:   String,
  pub group_id:  String,
  pub joined_at: String,
  pub left_at:   Option<String>,
}

impl RawInterval {
  /// Row mapper for queries selecting [`INTERVAL_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:        row.get(0)?,
      user_id:   row.get(1)?,
      group_id:  row.get(2)?,
      joined_at: row.get(3)?,
      left_at:   row.get(4)?,
    })
  }

  pub fn into_interval(self) -> Result<MembershipInterval> {
    Ok(MembershipInterval {
      id:        self.id,
      user_id:   UserId(self.user_id),
      group_id:  GroupId(self.group_id),
      joined_at: decode_dt(&self.joined_at)?,
      left_at:   decode_opt_dt(self.left_at.as_deref())?,
    })
  }
}

/// Raw values read from a `members` row.
pub struct RawProfile {
  pub user_id:      String,
  pub username:     String,
  pub display_name: Option<String>,
}

impl RawProfile {
  pub fn into_profile(self) -> MemberProfile {
    MemberProfile {
      user_id:      UserId(self.user_id),
      username:     self.username,
      display_name: self.display_name,
    }
  }
}
