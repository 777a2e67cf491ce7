//! [`SqliteStore`]: the SQLite implementation of [`AfkStore`] and
//! [`MembershipStore`].

use std::{
  collections::{HashMap, HashSet},
  path::Path,
  time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension as _, TransactionBehavior};

use roster_core::{
  Error as CoreError,
  afk::{AfkEntry, NewAfkEntry},
  membership::{GroupId, MemberProfile, MembershipInterval, UserId},
  store::{AfkStore, MembershipStore},
};

use crate::{
  Error, Result,
  encode::{AFK_COLUMNS, INTERVAL_COLUMNS, RawAfkEntry, RawInterval, RawProfile, encode_dt},
  schema::SCHEMA,
};

/// Upper bound on a single store call, including time spent queued behind
/// other calls on the connection thread.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Store ───────────────────────────────────────────────────────────────────

/// AFK entries and membership history backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted and all
/// clones share the same database thread, which serializes writes.
#[derive(Clone)]
pub struct SqliteStore {
  conn:       tokio_rusqlite::Connection,
  op_timeout: Duration,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self {
      conn,
      op_timeout: DEFAULT_OP_TIMEOUT,
    };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self {
      conn,
      op_timeout: DEFAULT_OP_TIMEOUT,
    };
    store.init_schema().await?;
    Ok(store)
  }

  pub fn with_timeout(mut self, op_timeout: Duration) -> Self {
    self.op_timeout = op_timeout;
    self
  }

  async fn init_schema(&self) -> Result<()> {
    let busy = self.op_timeout;
    self
      .call("init_schema", move |conn| {
        conn.busy_timeout(busy)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await
  }

  /// Run `f` on the connection thread, giving up after `op_timeout`.
  async fn call<F, R>(&self, op: &'static str, f: F) -> Result<R>
  where
    F: FnOnce(&mut rusqlite::Connection) -> tokio_rusqlite::Result<R> + Send + 'static,
    R: Send + 'static,
  {
    match tokio::time::timeout(self.op_timeout, self.conn.call(f)).await {
      Ok(result) => Ok(result?),
      Err(_) => {
        tracing::warn!(op, timeout = ?self.op_timeout, "store operation timed out");
        Err(Error::Timeout {
          op,
          timeout: self.op_timeout,
        })
      }
    }
  }

  async fn afk_query(
    &self,
    op: &'static str,
    sql: String,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<AfkEntry>> {
    let raws: Vec<RawAfkEntry> = self
      .call(op, move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawAfkEntry::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAfkEntry::into_entry).collect()
  }

  async fn interval_query(
    &self,
    op: &'static str,
    sql: String,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<MembershipInterval>> {
    let raws: Vec<RawInterval> = self
      .call(op, move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawInterval::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawInterval::into_interval).collect()
  }
}

fn find_afk(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<RawAfkEntry>> {
  conn
    .query_row(
      &format!("SELECT {AFK_COLUMNS} FROM afk_entries WHERE id = ?1"),
      rusqlite::params![id],
      RawAfkEntry::from_row,
    )
    .optional()
}

fn find_open_interval(
  conn: &rusqlite::Connection,
  user: &str,
  group: &str,
) -> rusqlite::Result<Option<RawInterval>> {
  conn
    .query_row(
      &format!(
        "SELECT {INTERVAL_COLUMNS} FROM memberships
         WHERE user_id = ?1 AND group_id = ?2 AND left_at IS NULL"
      ),
      rusqlite::params![user, group],
      RawInterval::from_row,
    )
    .optional()
}

fn sql_limit(limit: Option<usize>) -> i64 {
  // SQLite treats a negative LIMIT as "no limit".
  limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

/// Live entries of owner `?1` intersecting `[?2, ?3]` at `?4`, skipping id
/// `?5` when it is not NULL.
const LIVE_OVERLAP: &str = "user_id = ?1
  AND is_deleted = 0 AND is_active = 1 AND ended_at IS NULL
  AND end_at >= ?4
  AND start_at <= ?3 AND ?2 <= end_at
  AND (?5 IS NULL OR id != ?5)";

enum CreateOutcome {
  Created(RawAfkEntry),
  Overlaps(i64),
}

enum ExtendOutcome {
  Extended(RawAfkEntry),
  Missing,
  Stale,
}

enum CloseOutcome {
  Closed(RawInterval),
  NotOpen,
  BeforeJoin(String),
}

// ─── AfkStore impl ───────────────────────────────────────────────────────────

impl AfkStore for SqliteStore {
  type Error = Error;

  async fn create_afk(&self, input: NewAfkEntry, at: DateTime<Utc>) -> Result<AfkEntry> {
    if input.start_at >= input.end_at {
      return Err(
        CoreError::InvalidRange(format!(
          "start {} must be before end {}",
          input.start_at, input.end_at
        ))
        .into(),
      );
    }

    let user = input.user_id.0;
    let (start_at, end_at) = (input.start_at, input.end_at);
    let start = encode_dt(start_at);
    let end = encode_dt(end_at);
    let reason = input.reason;
    let created = encode_dt(at);

    let outcome = self
      .call("create_afk", move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<i64> = tx
          .query_row(
            &format!("SELECT id FROM afk_entries WHERE {LIVE_OVERLAP} ORDER BY start_at, id"),
            rusqlite::params![user, start, end, created, rusqlite::types::Null],
            |row| row.get(0),
          )
          .optional()?;
        if let Some(existing) = existing {
          return Ok(CreateOutcome::Overlaps(existing));
        }
        tx.execute(
          "INSERT INTO afk_entries (user_id, start_at, end_at, reason, is_active, is_deleted, created_at)
           VALUES (?1, ?2, ?3, ?4, 1, 0, ?5)",
          rusqlite::params![user, start, end, reason, created],
        )?;
        let id = tx.last_insert_rowid();
        let raw = tx.query_row(
          &format!("SELECT {AFK_COLUMNS} FROM afk_entries WHERE id = ?1"),
          rusqlite::params![id],
          RawAfkEntry::from_row,
        )?;
        tx.commit()?;
        Ok(CreateOutcome::Created(raw))
      })
      .await?;

    match outcome {
      CreateOutcome::Created(raw) => raw.into_entry(),
      CreateOutcome::Overlaps(existing) => Err(
        CoreError::OverlapConflict {
          existing,
          start: start_at,
          end: end_at,
        }
        .into(),
      ),
    }
  }

  async fn get_afk(&self, id: i64) -> Result<Option<AfkEntry>> {
    let raw = self
      .call("get_afk", move |conn| Ok(find_afk(conn, id)?))
      .await?;
    raw.map(RawAfkEntry::into_entry).transpose()
  }

  async fn extend_afk(
    &self,
    id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
  ) -> Result<AfkEntry> {
    let (from, to) = (encode_dt(from), encode_dt(to));
    let outcome = self
      .call("extend_afk", move |conn| {
        let tx = conn.transaction()?;
        let Some(current) = find_afk(&tx, id)? else {
          return Ok(ExtendOutcome::Missing);
        };
        if current.end_at == to {
          return Ok(ExtendOutcome::Extended(current));
        }
        if current.end_at != from {
          return Ok(ExtendOutcome::Stale);
        }
        tx.execute(
          "UPDATE afk_entries SET end_at = ?3 WHERE id = ?1 AND end_at = ?2",
          rusqlite::params![id, from, to],
        )?;
        let updated = find_afk(&tx, id)?;
        tx.commit()?;
        Ok(updated.map_or(ExtendOutcome::Missing, ExtendOutcome::Extended))
      })
      .await?;

    match outcome {
      ExtendOutcome::Extended(raw) => raw.into_entry(),
      ExtendOutcome::Missing => Err(CoreError::NotFound(id).into()),
      ExtendOutcome::Stale => Err(CoreError::ConcurrentUpdate(id).into()),
    }
  }

  async fn end_afk_now(&self, id: i64, at: DateTime<Utc>) -> Result<AfkEntry> {
    let at = encode_dt(at);
    let raw = self
      .call("end_afk_now", move |conn| {
        let tx = conn.transaction()?;
        // end_at only moves back when `at` lies strictly inside the window,
        // so start_at < end_at keeps holding.
        tx.execute(
          "UPDATE afk_entries
           SET is_active = 0,
               ended_at  = ?2,
               end_at    = CASE WHEN start_at < ?2 AND ?2 < end_at THEN ?2 ELSE end_at END
           WHERE id = ?1 AND ended_at IS NULL AND is_deleted = 0",
          rusqlite::params![id, at],
        )?;
        let row = find_afk(&tx, id)?;
        tx.commit()?;
        Ok(row)
      })
      .await?;
    raw.ok_or(CoreError::NotFound(id))?.into_entry()
  }

  async fn soft_delete_afk(&self, id: i64, at: DateTime<Utc>) -> Result<AfkEntry> {
    let at = encode_dt(at);
    let raw = self
      .call("soft_delete_afk", move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "UPDATE afk_entries SET is_deleted = 1, is_active = 0, ended_at = ?2
           WHERE id = ?1 AND is_deleted = 0",
          rusqlite::params![id, at],
        )?;
        let row = find_afk(&tx, id)?;
        tx.commit()?;
        Ok(row)
      })
      .await?;
    raw.ok_or(CoreError::NotFound(id))?.into_entry()
  }

  async fn soft_delete_all_afk(&self, owner: &UserId, at: DateTime<Utc>) -> Result<usize> {
    let owner = owner.0.clone();
    let at = encode_dt(at);
    self
      .call("soft_delete_all_afk", move |conn| {
        Ok(conn.execute(
          "UPDATE afk_entries SET is_deleted = 1, is_active = 0, ended_at = ?2
           WHERE user_id = ?1 AND is_deleted = 0",
          rusqlite::params![owner, at],
        )?)
      })
      .await
  }

  async fn list_active_afk(&self) -> Result<Vec<AfkEntry>> {
    self
      .afk_query(
        "list_active_afk",
        format!(
          "SELECT {AFK_COLUMNS} FROM afk_entries
           WHERE is_active = 1 AND is_deleted = 0
           ORDER BY start_at, id"
        ),
        vec![],
      )
      .await
  }

  async fn list_afk_for_owner(
    &self,
    owner: &UserId,
    include_deleted: bool,
    limit: Option<usize>,
  ) -> Result<Vec<AfkEntry>> {
    self
      .afk_query(
        "list_afk_for_owner",
        format!(
          "SELECT {AFK_COLUMNS} FROM afk_entries
           WHERE user_id = ?1 AND (?2 OR is_deleted = 0)
           ORDER BY created_at DESC, id DESC
           LIMIT ?3"
        ),
        vec![
          owner.0.clone().into(),
          i64::from(include_deleted).into(),
          sql_limit(limit).into(),
        ],
      )
      .await
  }

  async fn list_all_afk(&self, include_deleted: bool) -> Result<Vec<AfkEntry>> {
    self
      .afk_query(
        "list_all_afk",
        format!(
          "SELECT {AFK_COLUMNS} FROM afk_entries
           WHERE ?1 OR is_deleted = 0
           ORDER BY id"
        ),
        vec![i64::from(include_deleted).into()],
      )
      .await
  }

  async fn overlapping_afk(
    &self,
    owner: &UserId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    exclude: Option<i64>,
  ) -> Result<Vec<AfkEntry>> {
    let exclude = exclude.map_or(rusqlite::types::Value::Null, Into::into);
    self
      .afk_query(
        "overlapping_afk",
        format!(
          "SELECT {AFK_COLUMNS} FROM afk_entries WHERE {LIVE_OVERLAP} ORDER BY start_at, id"
        ),
        vec![
          owner.0.clone().into(),
          encode_dt(start).into(),
          encode_dt(end).into(),
          encode_dt(now).into(),
          exclude,
        ],
      )
      .await
  }

  async fn sweep_expired_afk(&self, now: DateTime<Utc>) -> Result<usize> {
    let now = encode_dt(now);
    self
      .call("sweep_expired_afk", move |conn| {
        Ok(conn.execute(
          "UPDATE afk_entries SET is_active = 0
           WHERE is_active = 1 AND is_deleted = 0 AND end_at < ?1",
          rusqlite::params![now],
        )?)
      })
      .await
  }
}

// ─── MembershipStore impl ────────────────────────────────────────────────────

impl MembershipStore for SqliteStore {
  type Error = Error;

  async fn open_interval(
    &self,
    user: &UserId,
    group: &GroupId,
    at: DateTime<Utc>,
  ) -> Result<MembershipInterval> {
    let (u, g) = (user.0.clone(), group.0.clone());
    let at = encode_dt(at);

    let raw = self
      .call("open_interval", move |conn| {
        let inserted = conn.execute(
          "INSERT INTO memberships (user_id, group_id, joined_at) VALUES (?1, ?2, ?3)",
          rusqlite::params![u, g, at],
        );
        match inserted {
          Ok(_) => {}
          // The partial unique index rejects a second open interval.
          Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
            return Ok(None);
          }
          Err(e) => return Err(e.into()),
        }
        let id = conn.last_insert_rowid();
        Ok(Some(conn.query_row(
          &format!("SELECT {INTERVAL_COLUMNS} FROM memberships WHERE id = ?1"),
          rusqlite::params![id],
          RawInterval::from_row,
        )?))
      })
      .await?;

    match raw {
      Some(raw) => raw.into_interval(),
      None => Err(
        CoreError::AlreadyOpen {
          user:  user.clone(),
          group: group.clone(),
        }
        .into(),
      ),
    }
  }

  async fn close_interval(
    &self,
    user: &UserId,
    group: &GroupId,
    at: DateTime<Utc>,
  ) -> Result<MembershipInterval> {
    let (u, g) = (user.0.clone(), group.0.clone());
    let at_str = encode_dt(at);

    let outcome = self
      .call("close_interval", move |conn| {
        let tx = conn.transaction()?;
        let Some(open) = find_open_interval(&tx, &u, &g)? else {
          return Ok(CloseOutcome::NotOpen);
        };
        if at_str < open.joined_at {
          return Ok(CloseOutcome::BeforeJoin(open.joined_at));
        }
        tx.execute(
          "UPDATE memberships SET left_at = ?2 WHERE id = ?1 AND left_at IS NULL",
          rusqlite::params![open.id, at_str],
        )?;
        let closed = tx.query_row(
          &format!("SELECT {INTERVAL_COLUMNS} FROM memberships WHERE id = ?1"),
          rusqlite::params![open.id],
          RawInterval::from_row,
        )?;
        tx.commit()?;
        Ok(CloseOutcome::Closed(closed))
      })
      .await?;

    match outcome {
      CloseOutcome::Closed(raw) => raw.into_interval(),
      CloseOutcome::NotOpen => Err(
        CoreError::NoOpenInterval {
          user:  user.clone(),
          group: group.clone(),
        }
        .into(),
      ),
      CloseOutcome::BeforeJoin(joined) => Err(
        CoreError::InvalidRange(format!(
          "cannot leave {group} at {at} before joining at {joined}"
        ))
        .into(),
      ),
    }
  }

  async fn current_members(&self, group: &GroupId) -> Result<HashSet<UserId>> {
    let g = group.0.clone();
    let ids: Vec<String> = self
      .call("current_members", move |conn| {
        let mut stmt = conn.prepare(
          "SELECT user_id FROM memberships WHERE group_id = ?1 AND left_at IS NULL",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![g], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(ids.into_iter().map(UserId).collect())
  }

  async fn open_intervals(&self, group: &GroupId) -> Result<Vec<MembershipInterval>> {
    self
      .interval_query(
        "open_intervals",
        format!(
          "SELECT {INTERVAL_COLUMNS} FROM memberships
           WHERE group_id = ?1 AND left_at IS NULL
           ORDER BY joined_at, id"
        ),
        vec![group.0.clone().into()],
      )
      .await
  }

  async fn history(
    &self,
    user: &UserId,
    group: Option<&GroupId>,
    include_inactive: bool,
  ) -> Result<Vec<MembershipInterval>> {
    let group = group.map_or(rusqlite::types::Value::Null, |g| g.0.clone().into());
    self
      .interval_query(
        "history",
        format!(
          "SELECT {INTERVAL_COLUMNS} FROM memberships
           WHERE user_id = ?1
             AND (?2 IS NULL OR group_id = ?2)
             AND (?3 OR left_at IS NULL)
           ORDER BY joined_at, id"
        ),
        vec![user.0.clone().into(), group, i64::from(include_inactive).into()],
      )
      .await
  }

  async fn changes_since(
    &self,
    cutoff: DateTime<Utc>,
    group: Option<&GroupId>,
  ) -> Result<Vec<MembershipInterval>> {
    let group = group.map_or(rusqlite::types::Value::Null, |g| g.0.clone().into());
    self
      .interval_query(
        "changes_since",
        format!(
          "SELECT {INTERVAL_COLUMNS} FROM memberships
           WHERE (joined_at >= ?1 OR left_at >= ?1)
             AND (?2 IS NULL OR group_id = ?2)
           ORDER BY COALESCE(left_at, joined_at) DESC, id DESC"
        ),
        vec![encode_dt(cutoff).into(), group],
      )
      .await
  }

  async fn upsert_profile(&self, profile: &MemberProfile, at: DateTime<Utc>) -> Result<()> {
    let user = profile.user_id.0.clone();
    let username = profile.username.clone();
    let display_name = profile.display_name.clone();
    let at = encode_dt(at);

    self
      .call("upsert_profile", move |conn| {
        conn.execute(
          "INSERT INTO members (user_id, username, display_name, updated_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(user_id) DO UPDATE SET
             username     = excluded.username,
             display_name = excluded.display_name,
             updated_at   = excluded.updated_at",
          rusqlite::params![user, username, display_name, at],
        )?;
        Ok(())
      })
      .await
  }

  async fn profiles(&self, users: &[UserId]) -> Result<HashMap<UserId, MemberProfile>> {
    if users.is_empty() {
      return Ok(HashMap::new());
    }
    let ids: Vec<String> = users.iter().map(|u| u.0.clone()).collect();

    let raws: Vec<RawProfile> = self
      .call("profiles", move |conn| {
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
          "SELECT user_id, username, display_name FROM members
           WHERE user_id IN ({placeholders})"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok(RawProfile {
              user_id:      row.get(0)?,
              username:     row.get(1)?,
              display_name: row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(
      raws
        .into_iter()
        .map(RawProfile::into_profile)
        .map(|p| (p.user_id.clone(), p))
        .collect(),
    )
  }
}
