//! SQL schema for the Roster SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
///
/// Timestamps are fixed-width RFC 3339 strings (microseconds, `Z`), so
/// text comparison in SQL matches chronological order.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Display metadata only; nothing references it.
CREATE TABLE IF NOT EXISTS members (
    user_id      TEXT PRIMARY KEY,
    username     TEXT NOT NULL,
    display_name TEXT,
    updated_at   TEXT NOT NULL
);

-- AFK entries are never hard-deleted.
CREATE TABLE IF NOT EXISTS afk_entries (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT    NOT NULL,
    start_at    TEXT    NOT NULL,
    end_at      TEXT    NOT NULL,
    reason      TEXT    NOT NULL DEFAULT '',
    is_active   INTEGER NOT NULL DEFAULT 1,
    is_deleted  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT    NOT NULL,
    ended_at    TEXT,
    CHECK (start_at < end_at)
);

-- Append-only membership intervals. Rows are inserted once and their
-- left_at is set at most once.
CREATE TABLE IF NOT EXISTS memberships (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id   TEXT NOT NULL,
    group_id  TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    left_at   TEXT,
    CHECK (left_at IS NULL OR left_at >= joined_at)
);

-- At most one open interval per (user, group).
CREATE UNIQUE INDEX IF NOT EXISTS memberships_open_idx
    ON memberships(user_id, group_id) WHERE left_at IS NULL;

CREATE INDEX IF NOT EXISTS afk_owner_idx        ON afk_entries(user_id, start_at);
CREATE INDEX IF NOT EXISTS afk_active_idx       ON afk_entries(is_active, is_deleted);
CREATE INDEX IF NOT EXISTS memberships_group_idx ON memberships(group_id, left_at);
CREATE INDEX IF NOT EXISTS memberships_user_idx  ON memberships(user_id, joined_at);

PRAGMA user_version = 1;
";
