//! Integration tests for `SqliteStore` and the core engines running on top
//! of it, against an in-memory database.

use std::{
  collections::{HashMap, HashSet},
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, TimeZone, Utc};
use roster_core::{
  Error as CoreError,
  afk::{AfkState, NewAfkEntry},
  clock::{Clock, ManualClock},
  group::TrackedGroup,
  lifecycle::{Actor, AfkLifecycle, AfkPolicy},
  membership::{GroupId, MemberProfile, MembershipInterval, UserId},
  reconcile::{Reconciler, SnapshotSource},
  report::Reports,
  store::{AfkStore, MembershipStore},
};
use tokio::sync::broadcast;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
}

fn uid(s: &str) -> UserId { UserId::from(s) }

fn core_err<T: std::fmt::Debug>(r: crate::Result<T>) -> CoreError { r.unwrap_err().into() }

fn new_entry(user: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> NewAfkEntry {
  NewAfkEntry {
    user_id:  uid(user),
    start_at: start,
    end_at:   end,
    reason:   "vacation".into(),
  }
}

// ─── AFK store ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_afk() {
  let s = store().await;
  let created = s.create_afk(new_entry("1", at(8, 18), at(9, 18)), at(8, 12)).await.unwrap();

  assert!(created.is_active);
  assert!(!created.is_deleted);
  assert_eq!(created.ended_at, None);
  assert_eq!(created.created_at, at(8, 12));

  let fetched = s.get_afk(created.id).await.unwrap().unwrap();
  assert_eq!(fetched, created);
  assert!(s.get_afk(created.id + 100).await.unwrap().is_none());
}

#[tokio::test]
async fn store_rejects_inverted_window() {
  let s = store().await;
  let err = core_err(s.create_afk(new_entry("1", at(9, 0), at(9, 0)), at(8, 0)).await);
  assert!(matches!(err, CoreError::InvalidRange(_)));
}

#[tokio::test]
async fn extend_moves_end_forward() {
  let s = store().await;
  let e = s.create_afk(new_entry("1", at(8, 18), at(9, 18)), at(8, 12)).await.unwrap();

  let extended = s.extend_afk(e.id, at(9, 18), at(11, 0)).await.unwrap();
  assert_eq!(extended.end_at, at(11, 0));
  assert_eq!(extended.start_at, e.start_at);

  assert_eq!(
    core_err(s.extend_afk(999, at(9, 0), at(10, 0)).await),
    CoreError::NotFound(999)
  );
}

#[tokio::test]
async fn replayed_extend_applies_once() {
  let s = store().await;
  let e = s.create_afk(new_entry("1", at(8, 18), at(9, 18)), at(8, 12)).await.unwrap();

  let first = s.extend_afk(e.id, at(9, 18), at(9, 20)).await.unwrap();
  let replay = s.extend_afk(e.id, at(9, 18), at(9, 20)).await.unwrap();
  assert_eq!(first, replay);
  assert_eq!(s.get_afk(e.id).await.unwrap().unwrap().end_at, at(9, 20));

  assert_eq!(
    core_err(s.extend_afk(e.id, at(9, 18), at(9, 22)).await),
    CoreError::ConcurrentUpdate(e.id)
  );
}

#[tokio::test]
async fn replayed_create_is_rejected_by_the_store() {
  let s = store().await;
  let input = new_entry("1", at(8, 18), at(9, 18));
  let first = s.create_afk(input.clone(), at(8, 12)).await.unwrap();

  let err = core_err(s.create_afk(input, at(8, 12)).await);
  assert!(matches!(err, CoreError::OverlapConflict { existing, .. } if existing == first.id));
  assert_eq!(s.list_afk_for_owner(&uid("1"), true, None).await.unwrap().len(), 1);

  // Another owner, or a window that only intersects an ended entry, is fine.
  s.create_afk(new_entry("2", at(8, 18), at(9, 18)), at(8, 12)).await.unwrap();
  s.end_afk_now(first.id, at(8, 13)).await.unwrap();
  s.create_afk(new_entry("1", at(8, 18), at(9, 18)), at(8, 14)).await.unwrap();
}

#[tokio::test]
async fn end_now_inside_window_pulls_end_back() {
  let s = store().await;
  let e = s.create_afk(new_entry("1", at(8, 18), at(9, 18)), at(8, 12)).await.unwrap();

  let ended = s.end_afk_now(e.id, at(9, 6)).await.unwrap();
  assert_eq!(ended.end_at, at(9, 6));
  assert_eq!(ended.ended_at, Some(at(9, 6)));
  assert!(!ended.is_active);

  // Ending again changes nothing.
  let again = s.end_afk_now(e.id, at(9, 10)).await.unwrap();
  assert_eq!(again, ended);
}

#[tokio::test]
async fn end_now_before_start_keeps_window() {
  let s = store().await;
  let e = s.create_afk(new_entry("1", at(10, 0), at(11, 0)), at(8, 0)).await.unwrap();

  let ended = s.end_afk_now(e.id, at(9, 0)).await.unwrap();
  assert_eq!(ended.end_at, at(11, 0));
  assert_eq!(ended.ended_at, Some(at(9, 0)));
  assert_eq!(ended.state(at(9, 0)), AfkState::Returned);
}

#[tokio::test]
async fn soft_delete_is_idempotent() {
  let s = store().await;
  let e = s.create_afk(new_entry("1", at(8, 18), at(9, 18)), at(8, 12)).await.unwrap();

  let first = s.soft_delete_afk(e.id, at(8, 13)).await.unwrap();
  assert!(first.is_deleted);
  assert!(!first.is_active);
  assert_eq!(first.ended_at, Some(at(8, 13)));

  let second = s.soft_delete_afk(e.id, at(8, 20)).await.unwrap();
  assert_eq!(second, first);

  assert!(s.list_afk_for_owner(&uid("1"), false, None).await.unwrap().is_empty());
  assert_eq!(s.list_afk_for_owner(&uid("1"), true, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn soft_delete_all_counts_newly_deleted() {
  let s = store().await;
  let a = s.create_afk(new_entry("1", at(8, 0), at(9, 0)), at(7, 0)).await.unwrap();
  s.create_afk(new_entry("1", at(10, 0), at(11, 0)), at(7, 0)).await.unwrap();
  s.create_afk(new_entry("2", at(10, 0), at(11, 0)), at(7, 0)).await.unwrap();
  s.soft_delete_afk(a.id, at(7, 1)).await.unwrap();

  assert_eq!(s.soft_delete_all_afk(&uid("1"), at(7, 2)).await.unwrap(), 1);
  assert_eq!(s.soft_delete_all_afk(&uid("1"), at(7, 3)).await.unwrap(), 0);
  assert_eq!(s.list_active_afk().await.unwrap().len(), 1);
}

#[tokio::test]
async fn owner_history_is_newest_first_and_limited() {
  let s = store().await;
  let first = s.create_afk(new_entry("1", at(10, 0), at(11, 0)), at(7, 0)).await.unwrap();
  let second = s.create_afk(new_entry("1", at(12, 0), at(13, 0)), at(7, 1)).await.unwrap();
  let third = s.create_afk(new_entry("1", at(14, 0), at(15, 0)), at(7, 1)).await.unwrap();

  let ids: Vec<i64> = s
    .list_afk_for_owner(&uid("1"), false, None)
    .await
    .unwrap()
    .iter()
    .map(|e| e.id)
    .collect();
  assert_eq!(ids, vec![third.id, second.id, first.id]);

  let limited = s.list_afk_for_owner(&uid("1"), false, Some(1)).await.unwrap();
  assert_eq!(limited.len(), 1);
  assert_eq!(limited[0].id, third.id);
}

#[tokio::test]
async fn overlap_query_skips_terminal_and_excluded_entries() {
  let s = store().await;
  let live = s.create_afk(new_entry("1", at(10, 0), at(12, 0)), at(7, 0)).await.unwrap();
  let returned = s.create_afk(new_entry("1", at(8, 0), at(9, 0)), at(7, 0)).await.unwrap();
  s.end_afk_now(returned.id, at(8, 12)).await.unwrap();

  let hits = s
    .overlapping_afk(&uid("1"), at(8, 0), at(11, 0), at(8, 13), None)
    .await
    .unwrap();
  assert_eq!(hits.iter().map(|e| e.id).collect::<Vec<_>>(), vec![live.id]);

  let excluded = s
    .overlapping_afk(&uid("1"), at(8, 0), at(11, 0), at(8, 13), Some(live.id))
    .await
    .unwrap();
  assert!(excluded.is_empty());

  // Both ends are inclusive, so touching windows overlap.
  let touching = s
    .overlapping_afk(&uid("1"), at(12, 0), at(13, 0), at(8, 13), None)
    .await
    .unwrap();
  assert_eq!(touching.iter().map(|e| e.id).collect::<Vec<_>>(), vec![live.id]);
  let apart = s
    .overlapping_afk(&uid("1"), at(13, 0), at(14, 0), at(8, 13), None)
    .await
    .unwrap();
  assert!(apart.is_empty());
}

#[tokio::test]
async fn sweep_clears_active_flag_only() {
  let s = store().await;
  let old = s.create_afk(new_entry("1", at(8, 0), at(9, 0)), at(7, 0)).await.unwrap();
  s.create_afk(new_entry("1", at(10, 0), at(11, 0)), at(7, 0)).await.unwrap();

  assert_eq!(s.sweep_expired_afk(at(9, 12)).await.unwrap(), 1);
  assert_eq!(s.sweep_expired_afk(at(9, 12)).await.unwrap(), 0);

  let swept = s.get_afk(old.id).await.unwrap().unwrap();
  assert!(!swept.is_active);
  assert_eq!(swept.ended_at, None);
  assert_eq!(swept.state(at(9, 12)), AfkState::Expired);
}

// ─── Membership store ────────────────────────────────────────────────────────

#[tokio::test]
async fn only_one_open_interval_per_pair() {
  let s = store().await;
  let g = GroupId::from("sun");

  let opened = s.open_interval(&uid("A"), &g, at(8, 0)).await.unwrap();
  assert!(opened.is_open());
  assert_eq!(
    core_err(s.open_interval(&uid("A"), &g, at(8, 1)).await),
    CoreError::AlreadyOpen { user: uid("A"), group: g.clone() }
  );

  // Another group is independent.
  s.open_interval(&uid("A"), &GroupId::from("moon"), at(8, 1)).await.unwrap();
}

#[tokio::test]
async fn close_requires_an_open_interval() {
  let s = store().await;
  let g = GroupId::from("sun");

  assert_eq!(
    core_err(s.close_interval(&uid("A"), &g, at(8, 0)).await),
    CoreError::NoOpenInterval { user: uid("A"), group: g.clone() }
  );

  s.open_interval(&uid("A"), &g, at(8, 0)).await.unwrap();
  assert!(matches!(
    core_err(s.close_interval(&uid("A"), &g, at(7, 0)).await),
    CoreError::InvalidRange(_)
  ));

  let closed = s.close_interval(&uid("A"), &g, at(9, 0)).await.unwrap();
  assert_eq!(closed.left_at, Some(at(9, 0)));
  assert!(s.current_members(&g).await.unwrap().is_empty());
}

#[tokio::test]
async fn history_is_ordered_by_join_time() {
  let s = store().await;
  let g = GroupId::from("sun");
  let a = uid("A");

  s.open_interval(&a, &g, at(1, 0)).await.unwrap();
  s.close_interval(&a, &g, at(2, 0)).await.unwrap();
  s.open_interval(&a, &g, at(3, 0)).await.unwrap();
  s.close_interval(&a, &g, at(4, 0)).await.unwrap();
  s.open_interval(&a, &g, at(5, 0)).await.unwrap();

  let all = s.history(&a, Some(&g), true).await.unwrap();
  let joins: Vec<_> = all.iter().map(|i| i.joined_at).collect();
  assert_eq!(joins, vec![at(1, 0), at(3, 0), at(5, 0)]);
  assert_eq!(all.iter().filter(|i| i.is_open()).count(), 1);
  assert!(all.windows(2).all(|w| w[0].id < w[1].id));

  let open_only = s.history(&a, None, false).await.unwrap();
  assert_eq!(open_only.len(), 1);
  assert_eq!(open_only[0].joined_at, at(5, 0));
}

#[tokio::test]
async fn changes_since_lists_recent_events_first() {
  let s = store().await;
  let (sun, moon) = (GroupId::from("sun"), GroupId::from("moon"));

  s.open_interval(&uid("A"), &sun, at(1, 0)).await.unwrap();
  s.open_interval(&uid("B"), &sun, at(5, 0)).await.unwrap();
  s.close_interval(&uid("A"), &sun, at(6, 0)).await.unwrap();
  s.open_interval(&uid("C"), &moon, at(7, 0)).await.unwrap();

  let all = s.changes_since(at(4, 0), None).await.unwrap();
  let users: Vec<_> = all.iter().map(|i| i.user_id.as_str()).collect();
  assert_eq!(users, ["C", "A", "B"]);

  let sun_only = s.changes_since(at(4, 0), Some(&sun)).await.unwrap();
  assert_eq!(sun_only.len(), 2);
  assert!(s.changes_since(at(8, 0), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn profiles_upsert_and_lookup() {
  let s = store().await;
  let profile = MemberProfile {
    user_id:      uid("A"),
    username:     "alice".into(),
    display_name: None,
  };
  s.upsert_profile(&profile, at(1, 0)).await.unwrap();
  s.upsert_profile(
    &MemberProfile {
      display_name: Some("Alice".into()),
      ..profile.clone()
    },
    at(2, 0),
  )
  .await
  .unwrap();

  let found = s.profiles(&[uid("A"), uid("ghost")]).await.unwrap();
  assert_eq!(found.len(), 1);
  assert_eq!(found[&uid("A")].display_name.as_deref(), Some("Alice"));
  assert!(s.profiles(&[]).await.unwrap().is_empty());
}

// ─── AFK lifecycle on SQLite ─────────────────────────────────────────────────

async fn lifecycle(now: DateTime<Utc>) -> (AfkLifecycle<SqliteStore>, ManualClock) {
  let clock = ManualClock::new(now);
  let engine = AfkLifecycle::new(Arc::new(store().await), Arc::new(clock.clone()));
  (engine, clock)
}

#[tokio::test]
async fn created_entry_is_scheduled_or_active() {
  let (engine, _) = lifecycle(at(8, 12)).await;

  let later = engine.create(uid("1"), at(8, 18), at(9, 18), "trip").await.unwrap();
  assert_eq!(engine.state_of(&later), AfkState::Scheduled);

  let now = engine.create(uid("2"), at(8, 12), at(8, 20), "nap").await.unwrap();
  assert_eq!(engine.state_of(&now), AfkState::Active);
}

#[tokio::test]
async fn create_rejects_bad_windows() {
  let (engine, _) = lifecycle(at(8, 12)).await;
  let engine = engine.with_policy(AfkPolicy { max_duration: Some(Duration::days(7)) });

  assert!(matches!(
    engine.create(uid("1"), at(9, 0), at(8, 0), "").await,
    Err(CoreError::InvalidRange(_))
  ));
  assert!(matches!(
    engine.create(uid("1"), at(7, 0), at(8, 0), "").await,
    Err(CoreError::InvalidRange(_))
  ));
  assert!(matches!(
    engine.create(uid("1"), at(9, 0), at(20, 0), "").await,
    Err(CoreError::TooLong { .. })
  ));
}

#[tokio::test]
async fn overlapping_entries_conflict() {
  let (engine, _) = lifecycle(at(8, 0)).await;
  let first = engine.create(uid("1"), at(10, 0), at(12, 0), "").await.unwrap();

  let err = engine.create(uid("1"), at(11, 0), at(13, 0), "").await.unwrap_err();
  assert!(matches!(err, CoreError::OverlapConflict { existing, .. } if existing == first.id));

  // Other owners and disjoint windows are fine.
  engine.create(uid("1"), at(13, 0), at(14, 0), "").await.unwrap();
  engine.create(uid("2"), at(11, 0), at(13, 0), "").await.unwrap();
}

#[tokio::test]
async fn touching_windows_conflict() {
  let s = Arc::new(store().await);
  let clock = ManualClock::new(at(8, 0));
  let engine = AfkLifecycle::new(Arc::clone(&s), Arc::new(clock.clone()));
  let reports = Reports::new(Arc::clone(&s), Arc::new(clock.clone()));

  let first = engine.create(uid("1"), at(8, 18), at(9, 18), "").await.unwrap();
  let err = engine.create(uid("1"), at(9, 18), at(10, 18), "").await.unwrap_err();
  assert!(matches!(err, CoreError::OverlapConflict { existing, .. } if existing == first.id));

  clock.set(at(9, 18));
  let active = reports.active_afk(None).await.unwrap();
  assert_eq!(active.iter().map(|e| e.id).collect::<Vec<_>>(), vec![first.id]);
}

#[tokio::test]
async fn ended_entries_do_not_block_new_ones() {
  let (engine, clock) = lifecycle(at(8, 0)).await;
  let e = engine.create(uid("1"), at(8, 0), at(12, 0), "").await.unwrap();
  engine.delete(&Actor::Admin, e.id).await.unwrap();
  engine.create(uid("1"), at(9, 0), at(10, 0), "").await.unwrap();

  clock.set(at(9, 12));
  engine.return_early(&uid("1")).await.unwrap();
  engine.create(uid("1"), at(9, 13), at(11, 0), "").await.unwrap();
}

#[tokio::test]
async fn concurrent_overlapping_creates_admit_one() {
  let (engine, _) = lifecycle(at(8, 0)).await;

  let (a, b) = tokio::join!(
    engine.create(uid("1"), at(10, 0), at(12, 0), "a"),
    engine.create(uid("1"), at(11, 0), at(13, 0), "b"),
  );
  assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
  assert!(matches!(
    a.err().or(b.err()),
    Some(CoreError::OverlapConflict { .. })
  ));
}

#[tokio::test]
async fn extend_follows_the_state_machine() {
  let (engine, clock) = lifecycle(at(8, 0)).await;
  let e = engine.create(uid("1"), at(8, 18), at(9, 18), "").await.unwrap();

  let extended = engine.extend(&Actor::User(uid("1")), e.id, Duration::hours(2)).await.unwrap();
  assert!(extended.end_at > e.end_at);
  assert_eq!(extended.end_at, at(9, 20));

  assert!(matches!(
    engine.extend(&Actor::User(uid("1")), e.id, Duration::zero()).await,
    Err(CoreError::InvalidRange(_))
  ));
  assert!(matches!(
    engine.extend(&Actor::User(uid("2")), e.id, Duration::hours(1)).await,
    Err(CoreError::Forbidden { .. })
  ));
  assert_eq!(
    engine.extend(&Actor::Admin, 999, Duration::hours(1)).await,
    Err(CoreError::NotFound(999))
  );

  clock.set(at(9, 21));
  assert_eq!(
    engine.extend(&Actor::Admin, e.id, Duration::hours(1)).await,
    Err(CoreError::AlreadyExpired(e.id))
  );
}

#[tokio::test]
async fn extend_cannot_grow_into_a_neighbour() {
  let (engine, _) = lifecycle(at(8, 0)).await;
  let e = engine.create(uid("1"), at(10, 0), at(11, 0), "").await.unwrap();
  engine.create(uid("1"), at(12, 0), at(13, 0), "").await.unwrap();

  assert!(matches!(
    engine.extend(&Actor::Admin, e.id, Duration::hours(25)).await,
    Err(CoreError::OverlapConflict { .. })
  ));
  assert!(matches!(
    engine.extend(&Actor::Admin, e.id, Duration::hours(1)).await,
    Err(CoreError::OverlapConflict { .. })
  ));
  // Stopping just short of the next window is allowed.
  let grown = engine.extend(&Actor::Admin, e.id, Duration::minutes(59)).await.unwrap();
  assert_eq!(grown.end_at, at(11, 0) + Duration::minutes(59));
}

#[tokio::test]
async fn extension_past_the_calendar_is_rejected() {
  let (engine, _) = lifecycle(at(8, 0)).await;
  let e = engine.create(uid("1"), at(8, 18), at(9, 18), "").await.unwrap();

  let huge = Duration::try_minutes(100_000_000_000_000).unwrap();
  assert!(matches!(
    engine.extend(&Actor::Admin, e.id, huge).await,
    Err(CoreError::InvalidRange(_))
  ));
  assert!(matches!(
    engine.extend(&Actor::Admin, e.id, Duration::days(365 * 8000)).await,
    Err(CoreError::InvalidRange(_))
  ));
  assert!(matches!(
    engine
      .create(uid("2"), at(8, 18), Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap(), "")
      .await,
    Err(CoreError::InvalidRange(_))
  ));
  assert_eq!(engine.extend(&Actor::Admin, e.id, Duration::hours(1)).await.unwrap().end_at, at(9, 19));
}

#[tokio::test]
async fn returned_entries_cannot_be_extended() {
  let (engine, clock) = lifecycle(at(8, 0)).await;
  let e = engine.create(uid("1"), at(8, 0), at(10, 0), "").await.unwrap();

  clock.set(at(9, 0));
  let returned = engine.return_early(&uid("1")).await.unwrap();
  assert_eq!(engine.state_of(&returned), AfkState::Returned);
  assert_eq!(
    engine.extend(&Actor::Admin, e.id, Duration::hours(1)).await,
    Err(CoreError::AlreadyEnded(e.id, AfkState::Returned))
  );
  assert_eq!(
    engine.return_early(&uid("1")).await,
    Err(CoreError::NoActiveAfk(uid("1")))
  );
}

#[tokio::test]
async fn return_needs_a_running_entry() {
  let (engine, _) = lifecycle(at(8, 0)).await;
  engine.create(uid("1"), at(10, 0), at(11, 0), "").await.unwrap();
  assert_eq!(
    engine.return_early(&uid("1")).await,
    Err(CoreError::NoActiveAfk(uid("1")))
  );
}

#[tokio::test]
async fn delete_through_the_engine() {
  let (engine, _) = lifecycle(at(8, 0)).await;
  let e = engine.create(uid("1"), at(10, 0), at(11, 0), "").await.unwrap();
  engine.create(uid("1"), at(12, 0), at(13, 0), "").await.unwrap();

  assert!(matches!(
    engine.delete(&Actor::User(uid("2")), e.id).await,
    Err(CoreError::Forbidden { .. })
  ));
  let first = engine.delete(&Actor::User(uid("1")), e.id).await.unwrap();
  let second = engine.delete(&Actor::User(uid("1")), e.id).await.unwrap();
  assert_eq!(first, second);
  assert_eq!(engine.state_of(&second), AfkState::Deleted);

  assert!(matches!(
    engine.delete_for_owner(&Actor::User(uid("2")), &uid("1")).await,
    Err(CoreError::Forbidden { .. })
  ));
  assert_eq!(engine.delete_for_owner(&Actor::Admin, &uid("1")).await, Ok(1));
}

#[tokio::test]
async fn quick_afk_lasts_until_midnight() {
  let (engine, _) = lifecycle(at(8, 18)).await;
  let e = engine.quick(uid("1"), "errands", None).await.unwrap();
  assert_eq!(e.start_at, at(8, 18));
  assert_eq!(e.end_at, Utc.with_ymd_and_hms(2025, 1, 8, 23, 59, 59).unwrap());
  assert_eq!(engine.state_of(&e), AfkState::Active);
}

// ─── Reports ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_entry_leaves_active_list_without_a_write() {
  let s = Arc::new(store().await);
  let clock = ManualClock::new(at(8, 12));
  let engine = AfkLifecycle::new(Arc::clone(&s), Arc::new(clock.clone()));
  let reports = Reports::new(Arc::clone(&s), Arc::new(clock.clone()));

  let e = engine.create(uid("1"), at(8, 18), at(9, 18), "").await.unwrap();
  assert!(reports.active_afk(None).await.unwrap().is_empty());

  clock.set(at(9, 0));
  assert_eq!(reports.active_afk(None).await.unwrap()[0].id, e.id);

  clock.set(at(9, 19));
  assert!(reports.active_afk(None).await.unwrap().is_empty());

  // The stored row was never touched.
  let stored = s.get_afk(e.id).await.unwrap().unwrap();
  assert!(stored.is_active);
  assert_eq!(stored, e);
}

#[tokio::test]
async fn reports_filter_by_group_membership() {
  let s = Arc::new(store().await);
  let clock = ManualClock::new(at(8, 12));
  let engine = AfkLifecycle::new(Arc::clone(&s), Arc::new(clock.clone()));
  let reports = Reports::new(Arc::clone(&s), Arc::new(clock.clone()));
  let sun = GroupId::from("sun");

  s.open_interval(&uid("A"), &sun, at(1, 0)).await.unwrap();
  engine.create(uid("A"), at(8, 0), at(9, 0), "").await.unwrap();
  engine.create(uid("B"), at(8, 0), at(9, 0), "").await.unwrap();
  engine.create(uid("A"), at(10, 0), at(11, 0), "").await.unwrap();

  assert_eq!(reports.active_afk(None).await.unwrap().len(), 2);
  let sun_active = reports.active_afk(Some(&sun)).await.unwrap();
  assert_eq!(sun_active.len(), 1);
  assert_eq!(sun_active[0].user_id, uid("A"));

  let stats = reports.afk_statistics(Some(&sun)).await.unwrap();
  assert_eq!(stats.total, 2);
  assert_eq!(stats.unique_users, 1);
  assert_eq!(stats.active_now, 1);
  assert_eq!(stats.scheduled_future, 1);

  let history = reports.afk_history(&uid("A"), None, false).await.unwrap();
  let states: Vec<_> = history.iter().map(|(_, st)| *st).collect();
  assert_eq!(states, vec![AfkState::Scheduled, AfkState::Active]);
}

// ─── Reconciliation ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("snapshot source offline")]
struct Offline;

#[derive(Default)]
struct FakeSource {
  members: Mutex<HashMap<GroupId, HashSet<UserId>>>,
  offline: AtomicBool,
}

impl FakeSource {
  fn set(&self, group: &str, users: &[&str]) {
    self
      .members
      .lock()
      .unwrap()
      .insert(GroupId::from(group), users.iter().map(|u| uid(u)).collect());
  }
}

impl SnapshotSource for FakeSource {
  type Error = Offline;

  async fn members(&self, group: &TrackedGroup) -> Result<HashSet<UserId>, Offline> {
    if self.offline.load(Ordering::SeqCst) {
      return Err(Offline);
    }
    let members = self.members.lock().unwrap().get(&group.id).cloned();
    Ok(members.unwrap_or_default())
  }

  async fn profiles(
    &self,
    _group: &TrackedGroup,
    users: &[UserId],
  ) -> Result<Vec<MemberProfile>, Offline> {
    Ok(
      users
        .iter()
        .map(|u| MemberProfile {
          user_id:      u.clone(),
          username:     format!("user-{u}"),
          display_name: None,
        })
        .collect(),
    )
  }
}

fn sun() -> TrackedGroup {
  TrackedGroup {
    id:      GroupId::from("sun"),
    name:    "Requiem Sun".into(),
    role_id: "1111".into(),
    aliases: vec![],
  }
}

struct Harness {
  store:      Arc<SqliteStore>,
  source:     Arc<FakeSource>,
  clock:      ManualClock,
  reconciler: Arc<Reconciler<SqliteStore, FakeSource>>,
}

async fn harness() -> Harness {
  let store = Arc::new(store().await);
  let source = Arc::new(FakeSource::default());
  let clock = ManualClock::new(at(8, 0));
  let reconciler = Arc::new(Reconciler::new(
    Arc::clone(&store),
    Arc::clone(&source),
    Arc::new(clock.clone()),
  ));
  Harness { store, source, clock, reconciler }
}

#[tokio::test]
async fn tick_writes_exactly_the_difference() {
  let h = harness().await;
  let g = sun();
  h.store.open_interval(&uid("A"), &g.id, at(1, 0)).await.unwrap();
  h.store.open_interval(&uid("B"), &g.id, at(1, 0)).await.unwrap();
  h.source.set("sun", &["B", "C"]);

  let report = h.reconciler.tick(&g).await.unwrap();
  assert_eq!(report.opened, vec![uid("C")]);
  assert_eq!(report.closed, vec![uid("A")]);
  assert_eq!(report.writes(), 2);
  assert!(report.failed.is_empty());

  let b = h.store.history(&uid("B"), Some(&g.id), true).await.unwrap();
  assert_eq!(b.len(), 1);
  assert_eq!(b[0].joined_at, at(1, 0));
  assert!(b[0].is_open());

  let again = h.reconciler.tick(&g).await.unwrap();
  assert_eq!(again.writes(), 0);
  assert!(again.skipped.is_empty());
}

#[tokio::test]
async fn join_leave_then_quiet() {
  let h = harness().await;
  let g = sun();

  h.source.set("sun", &["A"]);
  assert_eq!(h.reconciler.tick(&g).await.unwrap().opened, vec![uid("A")]);
  assert_eq!(
    h.store.current_members(&g.id).await.unwrap(),
    HashSet::from([uid("A")])
  );

  h.clock.set(at(9, 0));
  h.source.set("sun", &[]);
  assert_eq!(h.reconciler.tick(&g).await.unwrap().closed, vec![uid("A")]);
  let history = h.store.history(&uid("A"), Some(&g.id), true).await.unwrap();
  assert_eq!(history[0].left_at, Some(h.clock.now()));

  assert_eq!(h.reconciler.tick(&g).await.unwrap().writes(), 0);
}

#[tokio::test]
async fn offline_snapshot_writes_nothing() {
  let h = harness().await;
  let g = sun();
  h.store.open_interval(&uid("A"), &g.id, at(1, 0)).await.unwrap();
  h.source.offline.store(true, Ordering::SeqCst);

  assert!(matches!(
    h.reconciler.tick(&g).await,
    Err(CoreError::SnapshotUnavailable(_))
  ));
  assert_eq!(
    h.store.current_members(&g.id).await.unwrap(),
    HashSet::from([uid("A")])
  );
  assert!(h.reconciler.tick_all(&[g]).await.is_empty());
}

/// Delegates to SQLite but fails the next `open_interval` for one user.
struct FailOnceOpen {
  inner: SqliteStore,
  user:  Mutex<Option<UserId>>,
}

impl MembershipStore for FailOnceOpen {
  type Error = crate::Error;

  async fn open_interval(
    &self,
    user: &UserId,
    group: &GroupId,
    at: DateTime<Utc>,
  ) -> crate::Result<MembershipInterval> {
    let fail = {
      let mut target = self.user.lock().unwrap();
      if target.as_ref() == Some(user) { target.take().is_some() } else { false }
    };
    if fail {
      return Err(CoreError::Store("disk I/O error".into()).into());
    }
    self.inner.open_interval(user, group, at).await
  }

  async fn close_interval(
    &self,
    user: &UserId,
    group: &GroupId,
    at: DateTime<Utc>,
  ) -> crate::Result<MembershipInterval> {
    self.inner.close_interval(user, group, at).await
  }

  async fn current_members(&self, group: &GroupId) -> crate::Result<HashSet<UserId>> {
    self.inner.current_members(group).await
  }

  async fn open_intervals(&self, group: &GroupId) -> crate::Result<Vec<MembershipInterval>> {
    self.inner.open_intervals(group).await
  }

  async fn history(
    &self,
    user: &UserId,
    group: Option<&GroupId>,
    include_inactive: bool,
  ) -> crate::Result<Vec<MembershipInterval>> {
    self.inner.history(user, group, include_inactive).await
  }

  async fn changes_since(
    &self,
    cutoff: DateTime<Utc>,
    group: Option<&GroupId>,
  ) -> crate::Result<Vec<MembershipInterval>> {
    self.inner.changes_since(cutoff, group).await
  }

  async fn upsert_profile(&self, profile: &MemberProfile, at: DateTime<Utc>) -> crate::Result<()> {
    self.inner.upsert_profile(profile, at).await
  }

  async fn profiles(&self, users: &[UserId]) -> crate::Result<HashMap<UserId, MemberProfile>> {
    self.inner.profiles(users).await
  }
}

#[tokio::test]
async fn failed_write_is_isolated_and_healed_next_tick() {
  let store = Arc::new(FailOnceOpen {
    inner: store().await,
    user:  Mutex::new(Some(uid("C"))),
  });
  let source = Arc::new(FakeSource::default());
  let clock = ManualClock::new(at(8, 0));
  let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&source), Arc::new(clock.clone()));
  let g = sun();
  store.inner.open_interval(&uid("A"), &g.id, at(1, 0)).await.unwrap();
  source.set("sun", &["B", "C", "D"]);

  let first = reconciler.tick(&g).await.unwrap();
  assert_eq!(first.opened, vec![uid("B"), uid("D")]);
  assert_eq!(first.closed, vec![uid("A")]);
  assert_eq!(first.failed.len(), 1);
  assert_eq!(first.failed[0].0, uid("C"));
  assert_eq!(
    store.current_members(&g.id).await.unwrap(),
    HashSet::from([uid("B"), uid("D")])
  );

  clock.set(at(8, 1));
  let second = reconciler.tick(&g).await.unwrap();
  assert_eq!(second.opened, vec![uid("C")]);
  assert!(second.closed.is_empty());
  assert!(second.failed.is_empty());
  assert_eq!(
    store.current_members(&g.id).await.unwrap(),
    HashSet::from([uid("B"), uid("C"), uid("D")])
  );
}

#[tokio::test]
async fn new_members_get_profiles() {
  let h = harness().await;
  let g = sun();
  h.source.set("sun", &["A", "B"]);
  h.reconciler.tick(&g).await.unwrap();

  let reports = Reports::new(Arc::clone(&h.store), Arc::new(h.clock.clone()));
  let members = reports.group_members(&g.id).await.unwrap();
  assert_eq!(members.len(), 2);
  assert!(members.iter().all(|m| {
    m.profile.as_ref().map(|p| p.username.as_str())
      == Some(format!("user-{}", m.interval.user_id).as_str())
  }));

  let changes = reports.membership_changes(at(7, 0), Some(&g.id)).await.unwrap();
  assert_eq!(changes.len(), 2);
}

#[tokio::test]
async fn run_loop_ticks_until_shutdown() {
  let h = harness().await;
  h.source.set("sun", &["A"]);
  let (tx, rx) = broadcast::channel(1);

  let reconciler = Arc::new(
    Reconciler::new(
      Arc::clone(&h.store),
      Arc::clone(&h.source),
      Arc::new(h.clock.clone()),
    )
    .with_interval(StdDuration::from_millis(20)),
  );
  let task = tokio::spawn(reconciler.run(vec![sun()], rx));

  tokio::time::sleep(StdDuration::from_millis(100)).await;
  tx.send(()).unwrap();
  tokio::time::timeout(StdDuration::from_secs(5), task)
    .await
    .expect("loop stops on shutdown")
    .unwrap();

  assert_eq!(
    h.store.current_members(&GroupId::from("sun")).await.unwrap(),
    HashSet::from([uid("A")])
  );
}
