use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use tokio_test::assert_ok;

use super::*;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// 2025-06-10T00:00:00Z
const DAY: Ms = 1_749_513_600_000;

fn at(hour: Ms, minute: Ms) -> Ms {
    DAY + hour * H + minute * M
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomledger_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn user_input(name: &str, email: &str) -> UserUpsert {
    UserUpsert {
        id: Ulid::new(),
        employee_id: None,
        name: name.into(),
        email: email.into(),
        phone: None,
        verified: Some(true),
    }
}

async fn add_room(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine.create_room(Room::new(id, name)).await.unwrap();
    id
}

async fn add_user(engine: &Engine, name: &str) -> Ulid {
    let email = format!("{}@example.com", name.to_lowercase());
    engine.upsert_user(user_input(name, &email)).await.unwrap().id()
}

/// Engine with one working room and one user.
async fn setup() -> (Engine, Ulid, Ulid) {
    let engine = Engine::in_memory();
    let room = add_room(&engine, "R1").await;
    let owner = add_user(&engine, "Alice").await;
    (engine, room, owner)
}

async fn book(engine: &Engine, room: Ulid, owner: Ulid, start: Ms, end: Ms) -> Result<Ulid, EngineError> {
    engine
        .create_booking(Ulid::new(), room, owner, start, end, "sync".into())
        .await
}

/// No two live bookings on a room overlap.
async fn assert_no_overlap(engine: &Engine, room: Ulid) {
    let bookings = engine.list_bookings_for_room(room, None).await.unwrap();
    let live: Vec<&Booking> = bookings.iter().filter(|b| b.is_active()).collect();
    for (i, a) in live.iter().enumerate() {
        for b in &live[i + 1..] {
            assert!(
                !a.span.overlaps(&b.span),
                "live bookings overlap: {:?} and {:?}",
                a.span,
                b.span
            );
        }
    }
}

// ── Literal scenarios ────────────────────────────────────

#[tokio::test]
async fn scenario_walkthrough() {
    let (engine, r1, owner) = setup().await;
    let a = book(&engine, r1, owner, at(9, 0), at(9, 30)).await.unwrap();

    // 1. Touching is not overlapping.
    assert_ok!(book(&engine, r1, owner, at(9, 30), at(10, 0)).await);

    // 2. Overlap reports booking A.
    match book(&engine, r1, owner, at(9, 15), at(9, 45)).await {
        Err(EngineError::BookingConflict { room_id, conflicts }) => {
            assert_eq!(room_id, r1);
            assert!(conflicts.iter().any(|b| b.id == a));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    // 3. Unchanged update excludes itself.
    let updated = engine
        .update_booking(a, at(9, 0), at(9, 30), None)
        .await
        .unwrap();
    assert_eq!(updated.span, Span::new(at(9, 0), at(9, 30)));
    assert_eq!(updated.title, "sync");

    // 4. Cancelled bookings free the slot.
    engine.cancel_booking(a).await.unwrap();
    assert_ok!(book(&engine, r1, owner, at(9, 0), at(9, 30)).await);

    // 5. Second cancel is NotFound and changes nothing.
    let before = engine.get_booking(&a).await.unwrap();
    assert!(matches!(
        engine.cancel_booking(a).await,
        Err(EngineError::NotFound(Entity::Booking, id)) if id == a
    ));
    assert_eq!(engine.get_booking(&a).await.unwrap(), before);

    // 6. Out-of-service room refuses bookings.
    let r2 = add_room(&engine, "R2").await;
    engine
        .update_room(
            r2,
            RoomPatch {
                is_working: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        book(&engine, r2, owner, at(14, 0), at(15, 0)).await,
        Err(EngineError::RoomUnavailable(id)) if id == r2
    ));
    assert!(engine.list_bookings_for_room(r2, None).await.unwrap().is_empty());

    assert_no_overlap(&engine, r1).await;
}

// ── Create ───────────────────────────────────────────────

#[tokio::test]
async fn create_rejects_bad_interval() {
    let (engine, room, owner) = setup().await;
    assert!(matches!(
        book(&engine, room, owner, at(10, 0), at(10, 0)).await,
        Err(EngineError::InvalidInterval { .. })
    ));
    assert!(matches!(
        book(&engine, room, owner, at(11, 0), at(10, 0)).await,
        Err(EngineError::InvalidInterval { .. })
    ));
    assert!(engine.list_bookings_for_room(room, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn create_requires_room_and_owner() {
    let (engine, room, owner) = setup().await;
    let ghost = Ulid::new();
    assert!(matches!(
        book(&engine, ghost, owner, at(9, 0), at(10, 0)).await,
        Err(EngineError::NotFound(Entity::Room, id)) if id == ghost
    ));
    assert!(matches!(
        book(&engine, room, ghost, at(9, 0), at(10, 0)).await,
        Err(EngineError::NotFound(Entity::User, id)) if id == ghost
    ));
}

#[tokio::test]
async fn create_rejects_duplicate_id_and_long_title() {
    let (engine, room, owner) = setup().await;
    let id = Ulid::new();
    engine
        .create_booking(id, room, owner, at(9, 0), at(10, 0), String::new())
        .await
        .unwrap();
    assert!(matches!(
        engine
            .create_booking(id, room, owner, at(11, 0), at(12, 0), String::new())
            .await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine
            .create_booking(Ulid::new(), room, owner, at(11, 0), at(12, 0), "x".repeat(MAX_TITLE_LEN + 1))
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn conflict_leaves_ledger_unchanged() {
    let (engine, room, owner) = setup().await;
    book(&engine, room, owner, at(9, 0), at(11, 0)).await.unwrap();
    let before = engine.list_bookings_for_room(room, None).await.unwrap();
    for (s, e) in [(at(8, 0), at(9, 1)), (at(10, 59), at(12, 0)), (at(9, 30), at(9, 45)), (at(8, 0), at(12, 0))] {
        assert!(matches!(
            book(&engine, room, owner, s, e).await,
            Err(EngineError::BookingConflict { .. })
        ));
    }
    assert_eq!(engine.list_bookings_for_room(room, None).await.unwrap(), before);
}

#[tokio::test]
async fn rooms_are_independent() {
    let (engine, r1, owner) = setup().await;
    let r2 = add_room(&engine, "R2").await;
    book(&engine, r1, owner, at(9, 0), at(10, 0)).await.unwrap();
    assert_ok!(book(&engine, r2, owner, at(9, 0), at(10, 0)).await);
}

// ── Update ───────────────────────────────────────────────

#[tokio::test]
async fn update_moves_and_retitles() {
    let (engine, room, owner) = setup().await;
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    let created = engine.get_booking(&id).await.unwrap();

    let moved = engine
        .update_booking(id, at(13, 0), at(14, 30), Some("planning".into()))
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(at(13, 0), at(14, 30)));
    assert_eq!(moved.title, "planning");
    assert_eq!(moved.owner_id, owner);
    assert_eq!(moved.created_at, created.created_at);
    assert!(moved.updated_at >= created.updated_at);

    // Old slot is free again.
    assert_ok!(book(&engine, room, owner, at(9, 0), at(10, 0)).await);
}

#[tokio::test]
async fn update_into_neighbour_conflicts_and_keeps_booking() {
    let (engine, room, owner) = setup().await;
    let a = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    let b = book(&engine, room, owner, at(10, 0), at(11, 0)).await.unwrap();

    match engine.update_booking(a, at(9, 0), at(10, 30), None).await {
        Err(EngineError::BookingConflict { conflicts, .. }) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].id, b);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    let a_now = engine.get_booking(&a).await.unwrap();
    assert_eq!(a_now.span, Span::new(at(9, 0), at(10, 0)));

    // Shrinking inside its own slot is fine.
    assert_ok!(engine.update_booking(a, at(9, 15), at(9, 45), None).await);
}

#[tokio::test]
async fn update_rejects_cancelled_missing_and_inverted() {
    let (engine, room, owner) = setup().await;
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();

    assert!(matches!(
        engine.update_booking(id, at(10, 0), at(9, 0), None).await,
        Err(EngineError::InvalidInterval { .. })
    ));
    assert!(matches!(
        engine.update_booking(Ulid::new(), at(9, 0), at(10, 0), None).await,
        Err(EngineError::NotFound(Entity::Booking, _))
    ));
    engine.cancel_booking(id).await.unwrap();
    assert!(matches!(
        engine.update_booking(id, at(11, 0), at(12, 0), None).await,
        Err(EngineError::NotFound(Entity::Booking, _))
    ));
}

// ── Cancel / delete ──────────────────────────────────────

#[tokio::test]
async fn cancelled_booking_stays_listed_and_flagged() {
    let (engine, room, owner) = setup().await;
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    engine.cancel_booking(id).await.unwrap();

    let listed = engine.list_bookings_for_room(room, None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_cancelled);

    let verdict = engine
        .check_availability(room, at(9, 0), at(10, 0), None)
        .await
        .unwrap();
    assert!(verdict.is_free);
}

#[tokio::test]
async fn delete_is_hard_and_not_repeatable() {
    let (engine, room, owner) = setup().await;
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    engine.delete_booking(id).await.unwrap();
    assert!(engine.get_booking(&id).await.is_none());
    assert!(engine.list_bookings_for_room(room, None).await.unwrap().is_empty());
    assert!(matches!(
        engine.delete_booking(id).await,
        Err(EngineError::NotFound(Entity::Booking, _))
    ));

    // Cancelled bookings can still be deleted.
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    engine.cancel_booking(id).await.unwrap();
    assert_ok!(engine.delete_booking(id).await);
}

#[tokio::test]
async fn deleting_room_or_owner_keeps_bookings() {
    let (engine, room, owner) = setup().await;
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();

    engine.delete_user(owner).await.unwrap();
    engine.delete_room(room).await.unwrap();

    assert!(engine.get_room(&room).is_none());
    assert!(engine.get_booking(&id).await.is_some());
    let listed = engine.list_bookings_for_room(room, None).await.unwrap();
    assert_eq!(listed.len(), 1);

    let page = engine
        .list_bookings_for_owner(owner, Pagination::default(), BookingSort::default())
        .await;
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].room_name, None);
    assert_eq!(page.items[0].owner_name, None);

    // Deleted room takes no new bookings.
    assert!(matches!(
        book(&engine, room, owner, at(11, 0), at(12, 0)).await,
        Err(EngineError::NotFound(Entity::Room, _))
    ));
}

// ── Listings ─────────────────────────────────────────────

#[tokio::test]
async fn room_listing_filters_by_range() {
    let (engine, room, owner) = setup().await;
    for h in [8, 10, 12, 14] {
        book(&engine, room, owner, at(h, 0), at(h + 1, 0)).await.unwrap();
    }
    let hits = engine
        .list_bookings_for_room(room, Some((at(10, 30), at(13, 0))))
        .await
        .unwrap();
    let starts: Vec<Ms> = hits.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![at(10, 0), at(12, 0)]);

    assert!(matches!(
        engine.list_bookings_for_room(room, Some((at(13, 0), at(10, 0)))).await,
        Err(EngineError::InvalidInterval { .. })
    ));
    assert!(matches!(
        engine.list_bookings_for_room(Ulid::new(), None).await,
        Err(EngineError::NotFound(Entity::Room, _))
    ));
}

#[tokio::test]
async fn owner_listing_pages_with_true_total() {
    let (engine, room, owner) = setup().await;
    let other = add_user(&engine, "Bob").await;
    for i in 0..25 {
        book(&engine, room, owner, at(0, 0) + i * H, at(0, 30) + i * H)
            .await
            .unwrap();
    }
    book(&engine, room, other, at(0, 30), at(0, 45)).await.unwrap();

    let first = engine
        .list_bookings_for_owner(owner, Pagination::new(Some(0), Some(10)), BookingSort::default())
        .await;
    assert_eq!(first.total, 25);
    assert_eq!(first.items.len(), 10);
    assert!(first.has_more);
    // Default: start_time descending.
    assert_eq!(first.items[0].booking.span.start, at(0, 0) + 24 * H);
    assert_eq!(first.items[0].room_name.as_deref(), Some("R1"));
    assert_eq!(first.items[0].owner_name.as_deref(), Some("Alice"));

    let last = engine
        .list_bookings_for_owner(owner, Pagination::new(Some(20), Some(10)), BookingSort::default())
        .await;
    assert_eq!(last.total, 25);
    assert_eq!(last.items.len(), 5);
    assert!(!last.has_more);

    let past_end = engine
        .list_bookings_for_owner(owner, Pagination::new(Some(40), None), BookingSort::default())
        .await;
    assert!(past_end.items.is_empty());
    assert_eq!(past_end.total, 25);
}

#[tokio::test]
async fn owner_listing_sorts_on_allow_list() {
    let (engine, _, owner) = setup().await;
    let zulu = add_room(&engine, "Zulu").await;
    let alpha = add_room(&engine, "Alpha").await;
    book(&engine, zulu, owner, at(9, 0), at(10, 0)).await.unwrap();
    book(&engine, alpha, owner, at(11, 0), at(12, 0)).await.unwrap();

    let by_room = engine
        .list_bookings_for_owner(
            owner,
            Pagination::default(),
            BookingSort {
                field: BookingSortField::parse("roomName"),
                order: SortOrder::Asc,
            },
        )
        .await;
    let names: Vec<_> = by_room.items.iter().map(|v| v.room_name.clone().unwrap()).collect();
    assert_eq!(names, vec!["Alpha", "Zulu"]);

    // Unknown field falls back to start_time.
    let fallback = engine
        .list_bookings_for_owner(
            owner,
            Pagination::default(),
            BookingSort {
                field: BookingSortField::parse("1; DROP TABLE bookings"),
                order: SortOrder::Asc,
            },
        )
        .await;
    let starts: Vec<Ms> = fallback.items.iter().map(|v| v.booking.span.start).collect();
    assert_eq!(starts, vec![at(9, 0), at(11, 0)]);
}

#[tokio::test]
async fn identical_sort_keys_page_stably() {
    let (engine, _, owner) = setup().await;
    for i in 0..6 {
        let room = add_room(&engine, &format!("Room{i}")).await;
        book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    }
    let mut seen = Vec::new();
    for offset in [0, 2, 4] {
        let page = engine
            .list_bookings_for_owner(owner, Pagination::new(Some(offset), Some(2)), BookingSort::default())
            .await;
        seen.extend(page.items.into_iter().map(|v| v.booking.id));
    }
    let mut unique = seen.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 6);
}

// ── Availability / free slots ────────────────────────────

#[tokio::test]
async fn availability_reports_conflicts_and_excludes() {
    let (engine, room, owner) = setup().await;
    let a = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();

    let verdict = engine
        .check_availability(room, at(9, 30), at(10, 30), None)
        .await
        .unwrap();
    assert!(!verdict.is_free);
    assert_eq!(verdict.conflicts[0].id, a);

    let verdict = engine
        .check_availability(room, at(9, 30), at(10, 30), Some(a))
        .await
        .unwrap();
    assert!(verdict.is_free);

    assert!(matches!(
        engine.check_availability(room, at(10, 0), at(9, 0), None).await,
        Err(EngineError::InvalidInterval { .. })
    ));
}

#[tokio::test]
async fn free_slots_respect_min_duration_and_working_flag() {
    let (engine, room, owner) = setup().await;
    book(&engine, room, owner, at(9, 0), at(9, 50)).await.unwrap();
    book(&engine, room, owner, at(10, 0), at(12, 0)).await.unwrap();

    let slots = engine
        .compute_free_slots(room, at(8, 0), at(13, 0), None)
        .await
        .unwrap();
    assert_eq!(
        slots,
        vec![
            Span::new(at(8, 0), at(9, 0)),
            Span::new(at(9, 50), at(10, 0)),
            Span::new(at(12, 0), at(13, 0)),
        ]
    );

    let long = engine
        .compute_free_slots(room, at(8, 0), at(13, 0), Some(30 * M))
        .await
        .unwrap();
    assert_eq!(long.len(), 2);

    engine
        .update_room(room, RoomPatch { is_working: Some(false), ..Default::default() })
        .await
        .unwrap();
    assert!(engine
        .compute_free_slots(room, at(8, 0), at(13, 0), None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn free_slot_window_is_bounded() {
    let (engine, room, _) = setup().await;
    assert!(matches!(
        engine.compute_free_slots(room, 0, MAX_QUERY_WINDOW_MS + 1, None).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Registries ───────────────────────────────────────────

#[tokio::test]
async fn room_registry_crud() {
    let engine = Engine::in_memory();
    let id = add_room(&engine, "Orion").await;
    assert!(matches!(
        engine.create_room(Room::new(id, "Again")).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.create_room(Room::new(Ulid::new(), "  ")).await,
        Err(EngineError::InvalidInput(_))
    ));

    let room = engine
        .update_room(
            id,
            RoomPatch {
                capacity: Some(12),
                has_tv: Some(true),
                location: Some(Some("4F east".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(room.capacity, 12);
    assert!(room.has_tv);
    assert_eq!(engine.get_room(&id), Some(room));

    add_room(&engine, "Andromeda").await;
    let names: Vec<_> = engine.list_rooms().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["Andromeda", "Orion"]);

    engine.delete_room(id).await.unwrap();
    assert!(matches!(
        engine.delete_room(id).await,
        Err(EngineError::NotFound(Entity::Room, _))
    ));
    assert_eq!(engine.room_count(), 1);
}

#[tokio::test]
async fn upsert_by_email_keeps_id() {
    let engine = Engine::in_memory();
    let first = engine
        .upsert_user(user_input("Alice", "Alice@Example.com "))
        .await
        .unwrap();
    assert!(matches!(first, UpsertOutcome::Inserted(_)));
    let created_at = engine.get_user(&first.id()).unwrap().created_at;

    let mut again = user_input("Alice Smith", "alice@example.com");
    again.phone = Some("+7 900 000 00 00".into());
    let second = engine.upsert_user(again).await.unwrap();
    assert_eq!(second, UpsertOutcome::Updated(first.id()));

    let user = engine.find_user_by_email("ALICE@example.com").unwrap();
    assert_eq!(user.id, first.id());
    assert_eq!(user.name, "Alice Smith");
    assert_eq!(user.created_at, created_at);
    assert_eq!(engine.user_count(), 1);

    assert!(matches!(
        engine.upsert_user(user_input("Nobody", "not-an-email")).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn user_listing_searches_sorts_and_pages() {
    let engine = Engine::in_memory();
    for (name, phone, emp) in [
        ("Charlie", "111", "E-3"),
        ("alice", "222", "E-1"),
        ("Bob", "333", "E-2"),
    ] {
        let mut input = user_input(name, &format!("{}@corp.io", name.to_lowercase()));
        input.phone = Some(phone.into());
        input.employee_id = Some(emp.into());
        engine.upsert_user(input).await.unwrap();
    }

    let all = engine.list_users(None, UserSort::default(), Pagination::default());
    let names: Vec<_> = all.items.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["alice", "Bob", "Charlie"]);
    assert_eq!(all.total, 3);

    let hit = engine.list_users(Some("22"), UserSort::default(), Pagination::default());
    assert_eq!(hit.total, 1);
    assert_eq!(hit.items[0].name, "alice");

    let by_emp = engine.list_users(
        Some("e-"),
        UserSort {
            field: UserSortField::parse("employeeId"),
            order: SortOrder::Desc,
        },
        Pagination::new(None, Some(2)),
    );
    assert_eq!(by_emp.total, 3);
    assert!(by_emp.has_more);
    assert_eq!(by_emp.items[0].name, "Charlie");
    assert_eq!(by_emp.items[1].name, "Bob");
}

#[tokio::test]
async fn delete_user_frees_email() {
    let engine = Engine::in_memory();
    let id = add_user(&engine, "Dora").await;
    engine.delete_user(id).await.unwrap();
    assert!(engine.find_user_by_email("dora@example.com").is_none());
    let again = engine
        .upsert_user(user_input("Dora", "dora@example.com"))
        .await
        .unwrap();
    assert!(matches!(again, UpsertOutcome::Inserted(new_id) if new_id != id));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_overlapping_creates_admit_exactly_one() {
    for _ in 0..20 {
        let (engine, room, owner) = setup().await;
        let engine = Arc::new(engine);
        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                book(&engine, room, owner, at(9, 0) + i * M, at(10, 0) + i * M).await
            }));
        }
        let mut wins = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => wins += 1,
                Err(EngineError::BookingConflict { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(wins, 1);
        assert_no_overlap(&engine, room).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_creates_all_succeed() {
    let (engine, room, owner) = setup().await;
    let engine = Arc::new(engine);
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            book(&engine, room, owner, at(0, 0) + i * H, at(0, 0) + (i + 1) * H).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_bookings_for_room(room, None).await.unwrap().len(), 16);
    assert_no_overlap(&engine, room).await;
}

#[tokio::test]
async fn random_operation_sequence_keeps_invariant() {
    let (engine, room, owner) = setup().await;
    let mut ids = Vec::new();
    // Deterministic pseudo-random walk over create/update/cancel/delete.
    let mut seed: u64 = 0x5eed;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };
    for _ in 0..400 {
        let start = at(8, 0) + (next() % 40) as Ms * 15 * M;
        let end = start + (1 + next() % 6) as Ms * 15 * M;
        match next() % 4 {
            0 | 1 => {
                if let Ok(id) = book(&engine, room, owner, start, end).await {
                    ids.push(id);
                }
            }
            2 if !ids.is_empty() => {
                let id = ids[(next() as usize) % ids.len()];
                let _ = engine.update_booking(id, start, end, None).await;
            }
            3 if !ids.is_empty() => {
                let id = ids[(next() as usize) % ids.len()];
                if next() % 2 == 0 {
                    let _ = engine.cancel_booking(id).await;
                } else {
                    let _ = engine.delete_booking(id).await;
                }
            }
            _ => {}
        }
        assert_no_overlap(&engine, room).await;
    }
}

// ── Journal ──────────────────────────────────────────────

/// Journal that fails every append once switched off.
#[derive(Default)]
struct FlakyJournal {
    broken: AtomicBool,
    inner: MemoryJournal,
}

#[async_trait]
impl Journal for FlakyJournal {
    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        if self.broken.load(AtomicOrdering::SeqCst) {
            return Err(EngineError::StorageError("disk on fire".into()));
        }
        self.inner.append(event).await
    }

    async fn compact(&self, snapshot: Vec<Event>) -> Result<(), EngineError> {
        self.inner.compact(snapshot).await
    }

    async fn appends_since_compact(&self) -> u64 {
        self.inner.appends_since_compact().await
    }
}

#[tokio::test]
async fn journal_failure_leaves_state_unchanged() {
    let journal = Arc::new(FlakyJournal::default());
    let engine = Engine::new(journal.clone(), &[]);
    let room = add_room(&engine, "R1").await;
    let owner = add_user(&engine, "Alice").await;
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    let before = engine.list_bookings_for_room(room, None).await.unwrap();

    journal.broken.store(true, AtomicOrdering::SeqCst);
    let err = book(&engine, room, owner, at(11, 0), at(12, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::StorageError(_)));
    assert!(err.is_transient());
    assert!(engine.update_booking(id, at(13, 0), at(14, 0), None).await.is_err());
    assert!(engine.cancel_booking(id).await.is_err());
    assert!(engine.delete_booking(id).await.is_err());
    assert!(engine.create_room(Room::new(Ulid::new(), "R9")).await.is_err());
    assert!(engine.delete_user(owner).await.is_err());

    assert_eq!(engine.list_bookings_for_room(room, None).await.unwrap(), before);
    assert_eq!(engine.room_count(), 1);
    assert!(engine.get_user(&owner).is_some());

    journal.broken.store(false, AtomicOrdering::SeqCst);
    assert_ok!(book(&engine, room, owner, at(11, 0), at(12, 0)).await);
}

/// Journal that holds every booking insert for a while before accepting it.
#[derive(Default)]
struct StallingJournal {
    inner: MemoryJournal,
}

#[async_trait]
impl Journal for StallingJournal {
    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        if matches!(event, Event::BookingCreated { .. }) {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        self.inner.append(event).await
    }

    async fn compact(&self, snapshot: Vec<Event>) -> Result<(), EngineError> {
        self.inner.compact(snapshot).await
    }

    async fn appends_since_compact(&self) -> u64 {
        self.inner.appends_since_compact().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_booking_id_on_two_rooms_only_lands_once() {
    let engine = Arc::new(Engine::new(Arc::new(StallingJournal::default()), &[]));
    let room_a = add_room(&engine, "R1").await;
    let room_b = add_room(&engine, "R2").await;
    let owner = add_user(&engine, "Alice").await;
    let id = Ulid::new();

    let handles: Vec<_> = [room_a, room_b]
        .into_iter()
        .map(|room| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_booking(id, room, owner, at(9, 0), at(10, 0), String::new())
                    .await
            })
        })
        .collect();
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::AlreadyExists(dup)) if *dup == id)));

    let mut copies = 0;
    for room in [room_a, room_b] {
        let bookings = engine.list_bookings_for_room(room, None).await.unwrap();
        copies += bookings.iter().filter(|b| b.id == id).count();
    }
    assert_eq!(copies, 1);

    assert_ok!(engine.cancel_booking(id).await);
    for room in [room_a, room_b] {
        let bookings = engine.list_bookings_for_room(room, None).await.unwrap();
        assert!(bookings.iter().all(|b| !b.is_active()));
    }
}

#[tokio::test]
async fn rejected_create_releases_its_id() {
    let journal = Arc::new(FlakyJournal::default());
    let engine = Engine::new(journal.clone(), &[]);
    let room_a = add_room(&engine, "R1").await;
    let room_b = add_room(&engine, "R2").await;
    let owner = add_user(&engine, "Alice").await;
    book(&engine, room_a, owner, at(9, 0), at(10, 0)).await.unwrap();

    let id = Ulid::new();
    let clash = engine
        .create_booking(id, room_a, owner, at(9, 30), at(10, 30), String::new())
        .await;
    assert!(matches!(clash, Err(EngineError::BookingConflict { .. })));

    journal.broken.store(true, AtomicOrdering::SeqCst);
    let failed = engine
        .create_booking(id, room_b, owner, at(9, 0), at(10, 0), String::new())
        .await;
    assert!(matches!(failed, Err(EngineError::StorageError(_))));
    assert!(engine.get_booking(&id).await.is_none());
    journal.broken.store(false, AtomicOrdering::SeqCst);

    assert_ok!(
        engine
            .create_booking(id, room_b, owner, at(9, 0), at(10, 0), String::new())
            .await
    );
    assert_eq!(engine.get_booking(&id).await.map(|b| b.room_id), Some(room_b));
}

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (room, owner, kept, cancelled, deleted);
    {
        let engine = Engine::open(&path).unwrap();
        room = add_room(&engine, "R1").await;
        owner = add_user(&engine, "Alice").await;
        kept = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
        cancelled = book(&engine, room, owner, at(10, 0), at(11, 0)).await.unwrap();
        deleted = book(&engine, room, owner, at(11, 0), at(12, 0)).await.unwrap();
        engine
            .update_booking(kept, at(8, 0), at(9, 0), Some("moved".into()))
            .await
            .unwrap();
        engine.cancel_booking(cancelled).await.unwrap();
        engine.delete_booking(deleted).await.unwrap();
    }

    let engine = Engine::open(&path).unwrap();
    assert_eq!(engine.get_room(&room).unwrap().name, "R1");
    assert_eq!(engine.find_user_by_email("alice@example.com").unwrap().id, owner);
    let k = engine.get_booking(&kept).await.unwrap();
    assert_eq!(k.span, Span::new(at(8, 0), at(9, 0)));
    assert_eq!(k.title, "moved");
    assert!(engine.get_booking(&cancelled).await.unwrap().is_cancelled);
    assert!(engine.get_booking(&deleted).await.is_none());

    // Replayed ledger still enforces the invariant.
    assert!(matches!(
        book(&engine, room, owner, at(8, 30), at(9, 30)).await,
        Err(EngineError::BookingConflict { .. })
    ));
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let (room, owner, live, cancelled);
    {
        let engine = Engine::open(&path).unwrap();
        room = add_room(&engine, "R1").await;
        owner = add_user(&engine, "Alice").await;
        for i in 0..10 {
            let id = book(&engine, room, owner, at(0, 0) + i * H, at(1, 0) + i * H)
                .await
                .unwrap();
            engine.delete_booking(id).await.unwrap();
        }
        live = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
        cancelled = book(&engine, room, owner, at(10, 0), at(11, 0)).await.unwrap();
        engine.cancel_booking(cancelled).await.unwrap();
        let gone = add_room(&engine, "Gone").await;
        engine.delete_room(gone).await.unwrap();

        let size_before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.journal_appends_since_compact().await > 20);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.journal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < size_before);

        // Appends after compaction land in the new file.
        engine
            .update_booking(live, at(9, 0), at(9, 30), None)
            .await
            .unwrap();
    }

    let engine = Engine::open(&path).unwrap();
    assert_eq!(engine.room_count(), 1);
    assert!(engine.get_user(&owner).is_some());
    assert_eq!(
        engine.get_booking(&live).await.unwrap().span,
        Span::new(at(9, 0), at(9, 30))
    );
    assert!(engine.get_booking(&cancelled).await.unwrap().is_cancelled);
    assert_eq!(engine.list_bookings_for_room(room, None).await.unwrap().len(), 2);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn memory_journal_replay_matches() {
    let journal = Arc::new(MemoryJournal::new());
    let engine = Engine::new(journal.clone(), &[]);
    let room = add_room(&engine, "R1").await;
    let owner = add_user(&engine, "Alice").await;
    let id = book(&engine, room, owner, at(9, 0), at(10, 0)).await.unwrap();
    engine.cancel_booking(id).await.unwrap();

    let replayed = Engine::new(Arc::new(MemoryJournal::new()), &journal.events().await);
    assert_eq!(
        replayed.list_bookings_for_room(room, None).await.unwrap(),
        engine.list_bookings_for_room(room, None).await.unwrap()
    );
    assert_eq!(replayed.get_user(&owner), engine.get_user(&owner));
}
