use super::*;
use crate::catalog::TargetError;
use crate::limits::{MAX_NOTES_LEN, MAX_PRICE_CENTS, MAX_RESERVATION_QUANTITY, MAX_STOCK_QUANTITY};
use crate::reservation::Action;
use crate::restock::{RestockAction, RestockStatus};
use crate::schedule::{MinuteOfDay, ScheduleStatus};
use crate::transfer::{TransferAction, TransferStatus};
use tokio_test::{assert_err, assert_ok};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("branchledger_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// One product, one branch, `stock` units on the shelf.
struct Shop {
    engine: Arc<Engine>,
    product: Ulid,
    branch: Ulid,
    admin: Actor,
}

impl Shop {
    async fn open(name: &str, stock: u32) -> Self {
        Self::open_at(test_wal_path(name), stock).await
    }

    async fn open_at(path: PathBuf, stock: u32) -> Self {
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
        let product = Ulid::new();
        let branch = Ulid::new();
        engine
            .register_branch(branch, "CBU".into(), "Cebu".into(), true)
            .await
            .unwrap();
        engine
            .register_product(product, "Progressive lens".into(), Some("lenses".into()), 2500, true)
            .await
            .unwrap();
        engine.set_stock(product, branch, stock).await.unwrap();
        Self {
            engine,
            product,
            branch,
            admin: Actor::admin(Ulid::new()),
        }
    }

    async fn reserve(&self, quantity: u32) -> Result<Reservation, EngineError> {
        self.engine
            .create(Ulid::new(), Ulid::new(), self.product, self.branch, quantity, None)
            .await
    }

    async fn row(&self) -> StockInfo {
        self.engine.stock(self.product, self.branch).await.unwrap()
    }

    fn staff(&self) -> Actor {
        Actor::staff(Ulid::new(), vec![self.branch])
    }
}

// ── Ledger scenario and properties ───────────────────────

#[tokio::test]
async fn reserve_fulfill_reserve_scenario() {
    let shop = Shop::open("scenario.wal", 5).await;

    let first = assert_ok!(shop.reserve(3).await);
    let row = shop.row().await;
    assert_eq!((row.reserved_quantity, row.available_quantity), (3, 2));

    let err = assert_err!(shop.reserve(4).await);
    assert!(matches!(
        err,
        EngineError::InsufficientStock {
            requested: 4,
            available: 2
        }
    ));

    assert_ok!(shop.engine.approve(first.id, &shop.admin).await);
    let fulfilled = assert_ok!(shop.engine.fulfill(first.id, &shop.admin).await);
    assert_eq!(fulfilled.status, ReservationStatus::Fulfilled);
    let row = shop.row().await;
    assert_eq!((row.stock_quantity, row.reserved_quantity), (2, 0));

    assert_ok!(shop.reserve(2).await);
    let row = shop.row().await;
    assert_eq!((row.reserved_quantity, row.available_quantity), (2, 0));

    let err = assert_err!(shop.reserve(1).await);
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
    assert!(shop.engine.verify_ledger().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_units_are_never_oversold() {
    let shop = Shop::open("oversell.wal", 5).await;
    let k = 40;

    let mut handles = Vec::new();
    for _ in 0..k {
        let engine = shop.engine.clone();
        let (product, branch) = (shop.product, shop.branch);
        handles.push(tokio::spawn(async move {
            engine
                .create(Ulid::new(), Ulid::new(), product, branch, 1, None)
                .await
        }));
    }

    let mut ok = 0;
    let mut short = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InsufficientStock { .. }) => short += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(short, k - 5);
    let row = shop.row().await;
    assert_eq!((row.stock_quantity, row.reserved_quantity), (5, 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_row_creators_share_one_row() {
    let shop = Shop::open("get_or_create.wal", 0).await;
    let other_branch = Ulid::new();
    shop.engine
        .register_branch(other_branch, "DVO".into(), "Davao".into(), true)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = shop.engine.clone();
        let product = shop.product;
        handles.push(tokio::spawn(async move {
            engine.get_or_create(product, other_branch).await
        }));
    }
    for h in handles {
        let row = h.await.unwrap().unwrap();
        assert_eq!((row.stock_quantity, row.reserved_quantity), (0, 0));
    }
    assert_eq!(shop.engine.branch_stock(Some(shop.product), Some(other_branch)).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_release_once() {
    let shop = Shop::open("double_cancel.wal", 4).await;
    let user = Ulid::new();
    let r = shop
        .engine
        .create(Ulid::new(), user, shop.product, shop.branch, 3, None)
        .await
        .unwrap();
    let id = r.id;

    let requester = Actor::customer(user);
    let a = {
        let engine = shop.engine.clone();
        let actor = requester.clone();
        tokio::spawn(async move { engine.cancel(id, &actor).await })
    };
    let b = {
        let engine = shop.engine.clone();
        let actor = shop.admin.clone();
        tokio::spawn(async move { engine.cancel(id, &actor).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::InvalidTransition { .. }))));
    assert_eq!(shop.row().await.reserved_quantity, 0);
}

#[tokio::test]
async fn terminal_reservations_refuse_further_transitions() {
    let shop = Shop::open("terminal.wal", 10).await;
    let r = shop.reserve(4).await.unwrap();
    let rejected = assert_ok!(
        shop.engine
            .reject(r.id, &shop.admin, Some("frame discontinued".into()))
            .await
    );
    assert_eq!(rejected.admin_notes.as_deref(), Some("frame discontinued"));
    assert!(rejected.rejected_at.is_some());
    let before = shop.row().await;

    for action in [Action::Approve, Action::Reject, Action::Cancel, Action::Fulfill] {
        let err = assert_err!(shop.engine.transition(r.id, &shop.admin, action, None).await);
        assert!(
            matches!(err, EngineError::InvalidTransition { from: "rejected", .. }),
            "{action}: {err}"
        );
    }
    assert_eq!(shop.row().await, before);
}

#[tokio::test]
async fn fulfillment_consumes_and_release_restores() {
    let shop = Shop::open("consume_restore.wal", 10).await;

    let pending = shop.reserve(2).await.unwrap();
    let approved = shop.reserve(3).await.unwrap();
    let to_fulfill = shop.reserve(4).await.unwrap();
    assert_eq!(shop.row().await.reserved_quantity, 9);

    shop.engine.reject(pending.id, &shop.admin, None).await.unwrap();
    let row = shop.row().await;
    assert_eq!((row.stock_quantity, row.reserved_quantity), (10, 7));

    shop.engine.approve(approved.id, &shop.admin).await.unwrap();
    shop.engine.cancel(approved.id, &shop.admin).await.unwrap();
    let row = shop.row().await;
    assert_eq!((row.stock_quantity, row.reserved_quantity), (10, 4));

    shop.engine.approve(to_fulfill.id, &shop.admin).await.unwrap();
    shop.engine.fulfill(to_fulfill.id, &shop.admin).await.unwrap();
    let row = shop.row().await;
    assert_eq!((row.stock_quantity, row.reserved_quantity), (6, 0));
}

#[tokio::test]
async fn fulfilling_a_pending_reservation_is_invalid() {
    let shop = Shop::open("fulfill_pending.wal", 3).await;
    let r = shop.reserve(1).await.unwrap();
    let err = assert_err!(shop.engine.fulfill(r.id, &shop.admin).await);
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: "pending",
            action: "fulfill",
            ..
        }
    ));
}

#[tokio::test]
async fn reserved_always_matches_open_reservations() {
    let shop = Shop::open("conservation.wal", 50).await;
    let mut ids = Vec::new();
    for q in 1..=6 {
        ids.push(shop.reserve(q).await.unwrap().id);
    }
    shop.engine.approve(ids[0], &shop.admin).await.unwrap();
    shop.engine.approve(ids[1], &shop.admin).await.unwrap();
    shop.engine.fulfill(ids[1], &shop.admin).await.unwrap();
    shop.engine.reject(ids[2], &shop.admin, None).await.unwrap();
    shop.engine.cancel(ids[3], &shop.admin).await.unwrap();

    let open: u32 = shop
        .engine
        .list_reservations(&ReservationFilter::default())
        .await
        .iter()
        .filter(|r| r.status.holds_stock())
        .map(|r| r.quantity)
        .sum();
    let row = shop.row().await;
    assert_eq!(row.reserved_quantity, open);
    assert_eq!(open, 1 + 5 + 6);
    assert_eq!(row.stock_quantity, 48);
    assert!(shop.engine.verify_ledger().await.is_empty());
}

// ── Authority and validation ─────────────────────────────

#[tokio::test]
async fn branch_authority_is_enforced() {
    let shop = Shop::open("authority.wal", 5).await;
    let user = Ulid::new();
    let r = shop
        .engine
        .create(Ulid::new(), user, shop.product, shop.branch, 1, None)
        .await
        .unwrap();

    let outsider = Actor::staff(Ulid::new(), vec![Ulid::new()]);
    let err = assert_err!(shop.engine.approve(r.id, &outsider).await);
    assert!(matches!(err, EngineError::Forbidden(_)));

    let customer = Actor::customer(user);
    let err = assert_err!(shop.engine.approve(r.id, &customer).await);
    assert!(matches!(err, EngineError::Forbidden(_)));

    let stranger = Actor::customer(Ulid::new());
    let err = assert_err!(shop.engine.cancel(r.id, &stranger).await);
    assert!(matches!(err, EngineError::Forbidden(_)));

    // A forbidden attempt leaves the reservation pending.
    assert_eq!(
        shop.engine.get_reservation(r.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    let staff = shop.staff();
    let approved = assert_ok!(shop.engine.approve(r.id, &staff).await);
    assert_eq!(approved.last_actor, Some(staff.user_id));
    assert_ok!(shop.engine.cancel(r.id, &customer).await);
}

#[tokio::test]
async fn inactive_or_unknown_targets_are_refused() {
    let shop = Shop::open("targets.wal", 5).await;

    let unknown = Ulid::new();
    let err = assert_err!(
        shop.engine
            .create(Ulid::new(), Ulid::new(), unknown, shop.branch, 1, None)
            .await
    );
    assert!(matches!(err, EngineError::InvalidTarget(TargetError::UnknownProduct(p)) if p == unknown));

    shop.engine.set_branch_active(shop.branch, false).await.unwrap();
    let err = assert_err!(shop.reserve(1).await);
    assert!(matches!(err, EngineError::InvalidTarget(TargetError::InactiveBranch(_))));

    shop.engine.set_branch_active(shop.branch, true).await.unwrap();
    shop.engine.set_product_active(shop.product, false).await.unwrap();
    let err = assert_err!(shop.reserve(1).await);
    assert!(matches!(err, EngineError::InvalidTarget(TargetError::InactiveProduct(_))));

    assert_eq!(shop.row().await.reserved_quantity, 0);
}

#[tokio::test]
async fn quantity_and_notes_limits() {
    let shop = Shop::open("limits.wal", 5).await;
    let err = assert_err!(shop.reserve(0).await);
    assert!(matches!(err, EngineError::Invalid(_)));
    let err = assert_err!(shop.reserve(MAX_RESERVATION_QUANTITY + 1).await);
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let long = "x".repeat(MAX_NOTES_LEN + 1);
    let err = assert_err!(
        shop.engine
            .create(Ulid::new(), Ulid::new(), shop.product, shop.branch, 1, Some(long))
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn one_pending_reservation_per_user_and_product() {
    let shop = Shop::open("duplicate_pending.wal", 10).await;
    let other_branch = Ulid::new();
    shop.engine
        .register_branch(other_branch, "ILO".into(), "Iloilo".into(), true)
        .await
        .unwrap();
    shop.engine.set_stock(shop.product, other_branch, 10).await.unwrap();

    let user = Ulid::new();
    let first = shop
        .engine
        .create(Ulid::new(), user, shop.product, shop.branch, 1, None)
        .await
        .unwrap();
    let err = assert_err!(
        shop.engine
            .create(Ulid::new(), user, shop.product, other_branch, 1, None)
            .await
    );
    assert!(matches!(err, EngineError::DuplicatePending(id) if id == first.id));

    // Once approved, the claim is released.
    shop.engine.approve(first.id, &shop.admin).await.unwrap();
    assert_ok!(
        shop.engine
            .create(Ulid::new(), user, shop.product, other_branch, 1, None)
            .await
    );
}

#[tokio::test]
async fn reservation_ids_are_unique() {
    let shop = Shop::open("reused_id.wal", 10).await;
    let id = Ulid::new();
    shop.engine
        .create(id, Ulid::new(), shop.product, shop.branch, 1, None)
        .await
        .unwrap();
    let err = assert_err!(
        shop.engine
            .create(id, Ulid::new(), shop.product, shop.branch, 1, None)
            .await
    );
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    assert_eq!(shop.row().await.reserved_quantity, 1);
}

#[tokio::test]
async fn stale_availability_ceiling() {
    let shop = Shop::open("ceiling.wal", 10).await;
    shop.reserve(7).await.unwrap();

    // The caller saw 5 available; only 3 are left, still enough for 2.
    assert_ok!(
        shop.engine
            .create_bounded(Ulid::new(), Ulid::new(), shop.product, shop.branch, 2, None, Some(5))
            .await
    );
    let err = assert_err!(
        shop.engine
            .create_bounded(Ulid::new(), Ulid::new(), shop.product, shop.branch, 1, None, Some(0))
            .await
    );
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
}

// ── Stock administration ─────────────────────────────────

#[tokio::test]
async fn stock_cannot_drop_below_reserved() {
    let shop = Shop::open("below_reserved.wal", 8).await;
    shop.reserve(6).await.unwrap();
    let err = assert_err!(shop.engine.set_stock(shop.product, shop.branch, 5).await);
    assert!(matches!(err, EngineError::BelowReserved { stock: 5, reserved: 6 }));
    assert_ok!(shop.engine.set_stock(shop.product, shop.branch, 6).await);
    assert_eq!(shop.row().await.available_quantity, 0);
}

#[tokio::test]
async fn bulk_stock_is_all_or_nothing() {
    let shop = Shop::open("bulk.wal", 4).await;
    let b2 = Ulid::new();
    let b3 = Ulid::new();
    for (b, code) in [(b2, "BAG"), (b3, "TAC")] {
        shop.engine
            .register_branch(b, code.into(), code.into(), true)
            .await
            .unwrap();
    }
    shop.reserve(3).await.unwrap();

    let err = assert_err!(
        shop.engine
            .set_stock_bulk(shop.product, vec![(b2, 9), (shop.branch, 1), (b3, 9)])
            .await
    );
    assert!(matches!(err, EngineError::BelowReserved { .. }));
    assert_eq!(
        shop.engine.stock(shop.product, b2).await.map(|s| s.stock_quantity),
        Some(0)
    );
    assert_eq!(shop.row().await.stock_quantity, 4);

    let err = assert_err!(
        shop.engine
            .set_stock_bulk(shop.product, vec![(b2, 1), (b2, 2)])
            .await
    );
    assert!(matches!(err, EngineError::Invalid(_)));

    let rows = assert_ok!(
        shop.engine
            .set_stock_bulk(shop.product, vec![(b3, 7), (shop.branch, 3), (b2, 2)])
            .await
    );
    assert_eq!(rows.len(), 3);
    let by_branch = shop.engine.availability(shop.product, None).await.unwrap();
    assert_eq!(by_branch.get(&shop.branch), Some(&0));
    assert_eq!(by_branch.get(&b2), Some(&2));
    assert_eq!(by_branch.get(&b3), Some(&7));
}

#[tokio::test]
async fn torn_bulk_stock_record_changes_no_row() {
    let path = test_wal_path("bulk_torn.wal");
    let shop = Shop::open_at(path.clone(), 4).await;
    let second = Ulid::new();
    shop.engine
        .register_branch(second, "DVO".into(), "Davao".into(), true)
        .await
        .unwrap();
    shop.engine.set_stock(shop.product, second, 4).await.unwrap();

    let appends = shop.engine.wal_appends_since_compact().await;
    shop.engine
        .set_stock_bulk(shop.product, vec![(shop.branch, 10), (second, 20)])
        .await
        .unwrap();
    assert_eq!(shop.engine.wal_appends_since_compact().await, appends + 1);

    let intact = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(intact.stock(shop.product, shop.branch).await.unwrap().stock_quantity, 10);
    assert_eq!(intact.stock(shop.product, second).await.unwrap().stock_quantity, 20);
    drop(intact);

    // Crash mid-write: the last record loses its final byte.
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 1).unwrap();
    drop(file);

    let torn = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(torn.stock(shop.product, shop.branch).await.unwrap().stock_quantity, 4);
    assert_eq!(torn.stock(shop.product, second).await.unwrap().stock_quantity, 4);
    assert!(torn.verify_ledger().await.is_empty());
}

#[tokio::test]
async fn low_stock_notices_and_listing() {
    let shop = Shop::open("low_stock.wal", 20).await;
    let mut notices = shop.engine.notify.subscribe_branch(shop.branch);

    shop.engine
        .set_low_stock_threshold(shop.product, shop.branch, 10)
        .await
        .unwrap();
    assert!(shop.engine.low_stock(None).await.is_empty());

    shop.reserve(12).await.unwrap();
    let mut saw_low = false;
    while let Ok(notice) = notices.try_recv() {
        if let Notice::LowStock { available, threshold, .. } = notice {
            assert_eq!((available, threshold), (8, 10));
            saw_low = true;
        }
    }
    assert!(saw_low);

    let low = shop.engine.low_stock(Some(shop.branch)).await;
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].available_quantity, 8);
    let summary = shop.engine.branch_summary(shop.branch).await.unwrap();
    assert_eq!((summary.total, summary.in_stock, summary.low_stock, summary.out_of_stock), (1, 1, 1, 0));
}

#[tokio::test]
async fn transitions_are_announced() {
    let shop = Shop::open("announce.wal", 3).await;
    let mut all = shop.engine.notify.subscribe();
    let r = shop.reserve(1).await.unwrap();
    shop.engine.approve(r.id, &shop.admin).await.unwrap();

    let statuses: Vec<ReservationStatus> = std::iter::from_fn(|| all.try_recv().ok())
        .filter_map(|n| match n {
            Notice::Reservation { reservation_id, status, .. } if reservation_id == r.id => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![ReservationStatus::Pending, ReservationStatus::Approved]);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn availability_views() {
    let shop = Shop::open("availability.wal", 3).await;
    let empty_branch = Ulid::new();
    shop.engine
        .register_branch(empty_branch, "ZAM".into(), "Zamboanga".into(), true)
        .await
        .unwrap();

    let one = shop
        .engine
        .availability(shop.product, Some(empty_branch))
        .await
        .unwrap();
    assert_eq!(one.get(&empty_branch), Some(&0));
    assert!(shop.engine.available_anywhere(shop.product).await.unwrap());

    let err = assert_err!(shop.engine.availability(Ulid::new(), None).await);
    assert!(matches!(err, EngineError::NotFound(_)));
    let err = assert_err!(shop.engine.availability(shop.product, Some(Ulid::new())).await);
    assert!(matches!(err, EngineError::NotFound(_)));

    shop.reserve(3).await.unwrap();
    assert!(!shop.engine.available_anywhere(shop.product).await.unwrap());
}

#[tokio::test]
async fn listing_filters_and_bill() {
    let shop = Shop::open("listing.wal", 10).await;
    let user = Ulid::new();
    let mine = shop
        .engine
        .create(Ulid::new(), user, shop.product, shop.branch, 2, None)
        .await
        .unwrap();
    let theirs = shop.reserve(1).await.unwrap();
    shop.engine.approve(mine.id, &shop.admin).await.unwrap();

    let by_user = shop
        .engine
        .list_reservations(&ReservationFilter {
            user_id: Some(user),
            ..Default::default()
        })
        .await;
    assert_eq!(by_user.len(), 1);
    assert_eq!(by_user[0].id, mine.id);

    let pending = shop
        .engine
        .list_reservations(&ReservationFilter {
            status: Some(ReservationStatus::Pending),
            branch_id: Some(shop.branch),
            ..Default::default()
        })
        .await;
    assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![theirs.id]);

    assert_eq!(shop.engine.approved_total(user).await.unwrap(), 2 * 2500);
    assert_eq!(shop.engine.approved_total(Ulid::new()).await.unwrap(), 0);

    let err = assert_err!(shop.engine.get_reservation(Ulid::new()).await);
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn prices_are_capped_and_bills_stay_exact() {
    let shop = Shop::open("price_cap.wal", MAX_STOCK_QUANTITY).await;
    let err = assert_err!(
        shop.engine
            .register_product(Ulid::new(), "Gold frame".into(), None, MAX_PRICE_CENTS + 1, true)
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    let err = assert_err!(
        shop.engine
            .register_product(shop.product, "Progressive lens".into(), None, i64::MAX, true)
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    assert_eq!(shop.engine.catalog.price_cents(&shop.product), Some(2500));

    // The most expensive product at the largest reservation size.
    shop.engine
        .register_product(shop.product, "Progressive lens".into(), None, MAX_PRICE_CENTS, true)
        .await
        .unwrap();
    let user = Ulid::new();
    let r = shop
        .engine
        .create(Ulid::new(), user, shop.product, shop.branch, MAX_RESERVATION_QUANTITY, None)
        .await
        .unwrap();
    shop.engine.approve(r.id, &shop.admin).await.unwrap();
    assert_eq!(
        shop.engine.approved_total(user).await.unwrap(),
        i64::from(MAX_RESERVATION_QUANTITY) * MAX_PRICE_CENTS
    );
}

// ── Schedule changes ─────────────────────────────────────

fn change(requester: Ulid, day: u8) -> ScheduleChangeInput {
    ScheduleChangeInput {
        requester_id: requester,
        role: Role::Optometrist,
        branch_id: None,
        day_of_week: day,
        start_time: MinuteOfDay::new(10, 0),
        end_time: MinuteOfDay::new(18, 0),
        reason: "evening clinic".into(),
    }
}

#[tokio::test]
async fn schedule_change_workflow() {
    let shop = Shop::open("schedule.wal", 0).await;
    let staff_id = Ulid::new();
    let me = Actor::new(staff_id, Role::Optometrist, Vec::new());
    let id = Ulid::new();

    let req = assert_ok!(shop.engine.request_schedule_change(id, &me, change(staff_id, 2)).await);
    assert_eq!(req.status, ScheduleStatus::Pending);

    let err = assert_err!(
        shop.engine
            .request_schedule_change(Ulid::new(), &me, change(staff_id, 2))
            .await
    );
    assert!(matches!(err, EngineError::DuplicatePending(existing) if existing == id));

    let err = assert_err!(shop.engine.approve_schedule_change(id, &me, None).await);
    assert!(matches!(err, EngineError::Forbidden(_)));

    let approved = assert_ok!(
        shop.engine
            .approve_schedule_change(id, &shop.admin, Some("ok".into()))
            .await
    );
    assert_eq!(approved.reviewer_id, Some(shop.admin.user_id));
    let err = assert_err!(shop.engine.reject_schedule_change(id, &shop.admin, None).await);
    assert!(matches!(err, EngineError::InvalidTransition { from: "approved", .. }));

    let week = shop.engine.weekly_schedule(staff_id);
    assert_eq!(week.len(), 1);
    assert_eq!(week[0].day_of_week, 2);
    assert_eq!(week[0].start_time, MinuteOfDay::new(10, 0));

    // The day is free for a new request after review.
    assert_ok!(
        shop.engine
            .request_schedule_change(Ulid::new(), &me, change(staff_id, 2))
            .await
    );
    assert_eq!(
        shop.engine
            .list_schedule_changes(Some(ScheduleStatus::Pending))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn schedule_requests_are_validated() {
    let shop = Shop::open("schedule_invalid.wal", 0).await;
    let staff_id = Ulid::new();
    let me = Actor::new(staff_id, Role::Optometrist, Vec::new());

    let mut backwards = change(staff_id, 3);
    backwards.end_time = MinuteOfDay::new(9, 0);
    let err = assert_err!(shop.engine.request_schedule_change(Ulid::new(), &me, backwards).await);
    assert!(matches!(err, EngineError::Invalid(_)));

    let err = assert_err!(
        shop.engine
            .request_schedule_change(Ulid::new(), &me, change(Ulid::new(), 3))
            .await
    );
    assert!(matches!(err, EngineError::Forbidden(_)));

    let mut elsewhere = change(staff_id, 3);
    elsewhere.branch_id = Some(Ulid::new());
    let err = assert_err!(shop.engine.request_schedule_change(Ulid::new(), &me, elsewhere).await);
    assert!(matches!(err, EngineError::InvalidTarget(TargetError::UnknownBranch(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_reviewer_wins() {
    let shop = Shop::open("schedule_race.wal", 0).await;
    let staff_id = Ulid::new();
    let me = Actor::new(staff_id, Role::Staff, Vec::new());
    let mut input = change(staff_id, 5);
    input.role = Role::Staff;
    let id = Ulid::new();
    shop.engine.request_schedule_change(id, &me, input).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = shop.engine.clone();
        let admin = Actor::admin(Ulid::new());
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine.approve_schedule_change(id, &admin, None).await
            } else {
                engine.reject_schedule_change(id, &admin, None).await
            }
        }));
    }
    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::InvalidTransition { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn one_request_id_is_granted_once() {
    let shop = Shop::open("schedule_ids.wal", 0).await;
    for _ in 0..50 {
        let id = Ulid::new();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let engine = shop.engine.clone();
            handles.push(tokio::spawn(async move {
                let staff_id = Ulid::new();
                let me = Actor::new(staff_id, Role::Optometrist, Vec::new());
                engine.request_schedule_change(id, &me, change(staff_id, 2)).await
            }));
        }
        let mut granted = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => granted += 1,
                Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(granted, 1);
    }
    assert_eq!(shop.engine.schedule_requests.len(), 50);
    assert_eq!(shop.engine.pending_schedule.len(), 50);
    for claim in shop.engine.pending_schedule.iter() {
        let request = shop.engine.get_schedule_change(*claim.value()).await.unwrap();
        assert_eq!((request.requester_id, request.day_of_week), *claim.key());
    }
}

// ── Quantity changes, transfers and restocks ─────────────

#[tokio::test]
async fn pending_quantity_can_grow_or_shrink() {
    let shop = Shop::open("quantity_update.wal", 6).await;
    let owner = Ulid::new();
    let r = shop
        .engine
        .create(Ulid::new(), owner, shop.product, shop.branch, 2, None)
        .await
        .unwrap();
    let me = Actor::customer(owner);

    let grown = assert_ok!(shop.engine.update_quantity(r.id, &me, 5).await);
    assert_eq!(grown.quantity, 5);
    assert_eq!(shop.row().await.reserved_quantity, 5);

    let err = assert_err!(shop.engine.update_quantity(r.id, &me, 7).await);
    assert!(matches!(
        err,
        EngineError::InsufficientStock {
            requested: 2,
            available: 1
        }
    ));

    let stranger = Actor::customer(Ulid::new());
    let err = assert_err!(shop.engine.update_quantity(r.id, &stranger, 1).await);
    assert!(matches!(err, EngineError::Forbidden(_)));

    assert_ok!(shop.engine.update_quantity(r.id, &shop.staff(), 1).await);
    assert_eq!(shop.row().await.reserved_quantity, 1);

    shop.engine.approve(r.id, &shop.admin).await.unwrap();
    let err = assert_err!(shop.engine.update_quantity(r.id, &me, 2).await);
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: "approved",
            action: "update",
            ..
        }
    ));
    assert!(shop.engine.verify_ledger().await.is_empty());
}

/// Another active branch with no stock of the shop's product.
async fn second_branch(shop: &Shop) -> Ulid {
    let branch = Ulid::new();
    let code = branch.to_string()[20..].to_string();
    shop.engine
        .register_branch(branch, code, "Davao".into(), true)
        .await
        .unwrap();
    branch
}

fn transfer_of(shop: &Shop, to: Ulid, quantity: u32) -> TransferInput {
    TransferInput {
        product_id: shop.product,
        from_branch_id: shop.branch,
        to_branch_id: to,
        quantity,
        reason: Some("weekend demand".into()),
    }
}

#[tokio::test]
async fn completed_transfer_moves_units() {
    let shop = Shop::open("transfer_complete.wal", 10).await;
    let dest = second_branch(&shop).await;
    let staff = Actor::staff(Ulid::new(), vec![dest]);

    let t = assert_ok!(shop.engine.request_transfer(Ulid::new(), &staff, transfer_of(&shop, dest, 4)).await);
    assert_eq!(t.status, TransferStatus::Pending);
    // Nothing moves before completion.
    assert_eq!(shop.row().await.stock_quantity, 10);

    let err = assert_err!(shop.engine.transition_transfer(t.id, &staff, TransferAction::Approve).await);
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = assert_err!(shop.engine.transition_transfer(t.id, &shop.admin, TransferAction::Complete).await);
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    assert_ok!(shop.engine.transition_transfer(t.id, &shop.admin, TransferAction::Approve).await);
    let done = assert_ok!(shop.engine.transition_transfer(t.id, &shop.admin, TransferAction::Complete).await);
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.approved_by, Some(shop.admin.user_id));

    assert_eq!(shop.row().await.stock_quantity, 6);
    let there = shop.engine.stock(shop.product, dest).await.unwrap();
    assert_eq!(there.stock_quantity, 4);
    assert!(shop.engine.verify_ledger().await.is_empty());
}

#[tokio::test]
async fn transfers_leave_reserved_units_in_place() {
    let shop = Shop::open("transfer_reserved.wal", 10).await;
    let dest = second_branch(&shop).await;
    let t = shop
        .engine
        .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, dest, 6))
        .await
        .unwrap();
    shop.engine
        .transition_transfer(t.id, &shop.admin, TransferAction::Approve)
        .await
        .unwrap();

    // A reservation lands between approval and completion.
    shop.reserve(7).await.unwrap();
    let err = assert_err!(shop.engine.transition_transfer(t.id, &shop.admin, TransferAction::Complete).await);
    assert!(matches!(
        err,
        EngineError::InsufficientStock {
            requested: 6,
            available: 3
        }
    ));
    let row = shop.row().await;
    assert_eq!((row.stock_quantity, row.reserved_quantity), (10, 7));
    assert_eq!(
        shop.engine.get_transfer(t.id).await.unwrap().status,
        TransferStatus::Approved
    );

    // Asking for more than is free is refused up front.
    let other = second_branch(&shop).await;
    let err = assert_err!(
        shop.engine
            .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, other, 4))
            .await
    );
    assert!(matches!(err, EngineError::InsufficientStock { .. }));
}

#[tokio::test]
async fn one_open_transfer_per_route() {
    let shop = Shop::open("transfer_route.wal", 20).await;
    let dest = second_branch(&shop).await;
    let first = shop
        .engine
        .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, dest, 2))
        .await
        .unwrap();
    let err = assert_err!(
        shop.engine
            .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, dest, 3))
            .await
    );
    assert!(matches!(err, EngineError::DuplicatePending(id) if id == first.id));
    let err = assert_err!(
        shop.engine
            .request_transfer(first.id, &shop.admin, transfer_of(&shop, dest, 1))
            .await
    );
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == first.id));

    let mut same_branch = transfer_of(&shop, shop.branch, 1);
    same_branch.reason = None;
    assert!(matches!(
        shop.engine.request_transfer(Ulid::new(), &shop.admin, same_branch).await,
        Err(EngineError::Invalid(_))
    ));
    let outsider = Actor::staff(Ulid::new(), vec![Ulid::new()]);
    assert!(matches!(
        shop.engine
            .request_transfer(Ulid::new(), &outsider, transfer_of(&shop, dest, 1))
            .await,
        Err(EngineError::Forbidden(_))
    ));

    // Cancelling frees the route.
    let requester_staff = shop.staff();
    shop.engine
        .transition_transfer(first.id, &requester_staff, TransferAction::Cancel)
        .await
        .unwrap();
    assert_ok!(
        shop.engine
            .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, dest, 3))
            .await
    );
    let listed = shop
        .engine
        .list_transfers(&TransferFilter {
            branch_id: Some(dest),
            ..TransferFilter::default()
        })
        .await;
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn fulfilled_restock_adds_stock() {
    let shop = Shop::open("restock.wal", 2).await;
    let staff = shop.staff();
    let input = RestockInput {
        product_id: shop.product,
        branch_id: shop.branch,
        requested_quantity: 12,
        notes: Some("school season".into()),
    };

    let r = assert_ok!(shop.engine.request_restock(Ulid::new(), &staff, input.clone()).await);
    assert_eq!((r.current_stock, r.status), (2, RestockStatus::Pending));
    let err = assert_err!(shop.engine.request_restock(Ulid::new(), &staff, input.clone()).await);
    assert!(matches!(err, EngineError::DuplicatePending(id) if id == r.id));
    let err = assert_err!(shop.engine.request_restock(Ulid::new(), &shop.admin, input.clone()).await);
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = assert_err!(shop.engine.transition_restock(r.id, &shop.admin, RestockAction::Fulfill).await);
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert_ok!(shop.engine.transition_restock(r.id, &shop.admin, RestockAction::Approve).await);
    let done = assert_ok!(shop.engine.transition_restock(r.id, &shop.admin, RestockAction::Fulfill).await);
    assert_eq!(done.status, RestockStatus::Fulfilled);
    assert_eq!(shop.row().await.stock_quantity, 14);

    // The row is free for a new request once the last one left pending.
    let again = assert_ok!(shop.engine.request_restock(Ulid::new(), &staff, input).await);
    assert_ok!(shop.engine.transition_restock(again.id, &staff, RestockAction::Cancel).await);
    assert_eq!(
        shop.engine.list_restocks(Some(RestockStatus::Cancelled), None).await.len(),
        1
    );
}

#[tokio::test]
async fn transfers_and_restocks_survive_restart_and_compaction() {
    let path = test_wal_path("transfer_replay.wal");
    let shop = Shop::open_at(path.clone(), 10).await;
    let dest = second_branch(&shop).await;

    let done = shop
        .engine
        .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, dest, 3))
        .await
        .unwrap();
    for action in [TransferAction::Approve, TransferAction::Complete] {
        shop.engine.transition_transfer(done.id, &shop.admin, action).await.unwrap();
    }
    let open = shop
        .engine
        .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, dest, 1))
        .await
        .unwrap();
    let restock = shop
        .engine
        .request_restock(
            Ulid::new(),
            &shop.staff(),
            RestockInput {
                product_id: shop.product,
                branch_id: dest,
                requested_quantity: 5,
                notes: None,
            },
        )
        .await;
    // Staff of the first branch cannot restock the second.
    assert!(matches!(restock, Err(EngineError::Forbidden(_))));
    let restock = shop
        .engine
        .request_restock(
            Ulid::new(),
            &Actor::staff(Ulid::new(), vec![dest]),
            RestockInput {
                product_id: shop.product,
                branch_id: dest,
                requested_quantity: 5,
                notes: None,
            },
        )
        .await
        .unwrap();
    for action in [RestockAction::Approve, RestockAction::Fulfill] {
        shop.engine.transition_restock(restock.id, &shop.admin, action).await.unwrap();
    }

    for compacted in [false, true] {
        if compacted {
            shop.engine.compact_wal().await.unwrap();
        }
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(engine.stock(shop.product, shop.branch).await.unwrap().stock_quantity, 7);
        assert_eq!(engine.stock(shop.product, dest).await.unwrap().stock_quantity, 8);
        assert_eq!(engine.get_transfer(done.id).await.unwrap().status, TransferStatus::Completed);
        assert_eq!(
            engine.get_restock(restock.id).await.unwrap().status,
            RestockStatus::Fulfilled
        );
        let err = assert_err!(
            engine
                .request_transfer(Ulid::new(), &shop.admin, transfer_of(&shop, dest, 1))
                .await
        );
        assert!(matches!(err, EngineError::DuplicatePending(id) if id == open.id));
        assert!(engine.verify_ledger().await.is_empty());
    }
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_ledger_and_claims() {
    let path = test_wal_path("replay.wal");
    let shop = Shop::open_at(path.clone(), 9).await;
    let user = Ulid::new();
    let pending = shop
        .engine
        .create(Ulid::new(), user, shop.product, shop.branch, 2, Some("left lens".into()))
        .await
        .unwrap();
    let done = shop.reserve(3).await.unwrap();
    shop.engine.approve(done.id, &shop.admin).await.unwrap();
    shop.engine.fulfill(done.id, &shop.admin).await.unwrap();
    shop.engine
        .set_low_stock_threshold(shop.product, shop.branch, 1)
        .await
        .unwrap();
    let staff_id = Ulid::new();
    let me = Actor::new(staff_id, Role::Optometrist, Vec::new());
    let req = Ulid::new();
    shop.engine.request_schedule_change(req, &me, change(staff_id, 1)).await.unwrap();
    shop.engine.approve_schedule_change(req, &shop.admin, None).await.unwrap();
    let before = shop.row().await;

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let after = engine.stock(shop.product, shop.branch).await.unwrap();
    assert_eq!(after, before);
    assert_eq!((after.stock_quantity, after.reserved_quantity), (6, 2));
    assert_eq!(after.low_stock_threshold, 1);
    assert_eq!(
        engine.get_reservation(pending.id).await.unwrap().notes.as_deref(),
        Some("left lens")
    );
    assert_eq!(
        engine.get_reservation(done.id).await.unwrap().status,
        ReservationStatus::Fulfilled
    );
    assert!(engine.verify_ledger().await.is_empty());
    assert_eq!(engine.weekly_schedule(staff_id).len(), 1);
    assert_eq!(engine.catalog.price_cents(&shop.product), Some(2500));

    let err = assert_err!(
        engine
            .create(Ulid::new(), user, shop.product, shop.branch, 1, None)
            .await
    );
    assert!(matches!(err, EngineError::DuplicatePending(id) if id == pending.id));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let shop = Shop::open_at(path.clone(), 30).await;
    let mut ids = Vec::new();
    for q in 1..=5 {
        ids.push(shop.reserve(q).await.unwrap().id);
    }
    for id in &ids[..3] {
        shop.engine.reject(*id, &shop.admin, None).await.unwrap();
    }
    for qty in 30..60 {
        shop.engine.set_stock(shop.product, shop.branch, qty).await.unwrap();
    }
    assert!(shop.engine.wal_appends_since_compact().await > 0);
    let size_before = std::fs::metadata(&path).unwrap().len();

    shop.engine.compact_wal().await.unwrap();
    assert_eq!(shop.engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&path).unwrap().len() < size_before);

    // Writes after compaction land in the new file.
    shop.engine.approve(ids[3], &shop.admin).await.unwrap();
    let before = shop.row().await;

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.stock(shop.product, shop.branch).await.unwrap(), before);
    assert_eq!(
        engine.get_reservation(ids[0]).await.unwrap().status,
        ReservationStatus::Rejected
    );
    assert_eq!(
        engine.get_reservation(ids[3]).await.unwrap().status,
        ReservationStatus::Approved
    );
    assert!(engine.verify_ledger().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_commit_survives_restart() {
    let path = test_wal_path("group_commit.wal");
    let shop = Shop::open_at(path.clone(), 100).await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        let engine = shop.engine.clone();
        let (product, branch) = (shop.product, shop.branch);
        handles.push(tokio::spawn(async move {
            engine
                .create(Ulid::new(), Ulid::new(), product, branch, 2, None)
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let row = engine.stock(shop.product, shop.branch).await.unwrap();
    assert_eq!(row.reserved_quantity, 50);
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), 25);
}
