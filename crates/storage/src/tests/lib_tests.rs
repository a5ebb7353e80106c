use super::*;
use shared::protocol::UNKNOWN_PRODUCT;

struct Seed {
    customer: AccountId,
    supplier: AccountId,
    statuses: Vec<StatusId>,
    status_chain: StatusChainId,
}

async fn seed(storage: &Storage) -> Seed {
    let customer = storage
        .create_account(&AccountInput {
            name: "Officine Rossi".to_string(),
            vat_number: "IT01".to_string(),
            address: "Via Roma 1".to_string(),
        })
        .await
        .expect("customer");
    let supplier = storage
        .create_account(&AccountInput {
            name: "Bulloneria Verdi".to_string(),
            vat_number: "IT02".to_string(),
            address: String::new(),
        })
        .await
        .expect("supplier");
    storage
        .create_product(&ProductInput {
            product_code: ProductCode::from("ART-1"),
            name: "Hex bolt M8".to_string(),
        })
        .await
        .expect("product");

    let mut statuses = Vec::new();
    for (name, color) in [("empty", "red"), ("ordered", "yellow"), ("full", "green")] {
        let status = storage
            .create_status(&StatusInput {
                name: name.to_string(),
                color: color.to_string(),
            })
            .await
            .expect("status");
        statuses.push(status.id);
    }

    let detail = storage
        .create_status_chain(&NewStatusChain {
            name: "standard".to_string(),
            entries: vec![
                entry(statuses[0], 1, ActorRole::Customer),
                entry(statuses[1], 2, ActorRole::Supplier),
                entry(statuses[2], 3, ActorRole::Customer),
            ],
        })
        .await
        .expect("status chain");

    Seed {
        customer: customer.id,
        supplier: supplier.id,
        statuses,
        status_chain: detail.status_chain.id,
    }
}

fn entry(status_id: StatusId, order: i64, actor_role: ActorRole) -> StatusChainEntryInput {
    StatusChainEntryInput {
        status_id,
        order,
        actor_role,
    }
}

fn new_kanban_chain(seed: &Seed, status_chain_id: StatusChainId) -> NewKanbanChain {
    NewKanbanChain {
        customer_account_id: seed.customer,
        product_code: ProductCode::from("ART-1"),
        supplier_account_id: seed.supplier,
        leadtime_days: 5,
        quantity: 50.0,
        container_type: "bin".to_string(),
        status_chain_id,
        target_active_kanban_count: 2,
    }
}

async fn count(storage: &Storage, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(storage.pool())
        .await
        .expect("count")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("kanban.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[test]
fn sqlite_path_ignores_memory_and_foreign_urls() {
    assert!(sqlite_path("sqlite::memory:").is_none());
    assert!(sqlite_path("postgres://localhost/db").is_none());
    assert_eq!(
        sqlite_path("sqlite://data/kanban.db?mode=rwc"),
        Some(PathBuf::from("data/kanban.db"))
    );
}

#[tokio::test]
async fn status_chain_entries_come_back_in_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;

    let entries = storage
        .list_status_chain_entries(seed.status_chain)
        .await
        .expect("entries");
    let ids: Vec<StatusId> = entries.iter().map(|e| e.status_id).collect();
    assert_eq!(ids, seed.statuses);
    assert_eq!(entries[1].actor_role, ActorRole::Supplier);
}

#[tokio::test]
async fn duplicate_order_batch_is_rejected_atomically() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let extra = storage
        .create_status(&StatusInput {
            name: "in transit".to_string(),
            color: "blue".to_string(),
        })
        .await
        .expect("status");
    let spare = storage
        .create_status(&StatusInput {
            name: "spare".to_string(),
            color: "grey".to_string(),
        })
        .await
        .expect("status");

    let err = storage
        .attach_status_chain_entries(
            seed.status_chain,
            &[
                entry(extra.id, 4, ActorRole::Supplier),
                entry(spare.id, 2, ActorRole::Supplier),
            ],
        )
        .await
        .expect_err("order 2 is taken");
    assert!(matches!(
        err.downcast_ref::<IntegrityError>(),
        Some(IntegrityError::DuplicateOrder { order: 2, .. })
    ));

    let entries = storage
        .list_status_chain_entries(seed.status_chain)
        .await
        .expect("entries");
    assert_eq!(entries.len(), 3, "no entry of the failed batch persisted");
}

#[tokio::test]
async fn duplicate_status_in_batch_is_rejected() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;

    let err = storage
        .update_status_chain_entries(
            seed.status_chain,
            &[
                entry(seed.statuses[0], 7, ActorRole::Customer),
                entry(seed.statuses[0], 8, ActorRole::Customer),
            ],
        )
        .await
        .expect_err("same status twice");
    assert!(matches!(
        err.downcast_ref::<IntegrityError>(),
        Some(IntegrityError::DuplicateStatus { .. })
    ));
}

#[tokio::test]
async fn update_entries_can_swap_orders() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;

    let entries = storage
        .update_status_chain_entries(
            seed.status_chain,
            &[
                entry(seed.statuses[0], 3, ActorRole::Customer),
                entry(seed.statuses[2], 1, ActorRole::Supplier),
            ],
        )
        .await
        .expect("swap");
    let ids: Vec<StatusId> = entries.iter().map(|e| e.status_id).collect();
    assert_eq!(ids, vec![seed.statuses[2], seed.statuses[1], seed.statuses[0]]);
    assert_eq!(entries[0].actor_role, ActorRole::Supplier);
}

#[tokio::test]
async fn update_of_foreign_entry_rolls_back_the_batch() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let outsider = storage
        .create_status(&StatusInput {
            name: "outsider".to_string(),
            color: "black".to_string(),
        })
        .await
        .expect("status");

    let err = storage
        .update_status_chain_entries(
            seed.status_chain,
            &[
                entry(seed.statuses[0], 10, ActorRole::Supplier),
                entry(outsider.id, 11, ActorRole::Supplier),
            ],
        )
        .await
        .expect_err("outsider is not an entry");
    assert!(matches!(
        err.downcast_ref::<IntegrityError>(),
        Some(IntegrityError::UnknownEntry { .. })
    ));

    let entries = storage
        .list_status_chain_entries(seed.status_chain)
        .await
        .expect("entries");
    assert_eq!(entries[0].order, 1);
    assert_eq!(entries[0].actor_role, ActorRole::Customer);
}

#[tokio::test]
async fn kanban_chain_creation_starts_kanbans_at_first_status() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;

    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 3)
        .await
        .expect("kanban chain");
    assert_eq!(created.kanbans.len(), 3);
    for kanban in &created.kanbans {
        assert_eq!(kanban.status_current, seed.statuses[0]);
        assert_eq!(kanban.kanban_chain_id, created.kanban_chain.id);
        assert_eq!(kanban.container_type, "bin");
        assert_eq!(kanban.status_revision, 0);
        assert!(kanban.is_active);
    }
}

#[tokio::test]
async fn zero_initial_kanbans_still_requires_non_empty_chain() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let empty = storage
        .create_status_chain(&NewStatusChain {
            name: "empty".to_string(),
            entries: Vec::new(),
        })
        .await
        .expect("empty chain");

    let err = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, empty.status_chain.id), 0)
        .await
        .expect_err("empty chain");
    assert!(matches!(
        err.downcast_ref::<IntegrityError>(),
        Some(IntegrityError::EmptyStatusChain(_))
    ));
    assert_eq!(count(&storage, "kanban_chains").await, 0);
}

#[tokio::test]
async fn top_up_appends_kanbans_to_existing_chain() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 1)
        .await
        .expect("kanban chain");

    let added = storage
        .add_kanbans_to_chain(created.kanban_chain.id, 2)
        .await
        .expect("top up")
        .expect("chain exists");
    assert_eq!(added.len(), 2);
    assert!(storage
        .add_kanbans_to_chain(KanbanChainId(999), 1)
        .await
        .expect("query")
        .is_none());

    let summaries = storage.list_kanban_chains().await.expect("summaries");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].active_kanbans, 3);
    assert_eq!(summaries[0].customer_name.as_deref(), Some("Officine Rossi"));
    assert_eq!(summaries[0].product_name.as_deref(), Some("Hex bolt M8"));
}

#[tokio::test]
async fn field_edits_leave_status_and_revision_untouched() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 1)
        .await
        .expect("kanban chain");
    let before = created.kanbans[0].clone();

    let after = storage
        .update_kanban_fields(
            before.id,
            &KanbanFieldMask {
                quantity: Some(75.0),
                ..KanbanFieldMask::default()
            },
        )
        .await
        .expect("update")
        .expect("kanban exists");
    assert_eq!(after.quantity, 75.0);
    assert_eq!(after.container_type, before.container_type);
    assert_eq!(after.status_current, before.status_current);
    assert_eq!(after.status_revision, before.status_revision);
    assert_eq!(after.last_updated, before.last_updated);
}

#[tokio::test]
async fn stale_revision_write_is_refused() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 1)
        .await
        .expect("kanban chain");
    let kanban = &created.kanbans[0];

    let written = storage
        .set_kanban_status(kanban.id, 0, seed.statuses[1], Utc::now())
        .await
        .expect("write")
        .expect("fresh revision");
    assert_eq!(written.status_revision, 1);

    let stale = storage
        .set_kanban_status(kanban.id, 0, seed.statuses[2], Utc::now())
        .await
        .expect("write");
    assert!(stale.is_none());
}

#[tokio::test]
async fn deactivated_kanbans_are_hidden_from_default_listing() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 2)
        .await
        .expect("kanban chain");
    let retired = created.kanbans[0].id;

    let deactivated = storage
        .deactivate_kanban(retired)
        .await
        .expect("deactivate")
        .expect("kanban exists");
    assert!(!deactivated.is_active);

    let active = storage
        .list_kanbans(Some(created.kanban_chain.id), false)
        .await
        .expect("active");
    assert_eq!(active.len(), 1);
    let all = storage
        .list_kanbans(Some(created.kanban_chain.id), true)
        .await
        .expect("all");
    assert_eq!(all.len(), 2);
    assert!(storage.get_kanban(retired).await.expect("get").is_some());
}

#[tokio::test]
async fn referenced_status_chain_cannot_be_deleted() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 1)
        .await
        .expect("kanban chain");

    let err = storage
        .delete_status_chain(seed.status_chain)
        .await
        .expect_err("in use");
    assert!(matches!(
        err.downcast_ref::<IntegrityError>(),
        Some(IntegrityError::StatusChainInUse(_))
    ));

    let err = storage
        .delete_kanban_chain(created.kanban_chain.id)
        .await
        .expect_err("owns kanbans");
    assert!(matches!(
        err.downcast_ref::<IntegrityError>(),
        Some(IntegrityError::KanbanChainHasKanbans(_))
    ));
}

#[tokio::test]
async fn unused_status_chain_is_deleted_with_its_entries() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;

    assert!(storage
        .delete_status_chain(seed.status_chain)
        .await
        .expect("delete"));
    assert_eq!(count(&storage, "status_chains_statuses").await, 0);
    assert!(!storage
        .delete_status_chain(seed.status_chain)
        .await
        .expect("second delete"));
}

#[tokio::test]
async fn history_is_listed_oldest_first() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 1)
        .await
        .expect("kanban chain");
    let kanban_id = created.kanbans[0].id;

    storage
        .insert_kanban_history(kanban_id, seed.statuses[0], seed.statuses[1], Utc::now())
        .await
        .expect("first");
    storage
        .insert_kanban_history(kanban_id, seed.statuses[1], seed.statuses[2], Utc::now())
        .await
        .expect("second");

    let history = storage.list_kanban_history(kanban_id).await.expect("history");
    let steps: Vec<(StatusId, StatusId)> = history
        .iter()
        .map(|row| (row.previous_status, row.next_status))
        .collect();
    assert_eq!(
        steps,
        vec![
            (seed.statuses[0], seed.statuses[1]),
            (seed.statuses[1], seed.statuses[2])
        ]
    );
}

#[tokio::test]
async fn dashboard_rows_follow_perspective_and_skip_inactive() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    let created = storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 2)
        .await
        .expect("kanban chain");
    storage
        .deactivate_kanban(created.kanbans[1].id)
        .await
        .expect("deactivate");

    let customer_rows = storage
        .dashboard_kanbans(DashboardPerspective::Customer, seed.customer)
        .await
        .expect("customer dashboard");
    assert_eq!(customer_rows.len(), 1);
    let row = &customer_rows[0];
    assert_eq!(row.counterparty_id, seed.supplier);
    assert_eq!(row.counterparty_name.as_deref(), Some("Bulloneria Verdi"));
    assert_eq!(row.status_name.as_deref(), Some("empty"));
    assert_eq!(row.actor_role, Some(ActorRole::Customer));
    assert_eq!(row.product_code, Some(ProductCode::from("ART-1")));

    let supplier_rows = storage
        .dashboard_kanbans(DashboardPerspective::Supplier, seed.supplier)
        .await
        .expect("supplier dashboard");
    assert_eq!(supplier_rows.len(), 1);
    assert_eq!(supplier_rows[0].counterparty_id, seed.customer);

    assert!(storage
        .dashboard_kanbans(DashboardPerspective::Supplier, seed.customer)
        .await
        .expect("wrong side")
        .is_empty());
}

#[tokio::test]
async fn dashboard_row_without_product_has_no_code() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;
    storage
        .create_kanban_chain_with_kanbans(&new_kanban_chain(&seed, seed.status_chain), 1)
        .await
        .expect("kanban chain");

    let mut conn = storage.pool().acquire().await.expect("conn");
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await
        .expect("pragma");
    sqlx::query("UPDATE kanban_chains SET product_code = 'GONE'")
        .execute(&mut *conn)
        .await
        .expect("orphan product");
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await
        .expect("pragma");
    drop(conn);

    let rows = storage
        .dashboard_kanbans(DashboardPerspective::Customer, seed.customer)
        .await
        .expect("dashboard");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].product_code.is_none(), "grouped under {UNKNOWN_PRODUCT}");
}

#[tokio::test]
async fn attaching_an_existing_member_is_a_duplicate_status() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;

    let err = storage
        .attach_status_chain_entries(
            seed.status_chain,
            &[entry(seed.statuses[0], 9, ActorRole::Supplier)],
        )
        .await
        .expect_err("already a member");
    assert!(matches!(
        err.downcast_ref::<IntegrityError>(),
        Some(IntegrityError::DuplicateStatus { .. })
    ));
}

#[test]
fn stored_actor_roles_parse_strictly() {
    assert_eq!(
        actor_role_from_db("customer").expect("customer"),
        ActorRole::Customer
    );
    assert_eq!(
        actor_role_from_db("supplier").expect("supplier"),
        ActorRole::Supplier
    );
    assert!(actor_role_from_db("carrier").is_err());
    assert!(actor_role_from_db("").is_err());
}

#[tokio::test]
async fn unknown_stored_actor_role_fails_the_read() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let seed = seed(&storage).await;

    let mut conn = storage.pool().acquire().await.expect("conn");
    sqlx::query("PRAGMA ignore_check_constraints = ON")
        .execute(&mut *conn)
        .await
        .expect("pragma");
    sqlx::query("UPDATE status_chains_statuses SET actor_role = 'carrier' WHERE \"order\" = 2")
        .execute(&mut *conn)
        .await
        .expect("corrupt role");
    sqlx::query("PRAGMA ignore_check_constraints = OFF")
        .execute(&mut *conn)
        .await
        .expect("pragma");
    drop(conn);

    let err = storage
        .list_status_chain_entries(seed.status_chain)
        .await
        .expect_err("unknown role");
    assert!(err.to_string().contains("carrier"));
}
