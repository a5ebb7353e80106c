use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use progression::KanbanStore;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

use shared::{
    domain::{
        Account, AccountId, ActorRole, HistoryId, Kanban, KanbanChain, KanbanChainId,
        KanbanHistory, KanbanId, Product, ProductCode, Status, StatusChain, StatusChainEntry,
        StatusChainId, StatusId,
    },
    protocol::{
        AccountInput, DashboardKanban, DashboardPerspective, KanbanChainFieldMask,
        KanbanChainSummary, KanbanChainWithKanbans, KanbanFieldMask, NewKanbanChain,
        NewStatusChain, ProductInput, StatusChainDetail, StatusChainEntryInput, StatusInput,
    },
};

/// Structural rejections raised from inside storage transactions. They travel
/// inside `anyhow::Error` and can be recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("status chain {0} has no entries")]
    EmptyStatusChain(StatusChainId),
    #[error("order {order} is used more than once in status chain {status_chain_id}")]
    DuplicateOrder {
        status_chain_id: StatusChainId,
        order: i64,
    },
    #[error("status {status_id} appears more than once in status chain {status_chain_id}")]
    DuplicateStatus {
        status_chain_id: StatusChainId,
        status_id: StatusId,
    },
    #[error("status {status_id} is not part of status chain {status_chain_id}")]
    UnknownEntry {
        status_chain_id: StatusChainId,
        status_id: StatusId,
    },
    #[error("status chain {0} is still referenced by kanban chains or kanbans")]
    StatusChainInUse(StatusChainId),
    #[error("kanban chain {0} still owns kanbans")]
    KanbanChainHasKanbans(KanbanChainId),
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

const CUSTOMER_DASHBOARD_QUERY: &str = r#"
    SELECT k.id AS kanban_id, k.kanban_chain_id, p.product_code, p.name AS product_name,
           k.container_type, k.quantity, k.leadtime_days, k.status_current,
           s.name AS status_name, s.color AS status_color, scs.actor_role,
           kc.supplier_account_id AS counterparty_id, a.name AS counterparty_name,
           k.last_updated
    FROM kanbans k
    INNER JOIN kanban_chains kc ON kc.id = k.kanban_chain_id
    LEFT JOIN products p ON p.product_code = kc.product_code
    LEFT JOIN statuses s ON s.id = k.status_current
    LEFT JOIN status_chains_statuses scs
        ON scs.status_chain_id = k.status_chain_id AND scs.status_id = k.status_current
    LEFT JOIN accounts a ON a.id = kc.supplier_account_id
    WHERE kc.customer_account_id = ? AND k.is_active = 1
    ORDER BY p.name, k.id
"#;

const SUPPLIER_DASHBOARD_QUERY: &str = r#"
    SELECT k.id AS kanban_id, k.kanban_chain_id, p.product_code, p.name AS product_name,
           k.container_type, k.quantity, k.leadtime_days, k.status_current,
           s.name AS status_name, s.color AS status_color, scs.actor_role,
           kc.customer_account_id AS counterparty_id, a.name AS counterparty_name,
           k.last_updated
    FROM kanbans k
    INNER JOIN kanban_chains kc ON kc.id = k.kanban_chain_id
    LEFT JOIN products p ON p.product_code = kc.product_code
    LEFT JOIN statuses s ON s.id = k.status_current
    LEFT JOIN status_chains_statuses scs
        ON scs.status_chain_id = k.status_chain_id AND scs.status_id = k.status_current
    LEFT JOIN accounts a ON a.id = kc.customer_account_id
    WHERE kc.supplier_account_id = ? AND k.is_active = 1
    ORDER BY p.name, k.id
"#;

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_account(&self, input: &AccountInput) -> Result<Account> {
        let row = sqlx::query(
            "INSERT INTO accounts (name, vat_number, address) VALUES (?, ?, ?)
             RETURNING id, name, vat_number, address",
        )
        .bind(&input.name)
        .bind(&input.vat_number)
        .bind(&input.address)
        .fetch_one(&self.pool)
        .await?;
        Ok(account_from_row(&row))
    }

    pub async fn get_account(&self, account_id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT id, name, vat_number, address FROM accounts WHERE id = ?")
            .bind(account_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT id, name, vat_number, address FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(account_from_row).collect())
    }

    pub async fn update_account(
        &self,
        account_id: AccountId,
        input: &AccountInput,
    ) -> Result<Option<Account>> {
        let row = sqlx::query(
            "UPDATE accounts SET name = ?, vat_number = ?, address = ?
             WHERE id = ?
             RETURNING id, name, vat_number, address",
        )
        .bind(&input.name)
        .bind(&input.vat_number)
        .bind(&input.address)
        .bind(account_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    pub async fn delete_account(&self, account_id: AccountId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_product(&self, input: &ProductInput) -> Result<Product> {
        let row = sqlx::query(
            "INSERT INTO products (product_code, name) VALUES (?, ?) RETURNING product_code, name",
        )
        .bind(input.product_code.as_str())
        .bind(&input.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(product_from_row(&row))
    }

    pub async fn get_product(&self, product_code: &ProductCode) -> Result<Option<Product>> {
        let row = sqlx::query("SELECT product_code, name FROM products WHERE product_code = ?")
            .bind(product_code.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(product_from_row))
    }

    pub async fn list_products(&self) -> Result<Vec<Product>> {
        let rows = sqlx::query("SELECT product_code, name FROM products ORDER BY product_code")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(product_from_row).collect())
    }

    pub async fn rename_product(
        &self,
        product_code: &ProductCode,
        name: &str,
    ) -> Result<Option<Product>> {
        let row = sqlx::query(
            "UPDATE products SET name = ? WHERE product_code = ? RETURNING product_code, name",
        )
        .bind(name)
        .bind(product_code.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(product_from_row))
    }

    pub async fn delete_product(&self, product_code: &ProductCode) -> Result<bool> {
        let result = sqlx::query("DELETE FROM products WHERE product_code = ?")
            .bind(product_code.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_status(&self, input: &StatusInput) -> Result<Status> {
        let row =
            sqlx::query("INSERT INTO statuses (name, color) VALUES (?, ?) RETURNING id, name, color")
                .bind(&input.name)
                .bind(&input.color)
                .fetch_one(&self.pool)
                .await?;
        Ok(status_from_row(&row))
    }

    pub async fn get_status(&self, status_id: StatusId) -> Result<Option<Status>> {
        let row = sqlx::query("SELECT id, name, color FROM statuses WHERE id = ?")
            .bind(status_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(status_from_row))
    }

    pub async fn list_statuses(&self) -> Result<Vec<Status>> {
        let rows = sqlx::query("SELECT id, name, color FROM statuses ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(status_from_row).collect())
    }

    pub async fn update_status(
        &self,
        status_id: StatusId,
        input: &StatusInput,
    ) -> Result<Option<Status>> {
        let row = sqlx::query(
            "UPDATE statuses SET name = ?, color = ? WHERE id = ? RETURNING id, name, color",
        )
        .bind(&input.name)
        .bind(&input.color)
        .bind(status_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(status_from_row))
    }

    pub async fn delete_status(&self, status_id: StatusId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM statuses WHERE id = ?")
            .bind(status_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Creates the chain row and its entries in one transaction.
    pub async fn create_status_chain(&self, input: &NewStatusChain) -> Result<StatusChainDetail> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("INSERT INTO status_chains (name) VALUES (?) RETURNING id, name")
            .bind(&input.name)
            .fetch_one(&mut *tx)
            .await?;
        let status_chain = status_chain_from_row(&row);

        insert_chain_entries(&mut tx, status_chain.id, &input.entries).await?;
        let entries = ordered_chain_entries(&mut tx, status_chain.id).await?;

        tx.commit().await?;
        Ok(StatusChainDetail {
            status_chain,
            entries,
        })
    }

    pub async fn get_status_chain(
        &self,
        status_chain_id: StatusChainId,
    ) -> Result<Option<StatusChain>> {
        let row = sqlx::query("SELECT id, name FROM status_chains WHERE id = ?")
            .bind(status_chain_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(status_chain_from_row))
    }

    pub async fn list_status_chains(&self) -> Result<Vec<StatusChain>> {
        let rows = sqlx::query("SELECT id, name FROM status_chains ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(status_chain_from_row).collect())
    }

    pub async fn rename_status_chain(
        &self,
        status_chain_id: StatusChainId,
        name: &str,
    ) -> Result<Option<StatusChain>> {
        let row = sqlx::query("UPDATE status_chains SET name = ? WHERE id = ? RETURNING id, name")
            .bind(name)
            .bind(status_chain_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(status_chain_from_row))
    }

    /// Deletes an unreferenced status chain together with its entries.
    pub async fn delete_status_chain(&self, status_chain_id: StatusChainId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let references: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM kanban_chains WHERE status_chain_id = ?1)
                  + (SELECT COUNT(*) FROM kanbans WHERE status_chain_id = ?1)",
        )
        .bind(status_chain_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if references > 0 {
            return Err(IntegrityError::StatusChainInUse(status_chain_id).into());
        }

        sqlx::query("DELETE FROM status_chains_statuses WHERE status_chain_id = ?")
            .bind(status_chain_id.0)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM status_chains WHERE id = ?")
            .bind(status_chain_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    pub async fn list_status_chain_entries(
        &self,
        status_chain_id: StatusChainId,
    ) -> Result<Vec<StatusChainEntry>> {
        let mut conn = self.pool.acquire().await?;
        ordered_chain_entries(&mut conn, status_chain_id).await
    }

    /// Inserts a batch of entries; either every entry lands or none does.
    pub async fn attach_status_chain_entries(
        &self,
        status_chain_id: StatusChainId,
        entries: &[StatusChainEntryInput],
    ) -> Result<Vec<StatusChainEntry>> {
        let mut tx = self.pool.begin().await?;
        insert_chain_entries(&mut tx, status_chain_id, entries).await?;
        let ordered = ordered_chain_entries(&mut tx, status_chain_id).await?;
        tx.commit().await?;
        Ok(ordered)
    }

    /// Overwrites order and actor role of existing entries in one transaction.
    /// Entries not listed keep their values.
    pub async fn update_status_chain_entries(
        &self,
        status_chain_id: StatusChainId,
        entries: &[StatusChainEntryInput],
    ) -> Result<Vec<StatusChainEntry>> {
        ensure_distinct_statuses(status_chain_id, entries)?;
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let updated = sqlx::query(
                r#"UPDATE status_chains_statuses
                   SET "order" = ?, actor_role = ?
                   WHERE status_chain_id = ? AND status_id = ?"#,
            )
            .bind(entry.order)
            .bind(entry.actor_role.as_str())
            .bind(status_chain_id.0)
            .bind(entry.status_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                return Err(IntegrityError::UnknownEntry {
                    status_chain_id,
                    status_id: entry.status_id,
                }
                .into());
            }
        }

        ensure_unique_orders(&mut tx, status_chain_id).await?;
        let ordered = ordered_chain_entries(&mut tx, status_chain_id).await?;
        tx.commit().await?;
        Ok(ordered)
    }

    /// Inserts the chain row and `count` kanbans at the chain's first status.
    /// Nothing is persisted if any step fails.
    pub async fn create_kanban_chain_with_kanbans(
        &self,
        input: &NewKanbanChain,
        count: u32,
    ) -> Result<KanbanChainWithKanbans> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO kanban_chains (
                customer_account_id, product_code, supplier_account_id, leadtime_days,
                quantity, container_type, status_chain_id, target_active_kanban_count
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id, customer_account_id, product_code, supplier_account_id, leadtime_days,
                       quantity, container_type, status_chain_id, target_active_kanban_count",
        )
        .bind(input.customer_account_id.0)
        .bind(input.product_code.as_str())
        .bind(input.supplier_account_id.0)
        .bind(input.leadtime_days)
        .bind(input.quantity)
        .bind(&input.container_type)
        .bind(input.status_chain_id.0)
        .bind(input.target_active_kanban_count)
        .fetch_one(&mut *tx)
        .await?;
        let kanban_chain = kanban_chain_from_row(&row);

        let kanbans = insert_initial_kanbans(&mut tx, &kanban_chain, count).await?;

        tx.commit().await?;
        Ok(KanbanChainWithKanbans {
            kanban_chain,
            kanbans,
        })
    }

    /// Adds `count` kanbans to an existing chain. Returns `None` when the
    /// chain does not exist.
    pub async fn add_kanbans_to_chain(
        &self,
        kanban_chain_id: KanbanChainId,
        count: u32,
    ) -> Result<Option<Vec<Kanban>>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, customer_account_id, product_code, supplier_account_id, leadtime_days,
                    quantity, container_type, status_chain_id, target_active_kanban_count
             FROM kanban_chains WHERE id = ?",
        )
        .bind(kanban_chain_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(kanban_chain) = row.as_ref().map(kanban_chain_from_row) else {
            return Ok(None);
        };

        let kanbans = insert_initial_kanbans(&mut tx, &kanban_chain, count).await?;

        tx.commit().await?;
        Ok(Some(kanbans))
    }

    pub async fn get_kanban_chain(
        &self,
        kanban_chain_id: KanbanChainId,
    ) -> Result<Option<KanbanChain>> {
        let row = sqlx::query(
            "SELECT id, customer_account_id, product_code, supplier_account_id, leadtime_days,
                    quantity, container_type, status_chain_id, target_active_kanban_count
             FROM kanban_chains WHERE id = ?",
        )
        .bind(kanban_chain_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kanban_chain_from_row))
    }

    pub async fn list_kanban_chains(&self) -> Result<Vec<KanbanChainSummary>> {
        let rows = sqlx::query(
            "SELECT kc.id, kc.customer_account_id, kc.product_code, kc.supplier_account_id,
                    kc.leadtime_days, kc.quantity, kc.container_type, kc.status_chain_id,
                    kc.target_active_kanban_count,
                    c.name AS customer_name, s.name AS supplier_name, p.name AS product_name,
                    (SELECT COUNT(*) FROM kanbans k
                     WHERE k.kanban_chain_id = kc.id AND k.is_active = 1) AS active_kanbans
             FROM kanban_chains kc
             LEFT JOIN accounts c ON c.id = kc.customer_account_id
             LEFT JOIN accounts s ON s.id = kc.supplier_account_id
             LEFT JOIN products p ON p.product_code = kc.product_code
             ORDER BY kc.id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| KanbanChainSummary {
                kanban_chain: kanban_chain_from_row(r),
                customer_name: r.get::<Option<String>, _>("customer_name"),
                supplier_name: r.get::<Option<String>, _>("supplier_name"),
                product_name: r.get::<Option<String>, _>("product_name"),
                active_kanbans: r.get::<i64, _>("active_kanbans"),
            })
            .collect())
    }

    /// Applies the chain-level field edits. Kanbans already created keep
    /// the values they were created with.
    pub async fn update_kanban_chain(
        &self,
        kanban_chain_id: KanbanChainId,
        mask: &KanbanChainFieldMask,
    ) -> Result<Option<KanbanChain>> {
        let row = sqlx::query(
            "UPDATE kanban_chains
             SET leadtime_days = COALESCE(?, leadtime_days),
                 container_type = COALESCE(?, container_type),
                 quantity = COALESCE(?, quantity),
                 target_active_kanban_count = COALESCE(?, target_active_kanban_count)
             WHERE id = ?
             RETURNING id, customer_account_id, product_code, supplier_account_id, leadtime_days,
                       quantity, container_type, status_chain_id, target_active_kanban_count",
        )
        .bind(mask.leadtime_days)
        .bind(mask.container_type.as_deref())
        .bind(mask.quantity)
        .bind(mask.target_active_kanban_count)
        .bind(kanban_chain_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kanban_chain_from_row))
    }

    /// Kanbans are never physically removed, so only a chain that never got
    /// any kanban can be deleted.
    pub async fn delete_kanban_chain(&self, kanban_chain_id: KanbanChainId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let owned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kanbans WHERE kanban_chain_id = ?")
            .bind(kanban_chain_id.0)
            .fetch_one(&mut *tx)
            .await?;
        if owned > 0 {
            return Err(IntegrityError::KanbanChainHasKanbans(kanban_chain_id).into());
        }

        let deleted = sqlx::query("DELETE FROM kanban_chains WHERE id = ?")
            .bind(kanban_chain_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Reads a kanban regardless of its `is_active` flag.
    pub async fn get_kanban(&self, kanban_id: KanbanId) -> Result<Option<Kanban>> {
        let row = sqlx::query(
            "SELECT id, kanban_chain_id, status_chain_id, status_current, leadtime_days,
                    container_type, quantity, is_active, status_revision, last_updated
             FROM kanbans WHERE id = ?",
        )
        .bind(kanban_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kanban_from_row))
    }

    pub async fn list_kanbans(
        &self,
        kanban_chain_id: Option<KanbanChainId>,
        include_inactive: bool,
    ) -> Result<Vec<Kanban>> {
        let rows = sqlx::query(
            "SELECT id, kanban_chain_id, status_chain_id, status_current, leadtime_days,
                    container_type, quantity, is_active, status_revision, last_updated
             FROM kanbans
             WHERE (?1 IS NULL OR kanban_chain_id = ?1) AND (?2 OR is_active = 1)
             ORDER BY id",
        )
        .bind(kanban_chain_id.map(|id| id.0))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(kanban_from_row).collect())
    }

    /// Writes the editable fields only. Status, revision and `last_updated`
    /// are left untouched.
    pub async fn update_kanban_fields(
        &self,
        kanban_id: KanbanId,
        mask: &KanbanFieldMask,
    ) -> Result<Option<Kanban>> {
        let row = sqlx::query(
            "UPDATE kanbans
             SET leadtime_days = COALESCE(?, leadtime_days),
                 container_type = COALESCE(?, container_type),
                 quantity = COALESCE(?, quantity)
             WHERE id = ?
             RETURNING id, kanban_chain_id, status_chain_id, status_current, leadtime_days,
                       container_type, quantity, is_active, status_revision, last_updated",
        )
        .bind(mask.leadtime_days)
        .bind(mask.container_type.as_deref())
        .bind(mask.quantity)
        .bind(kanban_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kanban_from_row))
    }

    pub async fn deactivate_kanban(&self, kanban_id: KanbanId) -> Result<Option<Kanban>> {
        let row = sqlx::query(
            "UPDATE kanbans SET is_active = 0 WHERE id = ?
             RETURNING id, kanban_chain_id, status_chain_id, status_current, leadtime_days,
                       container_type, quantity, is_active, status_revision, last_updated",
        )
        .bind(kanban_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kanban_from_row))
    }

    pub async fn set_kanban_status(
        &self,
        kanban_id: KanbanId,
        expected_revision: i64,
        next_status: StatusId,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Kanban>> {
        let row = sqlx::query(
            "UPDATE kanbans
             SET status_current = ?, last_updated = ?, status_revision = status_revision + 1
             WHERE id = ? AND status_revision = ?
             RETURNING id, kanban_chain_id, status_chain_id, status_current, leadtime_days,
                       container_type, quantity, is_active, status_revision, last_updated",
        )
        .bind(next_status.0)
        .bind(updated_at)
        .bind(kanban_id.0)
        .bind(expected_revision)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kanban_from_row))
    }

    pub async fn insert_kanban_history(
        &self,
        kanban_id: KanbanId,
        previous_status: StatusId,
        next_status: StatusId,
        recorded_at: DateTime<Utc>,
    ) -> Result<HistoryId> {
        let rec = sqlx::query(
            "INSERT INTO kanban_histories (kanban_id, previous_status, next_status, recorded_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(kanban_id.0)
        .bind(previous_status.0)
        .bind(next_status.0)
        .bind(recorded_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(HistoryId(rec.get::<i64, _>(0)))
    }

    /// History rows of one kanban, oldest first.
    pub async fn list_kanban_history(&self, kanban_id: KanbanId) -> Result<Vec<KanbanHistory>> {
        let rows = sqlx::query(
            "SELECT id, kanban_id, previous_status, next_status, recorded_at
             FROM kanban_histories
             WHERE kanban_id = ?
             ORDER BY id ASC",
        )
        .bind(kanban_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| KanbanHistory {
                id: HistoryId(r.get::<i64, _>("id")),
                kanban_id: KanbanId(r.get::<i64, _>("kanban_id")),
                previous_status: StatusId(r.get::<i64, _>("previous_status")),
                next_status: StatusId(r.get::<i64, _>("next_status")),
                recorded_at: r.get::<DateTime<Utc>, _>("recorded_at"),
            })
            .collect())
    }

    /// Active kanbans of every chain where `account_id` plays the given
    /// side, joined with product, status and counterparty metadata.
    pub async fn dashboard_kanbans(
        &self,
        perspective: DashboardPerspective,
        account_id: AccountId,
    ) -> Result<Vec<DashboardKanban>> {
        let query = match perspective {
            DashboardPerspective::Customer => CUSTOMER_DASHBOARD_QUERY,
            DashboardPerspective::Supplier => SUPPLIER_DASHBOARD_QUERY,
        };
        let rows = sqlx::query(query)
            .bind(account_id.0)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(dashboard_kanban_from_row).collect()
    }
}

#[async_trait]
impl KanbanStore for Storage {
    async fn load_kanban(&self, kanban_id: KanbanId) -> Result<Option<Kanban>> {
        self.get_kanban(kanban_id).await
    }

    async fn ordered_chain_entries(
        &self,
        status_chain_id: StatusChainId,
    ) -> Result<Vec<StatusChainEntry>> {
        self.list_status_chain_entries(status_chain_id).await
    }

    async fn write_status(
        &self,
        kanban_id: KanbanId,
        expected_revision: i64,
        next_status: StatusId,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Kanban>> {
        self.set_kanban_status(kanban_id, expected_revision, next_status, updated_at)
            .await
    }

    async fn append_history(
        &self,
        kanban_id: KanbanId,
        previous_status: StatusId,
        next_status: StatusId,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        self.insert_kanban_history(kanban_id, previous_status, next_status, recorded_at)
            .await?;
        Ok(())
    }
}

async fn ordered_chain_entries(
    conn: &mut SqliteConnection,
    status_chain_id: StatusChainId,
) -> Result<Vec<StatusChainEntry>> {
    let rows = sqlx::query(
        r#"SELECT status_chain_id, status_id, "order", actor_role
           FROM status_chains_statuses
           WHERE status_chain_id = ?
           ORDER BY "order" ASC, status_id ASC"#,
    )
    .bind(status_chain_id.0)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(status_chain_entry_from_row).collect()
}

async fn insert_chain_entries(
    conn: &mut SqliteConnection,
    status_chain_id: StatusChainId,
    entries: &[StatusChainEntryInput],
) -> Result<()> {
    ensure_distinct_statuses(status_chain_id, entries)?;
    for entry in entries {
        let already_member: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM status_chains_statuses WHERE status_chain_id = ? AND status_id = ?",
        )
        .bind(status_chain_id.0)
        .bind(entry.status_id.0)
        .fetch_optional(&mut *conn)
        .await?;
        if already_member.is_some() {
            return Err(IntegrityError::DuplicateStatus {
                status_chain_id,
                status_id: entry.status_id,
            }
            .into());
        }

        sqlx::query(
            r#"INSERT INTO status_chains_statuses (status_chain_id, status_id, "order", actor_role)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(status_chain_id.0)
        .bind(entry.status_id.0)
        .bind(entry.order)
        .bind(entry.actor_role.as_str())
        .execute(&mut *conn)
        .await?;
    }
    ensure_unique_orders(conn, status_chain_id).await
}

fn ensure_distinct_statuses(
    status_chain_id: StatusChainId,
    entries: &[StatusChainEntryInput],
) -> Result<()> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.status_id) {
            return Err(IntegrityError::DuplicateStatus {
                status_chain_id,
                status_id: entry.status_id,
            }
            .into());
        }
    }
    Ok(())
}

async fn ensure_unique_orders(
    conn: &mut SqliteConnection,
    status_chain_id: StatusChainId,
) -> Result<()> {
    let duplicate: Option<i64> = sqlx::query_scalar(
        r#"SELECT "order"
           FROM status_chains_statuses
           WHERE status_chain_id = ?
           GROUP BY "order"
           HAVING COUNT(*) > 1
           ORDER BY "order"
           LIMIT 1"#,
    )
    .bind(status_chain_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    match duplicate {
        Some(order) => Err(IntegrityError::DuplicateOrder {
            status_chain_id,
            order,
        }
        .into()),
        None => Ok(()),
    }
}

async fn first_status_in_chain(
    conn: &mut SqliteConnection,
    status_chain_id: StatusChainId,
) -> Result<Option<StatusId>> {
    let status: Option<i64> = sqlx::query_scalar(
        r#"SELECT status_id
           FROM status_chains_statuses
           WHERE status_chain_id = ?
           ORDER BY "order" ASC, status_id ASC
           LIMIT 1"#,
    )
    .bind(status_chain_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(status.map(StatusId))
}

async fn insert_initial_kanbans(
    conn: &mut SqliteConnection,
    kanban_chain: &KanbanChain,
    count: u32,
) -> Result<Vec<Kanban>> {
    let first_status = first_status_in_chain(&mut *conn, kanban_chain.status_chain_id)
        .await?
        .ok_or(IntegrityError::EmptyStatusChain(kanban_chain.status_chain_id))?;
    let now = Utc::now();

    let mut kanbans = Vec::new();
    for _ in 0..count {
        let row = sqlx::query(
            "INSERT INTO kanbans (
                kanban_chain_id, status_chain_id, status_current, leadtime_days,
                container_type, quantity, is_active, status_revision, last_updated
             ) VALUES (?, ?, ?, ?, ?, ?, 1, 0, ?)
             RETURNING id, kanban_chain_id, status_chain_id, status_current, leadtime_days,
                       container_type, quantity, is_active, status_revision, last_updated",
        )
        .bind(kanban_chain.id.0)
        .bind(kanban_chain.status_chain_id.0)
        .bind(first_status.0)
        .bind(kanban_chain.leadtime_days)
        .bind(&kanban_chain.container_type)
        .bind(kanban_chain.quantity)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        kanbans.push(kanban_from_row(&row));
    }
    Ok(kanbans)
}

fn actor_role_from_db(value: &str) -> Result<ActorRole> {
    ActorRole::from_str(value)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("stored actor_role '{value}' is not a known role"))
}

fn status_chain_entry_from_row(r: &SqliteRow) -> Result<StatusChainEntry> {
    Ok(StatusChainEntry {
        status_chain_id: StatusChainId(r.get::<i64, _>("status_chain_id")),
        status_id: StatusId(r.get::<i64, _>("status_id")),
        order: r.get::<i64, _>("order"),
        actor_role: actor_role_from_db(&r.get::<String, _>("actor_role"))?,
    })
}

fn dashboard_kanban_from_row(r: &SqliteRow) -> Result<DashboardKanban> {
    Ok(DashboardKanban {
        kanban_id: KanbanId(r.get::<i64, _>("kanban_id")),
        kanban_chain_id: KanbanChainId(r.get::<i64, _>("kanban_chain_id")),
        product_code: r.get::<Option<String>, _>("product_code").map(ProductCode),
        product_name: r.get::<Option<String>, _>("product_name"),
        container_type: r.get::<String, _>("container_type"),
        quantity: r.get::<f64, _>("quantity"),
        leadtime_days: r.get::<i64, _>("leadtime_days"),
        status_id: StatusId(r.get::<i64, _>("status_current")),
        status_name: r.get::<Option<String>, _>("status_name"),
        status_color: r.get::<Option<String>, _>("status_color"),
        actor_role: r
            .get::<Option<String>, _>("actor_role")
            .map(|role| actor_role_from_db(&role))
            .transpose()?,
        counterparty_id: AccountId(r.get::<i64, _>("counterparty_id")),
        counterparty_name: r.get::<Option<String>, _>("counterparty_name"),
        last_updated: r.get::<DateTime<Utc>, _>("last_updated"),
    })
}

fn account_from_row(r: &SqliteRow) -> Account {
    Account {
        id: AccountId(r.get::<i64, _>("id")),
        name: r.get::<String, _>("name"),
        vat_number: r.get::<String, _>("vat_number"),
        address: r.get::<String, _>("address"),
    }
}

fn product_from_row(r: &SqliteRow) -> Product {
    Product {
        product_code: ProductCode(r.get::<String, _>("product_code")),
        name: r.get::<String, _>("name"),
    }
}

fn status_from_row(r: &SqliteRow) -> Status {
    Status {
        id: StatusId(r.get::<i64, _>("id")),
        name: r.get::<String, _>("name"),
        color: r.get::<String, _>("color"),
    }
}

fn status_chain_from_row(r: &SqliteRow) -> StatusChain {
    StatusChain {
        id: StatusChainId(r.get::<i64, _>("id")),
        name: r.get::<String, _>("name"),
    }
}

fn kanban_chain_from_row(r: &SqliteRow) -> KanbanChain {
    KanbanChain {
        id: KanbanChainId(r.get::<i64, _>("id")),
        customer_account_id: AccountId(r.get::<i64, _>("customer_account_id")),
        product_code: ProductCode(r.get::<String, _>("product_code")),
        supplier_account_id: AccountId(r.get::<i64, _>("supplier_account_id")),
        leadtime_days: r.get::<i64, _>("leadtime_days"),
        quantity: r.get::<f64, _>("quantity"),
        container_type: r.get::<String, _>("container_type"),
        status_chain_id: StatusChainId(r.get::<i64, _>("status_chain_id")),
        target_active_kanban_count: r.get::<i64, _>("target_active_kanban_count"),
    }
}

fn kanban_from_row(r: &SqliteRow) -> Kanban {
    Kanban {
        id: KanbanId(r.get::<i64, _>("id")),
        kanban_chain_id: KanbanChainId(r.get::<i64, _>("kanban_chain_id")),
        status_chain_id: StatusChainId(r.get::<i64, _>("status_chain_id")),
        status_current: StatusId(r.get::<i64, _>("status_current")),
        leadtime_days: r.get::<i64, _>("leadtime_days"),
        container_type: r.get::<String, _>("container_type"),
        quantity: r.get::<f64, _>("quantity"),
        is_active: r.get::<bool, _>("is_active"),
        status_revision: r.get::<i64, _>("status_revision"),
        last_updated: r.get::<DateTime<Utc>, _>("last_updated"),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
