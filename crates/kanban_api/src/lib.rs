use progression::ProgressionError;
use shared::{
    domain::{
        Account, AccountId, Kanban, KanbanChain, KanbanChainId, KanbanHistory, KanbanId, Product,
        ProductCode, Status, StatusChain, StatusChainEntry, StatusChainId, StatusId,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AccountInput, KanbanChainFieldMask, KanbanChainSummary, KanbanChainWithKanbans,
        KanbanFieldMask, NewKanbanChain, NewStatusChain, ProductInput, StatusChainDetail,
        StatusChainEntryInput, StatusInput,
    },
};
use storage::{IntegrityError, Storage};
use tracing::{error, info};

pub mod dashboard;

pub use dashboard::{customer_dashboard, group_by_product, supplier_dashboard};

/// Upper bound on kanbans created by a single create or top-up call.
pub const MAX_KANBANS_PER_BATCH: u32 = 500;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

pub async fn create_account(ctx: &ApiContext, input: &AccountInput) -> Result<Account, ApiError> {
    require_name("account", &input.name)?;
    let account = ctx
        .storage
        .create_account(input)
        .await
        .map_err(store_failure)?;
    info!(account_id = %account.id, name = %account.name, "account created");
    Ok(account)
}

pub async fn get_account(ctx: &ApiContext, account_id: AccountId) -> Result<Account, ApiError> {
    ctx.storage
        .get_account(account_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("account {account_id} not found")))
}

pub async fn list_accounts(ctx: &ApiContext) -> Result<Vec<Account>, ApiError> {
    ctx.storage.list_accounts().await.map_err(store_failure)
}

pub async fn update_account(
    ctx: &ApiContext,
    account_id: AccountId,
    input: &AccountInput,
) -> Result<Account, ApiError> {
    require_name("account", &input.name)?;
    ctx.storage
        .update_account(account_id, input)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("account {account_id} not found")))
}

pub async fn delete_account(ctx: &ApiContext, account_id: AccountId) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_account(account_id)
        .await
        .map_err(store_failure)?;
    if !deleted {
        return Err(ApiError::not_found(format!("account {account_id} not found")));
    }
    Ok(())
}

pub async fn create_product(ctx: &ApiContext, input: &ProductInput) -> Result<Product, ApiError> {
    if input.product_code.as_str().trim().is_empty() {
        return Err(ApiError::validation("product code must not be empty"));
    }
    require_name("product", &input.name)?;
    let product = ctx
        .storage
        .create_product(input)
        .await
        .map_err(store_failure)?;
    info!(product_code = %product.product_code, "product created");
    Ok(product)
}

pub async fn get_product(ctx: &ApiContext, product_code: &ProductCode) -> Result<Product, ApiError> {
    ctx.storage
        .get_product(product_code)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("product {product_code} not found")))
}

pub async fn list_products(ctx: &ApiContext) -> Result<Vec<Product>, ApiError> {
    ctx.storage.list_products().await.map_err(store_failure)
}

pub async fn rename_product(
    ctx: &ApiContext,
    product_code: &ProductCode,
    name: &str,
) -> Result<Product, ApiError> {
    require_name("product", name)?;
    ctx.storage
        .rename_product(product_code, name)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("product {product_code} not found")))
}

pub async fn delete_product(ctx: &ApiContext, product_code: &ProductCode) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_product(product_code)
        .await
        .map_err(store_failure)?;
    if !deleted {
        return Err(ApiError::not_found(format!("product {product_code} not found")));
    }
    Ok(())
}

pub async fn create_status(ctx: &ApiContext, input: &StatusInput) -> Result<Status, ApiError> {
    require_name("status", &input.name)?;
    let status = ctx
        .storage
        .create_status(input)
        .await
        .map_err(store_failure)?;
    info!(status_id = %status.id, name = %status.name, "status created");
    Ok(status)
}

pub async fn get_status(ctx: &ApiContext, status_id: StatusId) -> Result<Status, ApiError> {
    ctx.storage
        .get_status(status_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("status {status_id} not found")))
}

pub async fn list_statuses(ctx: &ApiContext) -> Result<Vec<Status>, ApiError> {
    ctx.storage.list_statuses().await.map_err(store_failure)
}

pub async fn update_status(
    ctx: &ApiContext,
    status_id: StatusId,
    input: &StatusInput,
) -> Result<Status, ApiError> {
    require_name("status", &input.name)?;
    ctx.storage
        .update_status(status_id, input)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("status {status_id} not found")))
}

pub async fn delete_status(ctx: &ApiContext, status_id: StatusId) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_status(status_id)
        .await
        .map_err(store_failure)?;
    if !deleted {
        return Err(ApiError::not_found(format!("status {status_id} not found")));
    }
    Ok(())
}

pub async fn create_status_chain(
    ctx: &ApiContext,
    input: &NewStatusChain,
) -> Result<StatusChainDetail, ApiError> {
    require_name("status chain", &input.name)?;
    ensure_statuses_exist(ctx, &input.entries).await?;
    let detail = ctx
        .storage
        .create_status_chain(input)
        .await
        .map_err(store_failure)?;
    info!(
        status_chain_id = %detail.status_chain.id,
        entries = detail.entries.len(),
        "status chain created"
    );
    Ok(detail)
}

pub async fn get_status_chain(
    ctx: &ApiContext,
    status_chain_id: StatusChainId,
) -> Result<StatusChainDetail, ApiError> {
    let status_chain = load_status_chain(ctx, status_chain_id).await?;
    let entries = ctx
        .storage
        .list_status_chain_entries(status_chain_id)
        .await
        .map_err(store_failure)?;
    Ok(StatusChainDetail {
        status_chain,
        entries,
    })
}

pub async fn list_status_chains(ctx: &ApiContext) -> Result<Vec<StatusChain>, ApiError> {
    ctx.storage.list_status_chains().await.map_err(store_failure)
}

pub async fn rename_status_chain(
    ctx: &ApiContext,
    status_chain_id: StatusChainId,
    name: &str,
) -> Result<StatusChain, ApiError> {
    require_name("status chain", name)?;
    ctx.storage
        .rename_status_chain(status_chain_id, name)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("status chain {status_chain_id} not found")))
}

pub async fn delete_status_chain(
    ctx: &ApiContext,
    status_chain_id: StatusChainId,
) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_status_chain(status_chain_id)
        .await
        .map_err(store_failure)?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "status chain {status_chain_id} not found"
        )));
    }
    info!(%status_chain_id, "status chain deleted");
    Ok(())
}

pub async fn list_status_chain_entries(
    ctx: &ApiContext,
    status_chain_id: StatusChainId,
) -> Result<Vec<StatusChainEntry>, ApiError> {
    load_status_chain(ctx, status_chain_id).await?;
    ctx.storage
        .list_status_chain_entries(status_chain_id)
        .await
        .map_err(store_failure)
}

pub async fn attach_status_chain_entries(
    ctx: &ApiContext,
    status_chain_id: StatusChainId,
    entries: &[StatusChainEntryInput],
) -> Result<Vec<StatusChainEntry>, ApiError> {
    load_status_chain(ctx, status_chain_id).await?;
    ensure_statuses_exist(ctx, entries).await?;
    let ordered = ctx
        .storage
        .attach_status_chain_entries(status_chain_id, entries)
        .await
        .map_err(store_failure)?;
    info!(%status_chain_id, attached = entries.len(), "status chain entries attached");
    Ok(ordered)
}

pub async fn update_status_chain_entries(
    ctx: &ApiContext,
    status_chain_id: StatusChainId,
    entries: &[StatusChainEntryInput],
) -> Result<Vec<StatusChainEntry>, ApiError> {
    load_status_chain(ctx, status_chain_id).await?;
    let ordered = ctx
        .storage
        .update_status_chain_entries(status_chain_id, entries)
        .await
        .map_err(store_failure)?;
    info!(%status_chain_id, updated = entries.len(), "status chain entries updated");
    Ok(ordered)
}

/// Creates a kanban chain and its initial kanbans atomically.
/// `initial_kanbans` defaults to the chain's target active kanban count.
pub async fn create_kanban_chain(
    ctx: &ApiContext,
    input: &NewKanbanChain,
    initial_kanbans: Option<u32>,
) -> Result<KanbanChainWithKanbans, ApiError> {
    if input.leadtime_days < 0 {
        return Err(ApiError::validation("leadtime_days must not be negative"));
    }
    if input.target_active_kanban_count < 0 {
        return Err(ApiError::validation(
            "target_active_kanban_count must not be negative",
        ));
    }
    get_account(ctx, input.customer_account_id).await?;
    get_account(ctx, input.supplier_account_id).await?;
    get_product(ctx, &input.product_code).await?;
    load_status_chain(ctx, input.status_chain_id).await?;

    let count = match initial_kanbans {
        Some(count) => count,
        None => u32::try_from(input.target_active_kanban_count)
            .map_err(|_| ApiError::validation("target_active_kanban_count is out of range"))?,
    };
    ensure_batch_size(count)?;

    let created = ctx
        .storage
        .create_kanban_chain_with_kanbans(input, count)
        .await
        .map_err(store_failure)?;
    info!(
        kanban_chain_id = %created.kanban_chain.id,
        status_chain_id = %created.kanban_chain.status_chain_id,
        kanbans = created.kanbans.len(),
        "kanban chain created"
    );
    Ok(created)
}

pub async fn add_kanbans_to_chain(
    ctx: &ApiContext,
    kanban_chain_id: KanbanChainId,
    count: u32,
) -> Result<Vec<Kanban>, ApiError> {
    ensure_batch_size(count)?;
    let kanbans = ctx
        .storage
        .add_kanbans_to_chain(kanban_chain_id, count)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("kanban chain {kanban_chain_id} not found")))?;
    info!(%kanban_chain_id, added = kanbans.len(), "kanban chain topped up");
    Ok(kanbans)
}

pub async fn get_kanban_chain(
    ctx: &ApiContext,
    kanban_chain_id: KanbanChainId,
) -> Result<KanbanChain, ApiError> {
    ctx.storage
        .get_kanban_chain(kanban_chain_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("kanban chain {kanban_chain_id} not found")))
}

pub async fn list_kanban_chains(ctx: &ApiContext) -> Result<Vec<KanbanChainSummary>, ApiError> {
    ctx.storage.list_kanban_chains().await.map_err(store_failure)
}

pub async fn update_kanban_chain(
    ctx: &ApiContext,
    kanban_chain_id: KanbanChainId,
    mask: &KanbanChainFieldMask,
) -> Result<KanbanChain, ApiError> {
    if mask.is_empty() {
        return get_kanban_chain(ctx, kanban_chain_id).await;
    }
    if mask.target_active_kanban_count.is_some_and(|count| count < 0) {
        return Err(ApiError::validation(
            "target_active_kanban_count must not be negative",
        ));
    }
    ctx.storage
        .update_kanban_chain(kanban_chain_id, mask)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("kanban chain {kanban_chain_id} not found")))
}

pub async fn delete_kanban_chain(
    ctx: &ApiContext,
    kanban_chain_id: KanbanChainId,
) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_kanban_chain(kanban_chain_id)
        .await
        .map_err(store_failure)?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "kanban chain {kanban_chain_id} not found"
        )));
    }
    Ok(())
}

pub async fn get_kanban(ctx: &ApiContext, kanban_id: KanbanId) -> Result<Kanban, ApiError> {
    ctx.storage
        .get_kanban(kanban_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("kanban {kanban_id} not found")))
}

pub async fn list_kanbans(
    ctx: &ApiContext,
    kanban_chain_id: Option<KanbanChainId>,
    include_inactive: bool,
) -> Result<Vec<Kanban>, ApiError> {
    if let Some(kanban_chain_id) = kanban_chain_id {
        get_kanban_chain(ctx, kanban_chain_id).await?;
    }
    ctx.storage
        .list_kanbans(kanban_chain_id, include_inactive)
        .await
        .map_err(store_failure)
}

/// Applies a field mask. Status and revision are never touched and an empty
/// mask returns the kanban as stored.
pub async fn update_kanban_fields(
    ctx: &ApiContext,
    kanban_id: KanbanId,
    mask: &KanbanFieldMask,
) -> Result<Kanban, ApiError> {
    if mask.is_empty() {
        return get_kanban(ctx, kanban_id).await;
    }
    if mask.leadtime_days.is_some_and(|days| days < 0) {
        return Err(ApiError::validation("leadtime_days must not be negative"));
    }
    ctx.storage
        .update_kanban_fields(kanban_id, mask)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("kanban {kanban_id} not found")))
}

pub async fn deactivate_kanban(ctx: &ApiContext, kanban_id: KanbanId) -> Result<Kanban, ApiError> {
    let kanban = ctx
        .storage
        .deactivate_kanban(kanban_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("kanban {kanban_id} not found")))?;
    info!(%kanban_id, "kanban deactivated");
    Ok(kanban)
}

pub async fn advance_kanban(ctx: &ApiContext, kanban_id: KanbanId) -> Result<Kanban, ApiError> {
    progression::advance(&ctx.storage, kanban_id)
        .await
        .map_err(progression_failure)
}

pub async fn kanban_history(
    ctx: &ApiContext,
    kanban_id: KanbanId,
) -> Result<Vec<KanbanHistory>, ApiError> {
    get_kanban(ctx, kanban_id).await?;
    ctx.storage
        .list_kanban_history(kanban_id)
        .await
        .map_err(store_failure)
}

async fn load_status_chain(
    ctx: &ApiContext,
    status_chain_id: StatusChainId,
) -> Result<StatusChain, ApiError> {
    ctx.storage
        .get_status_chain(status_chain_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found(format!("status chain {status_chain_id} not found")))
}

async fn ensure_statuses_exist(
    ctx: &ApiContext,
    entries: &[StatusChainEntryInput],
) -> Result<(), ApiError> {
    for entry in entries {
        get_status(ctx, entry.status_id).await?;
    }
    Ok(())
}

fn require_name(kind: &str, name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::validation(format!("{kind} name must not be empty")));
    }
    Ok(())
}

fn ensure_batch_size(count: u32) -> Result<(), ApiError> {
    if count > MAX_KANBANS_PER_BATCH {
        return Err(ApiError::validation(format!(
            "cannot create {count} kanbans at once, the limit is {MAX_KANBANS_PER_BATCH}"
        )));
    }
    Ok(())
}

fn progression_failure(err: ProgressionError) -> ApiError {
    match err {
        ProgressionError::KanbanNotFound(_) => ApiError::not_found(err.to_string()),
        ProgressionError::EmptyChain(_) | ProgressionError::StatusNotInChain { .. } => {
            ApiError::invalid_state(err.to_string())
        }
        ProgressionError::Conflict(_) => ApiError::new(ErrorCode::Conflict, err.to_string()),
        ProgressionError::Store(source) => store_failure(source),
    }
}

fn store_failure(err: anyhow::Error) -> ApiError {
    if let Some(integrity) = err.downcast_ref::<IntegrityError>() {
        let code = match integrity {
            IntegrityError::EmptyStatusChain(_)
            | IntegrityError::StatusChainInUse(_)
            | IntegrityError::KanbanChainHasKanbans(_) => ErrorCode::InvalidState,
            IntegrityError::DuplicateOrder { .. } | IntegrityError::DuplicateStatus { .. } => {
                ErrorCode::Validation
            }
            IntegrityError::UnknownEntry { .. } => ErrorCode::NotFound,
        };
        return ApiError::new(code, integrity.to_string());
    }
    error!(error = %format!("{err:#}"), "store operation failed");
    ApiError::new(ErrorCode::StoreFailure, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
