use std::collections::BTreeMap;

use shared::{
    domain::AccountId,
    error::ApiError,
    protocol::{Dashboard, DashboardKanban, DashboardPerspective, ProductGroup, UNKNOWN_PRODUCT},
};
use tracing::debug;

use crate::{get_account, store_failure, ApiContext};

/// Active kanbans of every chain where the account is the customer.
pub async fn customer_dashboard(
    ctx: &ApiContext,
    account_id: AccountId,
) -> Result<Dashboard, ApiError> {
    build_dashboard(ctx, DashboardPerspective::Customer, account_id).await
}

/// Active kanbans of every chain where the account is the supplier.
pub async fn supplier_dashboard(
    ctx: &ApiContext,
    account_id: AccountId,
) -> Result<Dashboard, ApiError> {
    build_dashboard(ctx, DashboardPerspective::Supplier, account_id).await
}

async fn build_dashboard(
    ctx: &ApiContext,
    perspective: DashboardPerspective,
    account_id: AccountId,
) -> Result<Dashboard, ApiError> {
    get_account(ctx, account_id).await?;
    let rows = ctx
        .storage
        .dashboard_kanbans(perspective, account_id)
        .await
        .map_err(store_failure)?;
    debug!(%account_id, ?perspective, kanbans = rows.len(), "dashboard rows loaded");

    Ok(Dashboard {
        account_id,
        perspective,
        products: group_by_product(rows),
    })
}

/// Groups rows by product code, sorted by code. Rows without a resolvable
/// product end up in a trailing [`UNKNOWN_PRODUCT`] group.
pub fn group_by_product(rows: Vec<DashboardKanban>) -> Vec<ProductGroup> {
    let mut groups: BTreeMap<String, ProductGroup> = BTreeMap::new();
    let mut unknown = Vec::new();

    for row in rows {
        let Some(code) = row.product_code.clone() else {
            unknown.push(row);
            continue;
        };
        groups
            .entry(code.0)
            .or_insert_with_key(|key| ProductGroup {
                product_key: key.clone(),
                product_name: row.product_name.clone(),
                kanbans: Vec::new(),
            })
            .kanbans
            .push(row);
    }

    let mut products: Vec<ProductGroup> = groups.into_values().collect();
    if !unknown.is_empty() {
        products.push(ProductGroup {
            product_key: UNKNOWN_PRODUCT.to_string(),
            product_name: None,
            kanbans: unknown,
        });
    }
    products
}
