use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AccountId, ActorRole, Kanban, KanbanChain, KanbanChainId, KanbanId, ProductCode, StatusChain,
    StatusChainEntry, StatusChainId, StatusId,
};

/// Dashboard bucket for kanbans whose product cannot be resolved.
pub const UNKNOWN_PRODUCT: &str = "unknown product";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInput {
    pub name: String,
    #[serde(default)]
    pub vat_number: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInput {
    pub product_code: ProductCode,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInput {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChainEntryInput {
    pub status_id: StatusId,
    pub order: i64,
    pub actor_role: ActorRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStatusChain {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<StatusChainEntryInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameStatusChain {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChainDetail {
    pub status_chain: StatusChain,
    pub entries: Vec<StatusChainEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewKanbanChain {
    pub customer_account_id: AccountId,
    pub product_code: ProductCode,
    pub supplier_account_id: AccountId,
    pub leadtime_days: i64,
    pub quantity: f64,
    pub container_type: String,
    pub status_chain_id: StatusChainId,
    pub target_active_kanban_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKanbanChainRequest {
    pub kanban_chain: NewKanbanChain,
    /// Defaults to the chain's target active kanban count.
    #[serde(default)]
    pub initial_kanbans: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanChainWithKanbans {
    pub kanban_chain: KanbanChain,
    pub kanbans: Vec<Kanban>,
}

/// Kanban chain joined with the display names of the parties and product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanChainSummary {
    pub kanban_chain: KanbanChain,
    pub customer_name: Option<String>,
    pub supplier_name: Option<String>,
    pub product_name: Option<String>,
    pub active_kanbans: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TopUpRequest {
    pub count: u32,
}

/// Editable kanban fields. Status changes go through advance only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KanbanFieldMask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leadtime_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
}

impl KanbanFieldMask {
    pub fn is_empty(&self) -> bool {
        self.leadtime_days.is_none() && self.container_type.is_none() && self.quantity.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KanbanChainFieldMask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leadtime_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_active_kanban_count: Option<i64>,
}

impl KanbanChainFieldMask {
    pub fn is_empty(&self) -> bool {
        self.leadtime_days.is_none()
            && self.container_type.is_none()
            && self.quantity.is_none()
            && self.target_active_kanban_count.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardPerspective {
    Customer,
    Supplier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardKanban {
    pub kanban_id: KanbanId,
    pub kanban_chain_id: KanbanChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_code: Option<ProductCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    pub container_type: String,
    pub quantity: f64,
    pub leadtime_days: i64,
    pub status_id: StatusId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_role: Option<ActorRole>,
    pub counterparty_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_name: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductGroup {
    /// Product code, or [`UNKNOWN_PRODUCT`] for unresolvable products.
    pub product_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    pub kanbans: Vec<DashboardKanban>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub account_id: AccountId,
    pub perspective: DashboardPerspective,
    pub products: Vec<ProductGroup>,
}
