use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(AccountId);
id_newtype!(StatusId);
id_newtype!(StatusChainId);
id_newtype!(KanbanChainId);
id_newtype!(KanbanId);
id_newtype!(HistoryId);

/// Article code identifying a product. Products are keyed by code rather than
/// by a generated integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductCode(pub String);

impl ProductCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductCode {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Party responsible for acting while a kanban sits at a status chain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Supplier,
    Customer,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::Supplier => "supplier",
            ActorRole::Customer => "customer",
        }
    }
}

impl FromStr for ActorRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "supplier" => Ok(ActorRole::Supplier),
            "customer" => Ok(ActorRole::Customer),
            other => Err(format!("unknown actor role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub vat_number: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_code: ProductCode,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: StatusId,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChain {
    pub id: StatusChainId,
    pub name: String,
}

/// One step of a status chain. `order` is only meaningful relative to the
/// other entries of the same chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChainEntry {
    pub status_chain_id: StatusChainId,
    pub status_id: StatusId,
    pub order: i64,
    pub actor_role: ActorRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KanbanChain {
    pub id: KanbanChainId,
    pub customer_account_id: AccountId,
    pub product_code: ProductCode,
    pub supplier_account_id: AccountId,
    pub leadtime_days: i64,
    pub quantity: f64,
    pub container_type: String,
    pub status_chain_id: StatusChainId,
    pub target_active_kanban_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kanban {
    pub id: KanbanId,
    pub kanban_chain_id: KanbanChainId,
    pub status_chain_id: StatusChainId,
    pub status_current: StatusId,
    pub leadtime_days: i64,
    pub container_type: String,
    pub quantity: f64,
    pub is_active: bool,
    /// Incremented by every status transition.
    pub status_revision: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KanbanHistory {
    pub id: HistoryId,
    pub kanban_id: KanbanId,
    pub previous_status: StatusId,
    pub next_status: StatusId,
    pub recorded_at: DateTime<Utc>,
}
