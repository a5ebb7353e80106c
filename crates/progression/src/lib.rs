//! Status-chain progression: moves a kanban to the next status of its chain
//! and records the transition in the history ledger.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{Kanban, KanbanId, StatusChainEntry, StatusChainId, StatusId};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProgressionError {
    #[error("kanban {0} not found")]
    KanbanNotFound(KanbanId),
    #[error("status chain {0} has no entries")]
    EmptyChain(StatusChainId),
    #[error("current status {status} is not a member of status chain {status_chain_id}")]
    StatusNotInChain {
        status: StatusId,
        status_chain_id: StatusChainId,
    },
    #[error("kanban {0} changed status while it was being advanced")]
    Conflict(KanbanId),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Persistence required by [`advance`].
#[async_trait]
pub trait KanbanStore: Send + Sync {
    async fn load_kanban(&self, kanban_id: KanbanId) -> Result<Option<Kanban>>;

    /// Entries of the chain, ascending by `order`.
    async fn ordered_chain_entries(
        &self,
        status_chain_id: StatusChainId,
    ) -> Result<Vec<StatusChainEntry>>;

    /// Sets `status_current` and `last_updated` and increments the status
    /// revision, but only while the stored revision still equals
    /// `expected_revision`. Returns `None` when the revision moved on.
    async fn write_status(
        &self,
        kanban_id: KanbanId,
        expected_revision: i64,
        next_status: StatusId,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Kanban>>;

    async fn append_history(
        &self,
        kanban_id: KanbanId,
        previous_status: StatusId,
        next_status: StatusId,
        recorded_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Resolves the status that follows `current` in `entries`, which must be
/// sorted ascending by `order`. The chain is cyclic: the last entry is
/// followed by the first one.
pub fn next_status(
    status_chain_id: StatusChainId,
    current: StatusId,
    entries: &[StatusChainEntry],
) -> Result<StatusId, ProgressionError> {
    let first = entries
        .first()
        .ok_or(ProgressionError::EmptyChain(status_chain_id))?;
    let position = entries
        .iter()
        .position(|entry| entry.status_id == current)
        .ok_or(ProgressionError::StatusNotInChain {
            status: current,
            status_chain_id,
        })?;

    Ok(entries
        .get(position + 1)
        .map(|entry| entry.status_id)
        .unwrap_or(first.status_id))
}

/// Advances a kanban one step along its status chain.
///
/// The status write is committed before the history row is appended. A
/// failing history write is logged and the advanced kanban is still returned.
pub async fn advance<S>(store: &S, kanban_id: KanbanId) -> Result<Kanban, ProgressionError>
where
    S: KanbanStore + ?Sized,
{
    let kanban = store
        .load_kanban(kanban_id)
        .await?
        .ok_or(ProgressionError::KanbanNotFound(kanban_id))?;
    let entries = store.ordered_chain_entries(kanban.status_chain_id).await?;
    let next = next_status(kanban.status_chain_id, kanban.status_current, &entries)?;
    debug!(
        kanban_id = %kanban.id,
        status_chain_id = %kanban.status_chain_id,
        from = %kanban.status_current,
        to = %next,
        "resolved next status"
    );

    let now = Utc::now();
    let updated = store
        .write_status(kanban.id, kanban.status_revision, next, now)
        .await?
        .ok_or(ProgressionError::Conflict(kanban.id))?;

    if let Err(error) = store
        .append_history(kanban.id, kanban.status_current, next, now)
        .await
    {
        warn!(
            kanban_id = %kanban.id,
            previous_status = %kanban.status_current,
            next_status = %next,
            %error,
            "failed to record kanban history; status transition kept"
        );
    }

    info!(
        kanban_id = %updated.id,
        previous_status = %kanban.status_current,
        status_current = %updated.status_current,
        "kanban advanced"
    );
    Ok(updated)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
