use std::collections::HashMap;

use bitcoin::Txid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::types::{InscriberError, Result, StructuredError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Commit,
    Reveal,
}

impl TransactionType {
    fn id_prefix(&self) -> &'static str {
        match self {
            TransactionType::Commit => "commit",
            TransactionType::Reveal => "reveal",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirming,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;

        matches!(
            (self, next),
            (Pending, Confirming) | (Pending, Failed) | (Confirming, Confirmed) | (Confirming, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Confirmed | TransactionStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub id: String,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub txid: Option<Txid>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub error: Option<StructuredError>,
    pub events: Vec<ProgressEvent>,
}

/// Bookkeeping for commit and reveal transactions of one inscriber.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    transactions: HashMap<String, TrackedTransaction>,
    next_id: u64,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self), target = "ord_inscriber::tracker")]
    pub fn add_transaction(&mut self, tx_type: TransactionType, parent_id: Option<&str>) -> String {
        self.next_id += 1;
        let id = format!("{}-{}", tx_type.id_prefix(), self.next_id);
        let now = Utc::now();

        self.transactions.insert(
            id.clone(),
            TrackedTransaction {
                id: id.clone(),
                tx_type,
                status: TransactionStatus::Pending,
                txid: None,
                parent_id: parent_id.map(str::to_string),
                created_at: now,
                last_updated_at: now,
                error: None,
                events: Vec::new(),
            },
        );

        debug!(%id, "Tracking new transaction");
        id
    }

    pub fn set_transaction_txid(&mut self, id: &str, txid: Txid) -> Result<()> {
        let tx = self.get_mut(id)?;
        tx.txid = Some(txid);
        tx.last_updated_at = Utc::now();
        Ok(())
    }

    #[instrument(skip(self), target = "ord_inscriber::tracker")]
    pub fn set_transaction_status(&mut self, id: &str, status: TransactionStatus) -> Result<()> {
        let tx = self.get_mut(id)?;
        if !tx.status.can_transition_to(status) {
            return Err(InscriberError::InvalidStateTransition {
                id: id.to_string(),
                from: tx.status,
                to: status,
            });
        }

        debug!(from = ?tx.status, to = ?status, "Transaction status changed");
        tx.status = status;
        tx.last_updated_at = Utc::now();
        Ok(())
    }

    /// Records the error and marks the transaction failed, whatever its current status.
    pub fn set_transaction_error(&mut self, id: &str, error: &InscriberError) -> Result<()> {
        let tx = self.get_mut(id)?;
        warn!(%id, error = %error, "Transaction failed");
        tx.error = Some(error.to_structured());
        tx.status = TransactionStatus::Failed;
        tx.last_updated_at = Utc::now();
        Ok(())
    }

    pub fn add_transaction_progress_event(
        &mut self,
        id: &str,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let tx = self.get_mut(id)?;
        tx.events.push(ProgressEvent {
            message: message.into(),
            timestamp,
            data,
        });
        tx.last_updated_at = Utc::now();
        Ok(())
    }

    pub fn get_transaction(&self, id: &str) -> Option<&TrackedTransaction> {
        self.transactions.get(id)
    }

    pub fn get_child_transactions(&self, parent_id: &str) -> Vec<&TrackedTransaction> {
        let mut children: Vec<_> = self
            .transactions
            .values()
            .filter(|tx| tx.parent_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by_key(|tx| tx.created_at);
        children
    }

    /// All tracked transactions, oldest first.
    pub fn snapshot(&self) -> Vec<TrackedTransaction> {
        let mut all: Vec<_> = self.transactions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut TrackedTransaction> {
        self.transactions
            .get_mut(id)
            .ok_or_else(|| InscriberError::UnknownTransaction(id.to_string()))
    }
}
