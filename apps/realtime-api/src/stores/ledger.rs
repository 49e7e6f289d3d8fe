use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::FanoutError;
use crate::models::transaction::{PointTransaction, TransactionStatus};

/// Abstraction over the external append-only point-transaction ledger.
#[async_trait]
pub trait PointLedger: Send + Sync {
    /// Append a transaction row. Rows are never edited after this except for
    /// the completed → reversed status transition.
    async fn append(&self, tx: PointTransaction) -> Result<String, FanoutError>;

    async fn get(&self, id: &str) -> Result<Option<PointTransaction>, FanoutError>;

    /// Mark a completed transaction reversed. Point fields are untouched.
    async fn mark_reversed(&self, id: &str) -> Result<(), FanoutError>;

    /// Sum of `total_points` over the user's completed rows.
    async fn current_balance(&self, user_id: &str) -> Result<i64, FanoutError>;

    /// All completed rows, append order. Drives leaderboard reconciliation.
    async fn completed_transactions(&self) -> Result<Vec<PointTransaction>, FanoutError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single-node / tests)
// ---------------------------------------------------------------------------

pub struct MemoryPointLedger {
    rows: Mutex<Vec<PointTransaction>>,
}

impl MemoryPointLedger {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryPointLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PointLedger for MemoryPointLedger {
    async fn append(&self, tx: PointTransaction) -> Result<String, FanoutError> {
        let id = tx.id.clone();
        self.rows.lock().push(tx);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<PointTransaction>, FanoutError> {
        Ok(self.rows.lock().iter().find(|t| t.id == id).cloned())
    }

    async fn mark_reversed(&self, id: &str) -> Result<(), FanoutError> {
        let mut rows = self.rows.lock();
        let tx = rows
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| FanoutError::not_found(format!("Transaction {id} not found")))?;
        if tx.status != TransactionStatus::Completed {
            return Err(FanoutError::validation(format!(
                "only completed transactions can be reversed (status: {:?})",
                tx.status
            )));
        }
        tx.status = TransactionStatus::Reversed;
        Ok(())
    }

    async fn current_balance(&self, user_id: &str) -> Result<i64, FanoutError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|t| t.user_id == user_id && t.counts_toward_balance())
            .map(|t| t.total_points)
            .sum())
    }

    async fn completed_transactions(&self) -> Result<Vec<PointTransaction>, FanoutError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|t| t.status == TransactionStatus::Completed)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn tx(id: &str, user: &str, total: i64, status: TransactionStatus) -> PointTransaction {
        PointTransaction {
            id: id.to_string(),
            user_id: user.to_string(),
            action_type: "FURNITURE_POSTED".to_string(),
            points: total,
            multiplier: 1.0,
            total_points: total,
            status,
            reverses: None,
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn balance_sums_completed_only() {
        let ledger = MemoryPointLedger::new();
        ledger
            .append(tx("ptx_1", "usr_a", 50, TransactionStatus::Completed))
            .await
            .unwrap();
        ledger
            .append(tx("ptx_2", "usr_a", 30, TransactionStatus::Failed))
            .await
            .unwrap();
        ledger
            .append(tx("ptx_3", "usr_b", 70, TransactionStatus::Completed))
            .await
            .unwrap();

        assert_eq!(ledger.current_balance("usr_a").await.unwrap(), 50);
        assert_eq!(ledger.current_balance("usr_b").await.unwrap(), 70);
        assert_eq!(ledger.current_balance("usr_missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_reversed_excludes_from_balance() {
        let ledger = MemoryPointLedger::new();
        ledger
            .append(tx("ptx_1", "usr_a", 50, TransactionStatus::Completed))
            .await
            .unwrap();
        ledger.mark_reversed("ptx_1").await.unwrap();
        assert_eq!(ledger.current_balance("usr_a").await.unwrap(), 0);

        // Second reversal is rejected.
        let err = ledger.mark_reversed("ptx_1").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn mark_reversed_unknown_is_not_found() {
        let ledger = MemoryPointLedger::new();
        let err = ledger.mark_reversed("ptx_missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn completed_transactions_filters_status() {
        let ledger = MemoryPointLedger::new();
        ledger
            .append(tx("ptx_1", "usr_a", 50, TransactionStatus::Completed))
            .await
            .unwrap();
        ledger
            .append(tx("ptx_2", "usr_a", 30, TransactionStatus::Reversed))
            .await
            .unwrap();

        let completed = ledger.completed_transactions().await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, "ptx_1");
    }
}
