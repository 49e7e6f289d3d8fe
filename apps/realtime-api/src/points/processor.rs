//! Point transaction processor.
//!
//! All transactions for one user are serialized through a per-user async
//! mutex, so two concurrent earns read-modify-write the ledger one at a time
//! and no update is lost. Different users never contend.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use refurnish_common::id::{prefix, prefixed_ulid};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::FanoutError;
use crate::models::leaderboard::Period;
use crate::models::transaction::{PointTransaction, TransactionStatus};
use crate::stores::ledger::PointLedger;

use super::actions::action_spec;
use super::leaderboard::LeaderboardEngine;

/// Outcome of applying or reversing a transaction.
#[derive(Debug)]
pub struct Applied {
    pub transaction: PointTransaction,
    /// The user's balance after this transaction.
    pub balance: i64,
    /// Periods whose leaderboard standings changed.
    pub changed_periods: Vec<Period>,
}

pub struct PointProcessor {
    ledger: Arc<dyn PointLedger>,
    leaderboard: Arc<LeaderboardEngine>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PointProcessor {
    pub fn new(ledger: Arc<dyn PointLedger>, leaderboard: Arc<LeaderboardEngine>) -> Self {
        Self {
            ledger,
            leaderboard,
            locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply an earn: validate the action and multiplier, reject awards that
    /// would exceed the per-action ceiling, append a completed ledger row,
    /// and feed the delta to the leaderboards.
    pub async fn apply(
        &self,
        user_id: &str,
        action_type: &str,
        multiplier: Option<f64>,
        metadata: Value,
    ) -> Result<Applied, FanoutError> {
        let spec = action_spec(action_type).ok_or_else(|| {
            FanoutError::validation(format!("unknown action type: {action_type}"))
        })?;

        let multiplier = multiplier.unwrap_or(1.0);
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(FanoutError::validation("multiplier must be positive"));
        }
        if multiplier > spec.max_multiplier {
            return Err(FanoutError::validation(format!(
                "multiplier {multiplier} exceeds maximum {} for {action_type}",
                spec.max_multiplier
            )));
        }

        let total_points = (spec.base_points as f64 * multiplier).round() as i64;
        if total_points > spec.ceiling {
            return Err(FanoutError::validation(format!(
                "award of {total_points} exceeds the {} ceiling for {action_type}",
                spec.ceiling
            )));
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let transaction = PointTransaction {
            id: prefixed_ulid(prefix::TRANSACTION),
            user_id: user_id.to_string(),
            action_type: action_type.to_string(),
            points: spec.base_points,
            multiplier,
            total_points,
            status: TransactionStatus::Completed,
            reverses: None,
            metadata,
            created_at: Utc::now(),
        };
        self.ledger.append(transaction.clone()).await?;
        let balance = self.ledger.current_balance(user_id).await?;
        let changed_periods =
            self.leaderboard
                .apply_delta(user_id, total_points, transaction.created_at);

        tracing::debug!(
            user_id,
            action_type,
            total_points,
            balance,
            transaction_id = %transaction.id,
            "points applied"
        );

        Ok(Applied {
            transaction,
            balance,
            changed_periods,
        })
    }

    /// Reverse a completed transaction. The original row flips to `reversed`
    /// (leaving the ledger) and a compensating audit row is appended; the row
    /// itself is never edited beyond its status. The compensating delta is
    /// fed to the leaderboards immediately, the same path an earn takes.
    pub async fn reverse(&self, transaction_id: &str) -> Result<Applied, FanoutError> {
        let original = self
            .ledger
            .get(transaction_id)
            .await?
            .ok_or_else(|| {
                FanoutError::not_found(format!("Transaction {transaction_id} not found"))
            })?;

        let lock = self.user_lock(&original.user_id);
        let _guard = lock.lock().await;

        // Rejects double reversal and non-completed rows.
        self.ledger.mark_reversed(transaction_id).await?;

        let compensating = PointTransaction {
            id: prefixed_ulid(prefix::TRANSACTION),
            user_id: original.user_id.clone(),
            action_type: original.action_type.clone(),
            points: -original.points,
            multiplier: original.multiplier,
            total_points: -original.total_points,
            status: TransactionStatus::Reversed,
            reverses: Some(original.id.clone()),
            metadata: original.metadata.clone(),
            created_at: Utc::now(),
        };
        self.ledger.append(compensating.clone()).await?;
        let balance = self.ledger.current_balance(&original.user_id).await?;
        let changed_periods = self.leaderboard.apply_delta(
            &original.user_id,
            compensating.total_points,
            compensating.created_at,
        );

        tracing::info!(
            user_id = %original.user_id,
            reversed = %original.id,
            compensating = %compensating.id,
            balance,
            "transaction reversed"
        );

        Ok(Applied {
            transaction: compensating,
            balance,
            changed_periods,
        })
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, FanoutError> {
        self.ledger.current_balance(user_id).await
    }
}
