//! Point transaction model. The ledger is append-only: a reversal appends a
//! compensating row rather than editing history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

/// A single point-earning (or compensating) transaction.
///
/// Immutable once completed, except for the completed → reversed status
/// transition applied when a compensating row is appended. Point fields are
/// never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PointTransaction {
    /// `ptx_` prefixed ULID.
    pub id: String,
    pub user_id: String,
    pub action_type: String,
    /// Base points for the action, before the multiplier.
    pub points: i64,
    pub multiplier: f64,
    /// `points × multiplier`, rounded. Negated on a compensating row.
    pub total_points: i64,
    pub status: TransactionStatus,
    /// For a compensating row: the ID of the transaction it reverses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverses: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl PointTransaction {
    /// Whether this row counts toward the user's current balance.
    pub fn counts_toward_balance(&self) -> bool {
        self.status == TransactionStatus::Completed
    }
}
