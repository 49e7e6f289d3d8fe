//! Period leaderboards with incremental re-ranking.
//!
//! Each period keeps a rank-sorted vector of standings. Score changes remove
//! the user's old row and binary-search the new row into place, so a single
//! earn never re-sorts the whole board. Periodic reconciliation rebuilds the
//! boards from the ledger and repairs any drift.
//!
//! Ordering: points descending, then earliest `achieved_at` (who got there
//! first wins the tie), then user ID for a total order.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::leaderboard::{LeaderboardEntry, Period};
use crate::models::transaction::PointTransaction;

/// A user's score within one period window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standing {
    pub user_id: String,
    pub points: i64,
    /// When the user reached their current score.
    pub achieved_at: DateTime<Utc>,
}

fn rank_cmp(a: &Standing, b: &Standing) -> Ordering {
    b.points
        .cmp(&a.points)
        .then_with(|| a.achieved_at.cmp(&b.achieved_at))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

struct PeriodBoard {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    /// Sorted by `rank_cmp`. Users with zero or negative scores are dropped.
    entries: Vec<Standing>,
}

impl PeriodBoard {
    fn fresh(period: Period, now: DateTime<Utc>) -> Self {
        let (start, end) = period.window(now);
        Self {
            start,
            end,
            entries: Vec::new(),
        }
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Apply a score delta. Returns true if the board changed.
    fn apply_delta(&mut self, user_id: &str, delta: i64, at: DateTime<Utc>) -> bool {
        let old = self
            .entries
            .iter()
            .position(|s| s.user_id == user_id)
            .map(|idx| self.entries.remove(idx));

        let points = old.as_ref().map(|s| s.points).unwrap_or(0) + delta;
        if points <= 0 {
            return old.is_some();
        }

        let standing = Standing {
            user_id: user_id.to_string(),
            points,
            achieved_at: at,
        };
        let idx = self
            .entries
            .binary_search_by(|probe| rank_cmp(probe, &standing))
            .unwrap_or_else(|i| i);
        self.entries.insert(idx, standing);
        true
    }
}

pub struct LeaderboardEngine {
    boards: Mutex<HashMap<Period, PeriodBoard>>,
}

impl LeaderboardEngine {
    pub fn new() -> Self {
        Self {
            boards: Mutex::new(HashMap::new()),
        }
    }

    /// Record a score delta at `at`. Returns the periods whose standings
    /// changed (a delta outside a period's current window does not touch it).
    pub fn apply_delta(&self, user_id: &str, delta: i64, at: DateTime<Utc>) -> Vec<Period> {
        if delta == 0 {
            return Vec::new();
        }
        let now = Utc::now();
        let mut boards = self.boards.lock();
        let mut changed = Vec::new();
        for period in Period::ALL {
            let board = roll(&mut boards, period, now);
            if board.contains(at) && board.apply_delta(user_id, delta, at) {
                changed.push(period);
            }
        }
        changed
    }

    /// A page of a period's leaderboard, ranks assigned at read time.
    pub fn get(&self, period: Period, limit: usize, offset: usize) -> Vec<LeaderboardEntry> {
        let now = Utc::now();
        let mut boards = self.boards.lock();
        let board = roll(&mut boards, period, now);
        board
            .entries
            .iter()
            .skip(offset)
            .take(limit)
            .enumerate()
            .map(|(i, s)| LeaderboardEntry {
                user_id: s.user_id.clone(),
                period,
                points: s.points,
                rank: (offset + i + 1) as u64,
                period_start: board.start,
                period_end: board.end,
            })
            .collect()
    }

    /// A user's current rank and points in a period, if they are on the board.
    pub fn standing_of(&self, period: Period, user_id: &str) -> Option<LeaderboardEntry> {
        let now = Utc::now();
        let mut boards = self.boards.lock();
        let board = roll(&mut boards, period, now);
        board
            .entries
            .iter()
            .position(|s| s.user_id == user_id)
            .map(|idx| LeaderboardEntry {
                user_id: user_id.to_string(),
                period,
                points: board.entries[idx].points,
                rank: (idx + 1) as u64,
                period_start: board.start,
                period_end: board.end,
            })
    }

    /// Rebuild every board from completed ledger rows. Returns the periods
    /// whose standings differed from the incremental state.
    pub fn reconcile(&self, rows: &[PointTransaction]) -> Vec<Period> {
        let now = Utc::now();
        let mut boards = self.boards.lock();
        let mut changed = Vec::new();

        for period in Period::ALL {
            let (start, end) = period.window(now);

            // user → (points, last contributing timestamp)
            let mut totals: HashMap<&str, (i64, DateTime<Utc>)> = HashMap::new();
            for row in rows {
                if row.created_at < start || row.created_at >= end {
                    continue;
                }
                let entry = totals
                    .entry(row.user_id.as_str())
                    .or_insert((0, row.created_at));
                entry.0 += row.total_points;
                if row.created_at > entry.1 {
                    entry.1 = row.created_at;
                }
            }

            let mut entries: Vec<Standing> = totals
                .into_iter()
                .filter(|(_, (points, _))| *points > 0)
                .map(|(user_id, (points, achieved_at))| Standing {
                    user_id: user_id.to_string(),
                    points,
                    achieved_at,
                })
                .collect();
            entries.sort_by(rank_cmp);

            let board = roll(&mut boards, period, now);
            if board.entries != entries {
                tracing::warn!(period = %period, "leaderboard drift repaired by reconciliation");
                board.entries = entries;
                changed.push(period);
            }
        }
        changed
    }
}

impl Default for LeaderboardEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch a period's board, resetting it if its window has rolled over.
fn roll(
    boards: &mut HashMap<Period, PeriodBoard>,
    period: Period,
    now: DateTime<Utc>,
) -> &mut PeriodBoard {
    let board = boards
        .entry(period)
        .or_insert_with(|| PeriodBoard::fresh(period, now));
    if now >= board.end {
        *board = PeriodBoard::fresh(period, now);
    }
    board
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transaction::TransactionStatus;
    use serde_json::Value;

    fn tx(user: &str, total: i64, at: DateTime<Utc>) -> PointTransaction {
        PointTransaction {
            id: format!("ptx_{user}_{total}"),
            user_id: user.to_string(),
            action_type: "FURNITURE_POSTED".to_string(),
            points: total,
            multiplier: 1.0,
            total_points: total,
            status: TransactionStatus::Completed,
            reverses: None,
            metadata: Value::Null,
            created_at: at,
        }
    }

    #[test]
    fn higher_points_rank_first() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();
        engine.apply_delta("usr_a", 50, now);
        engine.apply_delta("usr_b", 150, now);
        engine.apply_delta("usr_c", 100, now);

        let top = engine.get(Period::AllTime, 10, 0);
        let order: Vec<&str> = top.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(order, vec!["usr_b", "usr_c", "usr_a"]);
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[2].rank, 3);
    }

    #[test]
    fn ties_break_on_achieved_at_then_user_id() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(60);

        // Same points, usr_b got there first.
        engine.apply_delta("usr_a", 100, now);
        engine.apply_delta("usr_b", 100, earlier);

        let order: Vec<String> = engine
            .get(Period::AllTime, 10, 0)
            .into_iter()
            .map(|e| e.user_id)
            .collect();
        assert_eq!(order, vec!["usr_b", "usr_a"]);

        // Same points AND same timestamp: user ID decides.
        engine.apply_delta("usr_c", 100, earlier);
        let order: Vec<String> = engine
            .get(Period::AllTime, 10, 0)
            .into_iter()
            .map(|e| e.user_id)
            .collect();
        assert_eq!(order, vec!["usr_b", "usr_c", "usr_a"]);
    }

    #[test]
    fn accumulating_updates_achieved_at() {
        let engine = LeaderboardEngine::new();
        let t1 = Utc::now() - chrono::Duration::seconds(60);
        let t2 = Utc::now();

        engine.apply_delta("usr_a", 50, t1);
        engine.apply_delta("usr_b", 100, t1);
        // usr_a catches up later; usr_b reached 100 first and stays ahead.
        engine.apply_delta("usr_a", 50, t2);

        let order: Vec<String> = engine
            .get(Period::AllTime, 10, 0)
            .into_iter()
            .map(|e| e.user_id)
            .collect();
        assert_eq!(order, vec!["usr_b", "usr_a"]);
    }

    #[test]
    fn negative_delta_demotes_or_removes() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();
        engine.apply_delta("usr_a", 100, now);
        engine.apply_delta("usr_b", 50, now);

        engine.apply_delta("usr_a", -75, now);
        let top = engine.get(Period::AllTime, 10, 0);
        assert_eq!(top[0].user_id, "usr_b");
        assert_eq!(top[1].points, 25);

        // Down to zero: off the board entirely.
        engine.apply_delta("usr_a", -25, now);
        let top = engine.get(Period::AllTime, 10, 0);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].user_id, "usr_b");
    }

    #[test]
    fn pagination_has_no_duplicate_or_skipped_ranks() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();
        for i in 0..25 {
            engine.apply_delta(&format!("usr_{i:02}"), 100 + i, now);
        }

        let page1 = engine.get(Period::AllTime, 10, 0);
        let page2 = engine.get(Period::AllTime, 10, 10);
        let page3 = engine.get(Period::AllTime, 10, 20);

        let ranks: Vec<u64> = page1
            .iter()
            .chain(&page2)
            .chain(&page3)
            .map(|e| e.rank)
            .collect();
        assert_eq!(ranks, (1..=25).collect::<Vec<u64>>());

        let mut users: Vec<&str> = page1
            .iter()
            .chain(&page2)
            .chain(&page3)
            .map(|e| e.user_id.as_str())
            .collect();
        users.dedup();
        assert_eq!(users.len(), 25);
    }

    #[test]
    fn offset_past_the_end_is_empty() {
        let engine = LeaderboardEngine::new();
        engine.apply_delta("usr_a", 10, Utc::now());
        assert!(engine.get(Period::Daily, 10, 5).is_empty());
    }

    #[test]
    fn old_timestamps_skip_rolled_windows() {
        let engine = LeaderboardEngine::new();
        let last_year = Utc::now() - chrono::Duration::days(400);

        let changed = engine.apply_delta("usr_a", 50, last_year);
        // Only the all-time board still spans that timestamp.
        assert_eq!(changed, vec![Period::AllTime]);
        assert!(engine.get(Period::Daily, 10, 0).is_empty());
        assert_eq!(engine.get(Period::AllTime, 10, 0).len(), 1);
    }

    #[test]
    fn standing_of_reports_rank() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();
        engine.apply_delta("usr_a", 100, now);
        engine.apply_delta("usr_b", 200, now);

        let standing = engine.standing_of(Period::AllTime, "usr_a").unwrap();
        assert_eq!(standing.rank, 2);
        assert_eq!(standing.points, 100);
        assert!(engine.standing_of(Period::AllTime, "usr_zzz").is_none());
    }

    #[test]
    fn reconcile_matches_incremental_state() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();
        let rows = vec![tx("usr_a", 50, now), tx("usr_b", 100, now)];
        for row in &rows {
            engine.apply_delta(&row.user_id, row.total_points, row.created_at);
        }

        // In-sync boards: reconciliation reports nothing.
        assert!(engine.reconcile(&rows).is_empty());
    }

    #[test]
    fn reconcile_repairs_drift() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();

        // Incremental state missed usr_b's transaction.
        engine.apply_delta("usr_a", 50, now);
        let rows = vec![tx("usr_a", 50, now), tx("usr_b", 100, now)];

        let changed = engine.reconcile(&rows);
        assert_eq!(changed.len(), Period::ALL.len());

        let top = engine.get(Period::Daily, 10, 0);
        assert_eq!(top[0].user_id, "usr_b");
        assert_eq!(top[1].user_id, "usr_a");
    }

    #[test]
    fn reconcile_nets_out_reversals() {
        let engine = LeaderboardEngine::new();
        let now = Utc::now();
        // A completed earn whose effect was later reversed leaves the ledger's
        // completed view; only surviving rows are passed in here.
        let rows = vec![tx("usr_a", 50, now)];
        engine.reconcile(&rows);
        let top = engine.get(Period::Daily, 10, 0);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].points, 50);
    }
}
