pub mod leaderboard;
pub mod message;
pub mod transaction;
