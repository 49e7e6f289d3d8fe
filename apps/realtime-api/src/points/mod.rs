pub mod actions;
pub mod leaderboard;
pub mod processor;
