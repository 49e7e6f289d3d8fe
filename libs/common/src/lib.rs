pub mod id;
pub mod snowflake;

pub use id::{prefixed_ulid, PrefixedId};
pub use snowflake::SnowflakeGenerator;
