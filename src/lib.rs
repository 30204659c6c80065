pub mod clock;
pub mod gcra;
pub mod item;
pub mod keys;
pub mod metrics;
pub mod partition;
pub mod processor;
pub mod queue_shard;
pub mod retry;
pub mod settings;
pub mod storage;
pub mod tenant;
pub mod trace;

pub use shoal_macros::test;
