//! Event hub client: partition consumption, management queries and token grants

pub mod cbs;
pub mod client;
pub mod consumer;
pub mod management;

pub use cbs::TokenManager;
pub use client::EventHubClient;
pub use consumer::subscribe_partitions;
pub use management::get_partition_ids;
