//! Tower middleware layers for the async-query pipeline.
//!
//! - [`timeout`]: Per-query timeout enforcement
//! - [`load_shed`]: Semaphore-based concurrency limiting

pub mod load_shed;
pub mod timeout;

pub use load_shed::{LoadShedLayer, LoadShedService};
pub use timeout::{TimeoutLayer, TimeoutService};
