//! Delivery side of the pipeline.
//!
//! Consumes published events, fans them out into per-subscription
//! deliveries, executes signed POSTs with claim-based exclusivity, and
//! retries failures on an exponential backoff schedule until success or
//! dead letter.

pub mod client;
pub mod consumer;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod retry;
pub mod scheduler;

pub use client::{ClientConfig, DeliveryClient};
pub use consumer::{ConsumerConfig, ConsumerPool};
pub use error::{DeliveryError, Result};
pub use executor::{DeliveryExecutor, ExecuteOutcome};
pub use fanout::{FanoutOutcome, FanoutResolver};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{RetryScheduler, SchedulerConfig};
