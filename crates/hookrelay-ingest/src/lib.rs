//! Ingestion side of the pipeline.
//!
//! Verifies provider signatures on raw webhook bodies, then persists and
//! publishes events through the [`coordinator::IngestCoordinator`]. The
//! HTTP front door lives outside this crate; callers hand in the raw body
//! and headers they received.

pub mod coordinator;
pub mod crypto;
pub mod republisher;
pub mod verifier;

pub use coordinator::{IngestCoordinator, IngestError, IngestReceipt};
pub use republisher::{Republisher, RepublisherConfig};
pub use verifier::{VerifiedEvent, Verifier, VerifyError};
