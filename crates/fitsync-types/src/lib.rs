//! fitsync Types - Shared domain types
//!
//! This crate contains the domain types shared by the reconciliation crates:
//! - User identity
//! - Subscription records, statuses and billing periods
//! - Cache entries, activation results and recovery attempts
//! - Cross-context sync messages

pub mod activation;
pub mod cache;
pub mod error;
pub mod message;
pub mod period;
pub mod recovery;
pub mod subscription;
pub mod user;

pub use activation::*;
pub use cache::*;
pub use error::*;
pub use message::*;
pub use period::*;
pub use recovery::*;
pub use subscription::*;
pub use user::*;
