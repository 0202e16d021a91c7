//! Common test utilities for fitsync-reconcile integration tests

pub mod mock_ports;

#[allow(unused_imports)]
pub use mock_ports::{subscription, user, MockDocumentStore, MockPaymentFunctions};
