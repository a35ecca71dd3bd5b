//! Scenario and adversarial test suite for the Tarn sync core.
//!
//! The integration tests under `tests/` drive a real [`SyncManager`] (or the
//! tokio runner around it) against the in-memory collaborators in
//! [`helpers`], and check the externally visible decisions: which requests
//! go out, which peers are dropped, and what reaches the chain.
//!
//! [`SyncManager`]: tarn_netsync::SyncManager

pub mod helpers;
