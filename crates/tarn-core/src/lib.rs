//! # tarn-core
//! Foundation types, chain parameters, and proof-of-work rules for Tarn.

pub mod chaincfg;
pub mod error;
pub mod mempool;
pub mod merkle;
pub mod pow;
pub mod types;
