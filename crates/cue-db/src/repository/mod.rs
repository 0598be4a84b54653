//! # Repositories
//!
//! One repository per aggregate. Each wraps a clone of the pool and maps
//! rows to `cue-core` types.

pub mod session;
pub mod table;
pub mod tariff;
