//! Admin endpoint handlers.

pub mod cache;
pub mod ledger;
