//! In-process caching tier.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Gateway                    │
//! └───────────┬──────────────────────┬───────────┘
//!             │                      │
//!     ┌───────▼────────┐     ┌───────▼─────────┐
//!     │ InProcessCache │     │ RequestCollapser│
//!     │ • LRU by store │     │ • key → watch   │
//!     │ • fresh/stale/ │     │ • bg: namespace │
//!     │   expired      │     │   for refreshes │
//!     └────────────────┘     └─────────────────┘
//! ```
//!
//! Nothing here survives a restart; the durable tier lives in [`crate::store`].

pub mod collapser;
pub mod memory;

pub use collapser::{InflightHandle, RequestCollapser, Slot};
pub use memory::{CacheStats, CachedValue, InProcessCache, Lookup};
