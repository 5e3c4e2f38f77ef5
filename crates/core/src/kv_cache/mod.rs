//! Key-value cache bookkeeping on the host side.
//!
//! The engine owns the actual cache tensors; [`TokenCache`] mirrors which
//! token ids they hold so prompts sharing a prefix can skip re-decoding it.

mod error;
pub mod prefix_cache;
mod prefix_cache_stats;

pub use error::CacheError;
pub use prefix_cache::{ReusePlan, TokenCache};
pub use prefix_cache_stats::ReuseStats;
