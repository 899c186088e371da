//! Order Matching Module
//!
//! Price-time-priority matching over the streaming read model.
//!
//! # Architecture
//!
//! ```text
//! scheduling loop / CycleRequester
//!   v
//! MatchingEngine (one cycle at a time, adaptive polling)
//!   |-> ReadModel (sorted book per pair)
//!   |-> book (crossing + maker-price selection)
//!   '-> Settlement (fill, allocation legs, trade record)
//! ```

mod book;
mod engine;
mod types;

pub use book::{crosses, execution_price, select_match};
pub use engine::{MatchingConfig, MatchingEngine};
pub use types::{CycleOutcome, CycleRequester, MatchCandidate, MatchingError};
