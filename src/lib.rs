//! A self populating, in process cache for async rust.
//!
//! Register a loader and the cache fetches data lazily on first access, then optionally keeps itself
//! fresh in the background on a fixed period. Concurrent first accesses run the loader exactly once
//! and every caller waits on that single run.
//!
//! # Quick Start
//! Use [`crate::BulkCache`] when one call returns the whole data set, and [`crate::KeyedCache`] when values
//! are fetched one key at a time.

/// A cache filled all at once by a single loader call.
pub mod bulk;
#[doc(inline)]
pub use bulk::BulkCache;

/// A cache filled one key at a time, with a concurrency cap on background refreshes.
pub mod keyed;
#[doc(inline)]
pub use keyed::KeyedCache;

/// The run-once primitive both caches load through.
pub mod gate;
#[doc(inline)]
pub use gate::Gate;

/// The concurrent map holding loaded entries. Designed to keep readers and writers of different keys apart.
pub mod store;
#[doc(inline)]
pub use store::EntryStore;

pub mod load;
pub use load::{BulkLoad, Load};

pub mod error;
pub use error::BuildError;

mod refresh;
