//! Account-level storage metadata.

pub mod summary;

pub use summary::StoreSummary;
