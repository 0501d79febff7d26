//! Lead and deal pipeline state for a CRM front-end.
//!
//! Record collections, the filter/sort engine, selection, bulk mutation,
//! the stage pipeline, CSV exchange and the AI insight layer, all owned by
//! the typed container in [`state`].

pub mod bulk;
pub mod config;
pub mod csv_io;
pub mod dashboard;
pub mod error;
pub mod filter;
pub mod insights;
pub mod notification;
pub mod pipeline;
pub mod selection;
pub mod state;
pub mod store;
pub mod tasks;
pub mod types;
pub mod util;

pub use error::CrmError;

// =============================================================================
// Shared test utilities
// =============================================================================
