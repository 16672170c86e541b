//! Core types shared by the trace builder and the rank list.
//!
//! - [`id`]: Identifier types (`SymbolId`, `RecordId`, `Time`)

pub mod id;

pub use id::{RecordId, SymbolId, Time};
