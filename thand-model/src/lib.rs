//! Object model for Thand access-elevation workflow documents.
//!
//! This crate defines the parsed form of a workflow document that the
//! execution engine consumes: the document envelope, the tagged union of
//! task definitions, flow targets, CloudEvents and their filters, ISO-8601
//! durations, and the elevation request domain object.
//!
//! Parsing a document is a plain `serde` deserialization from YAML or JSON;
//! this crate performs no validation beyond what the data model requires.

mod document;
mod duration;
mod elevation;
mod event;
mod task;

pub use document::*;
pub use duration::*;
pub use elevation::*;
pub use event::*;
pub use task::*;
