//! Translation Resource Index Module
//!
//! This module discovers resource roots, builds the merged translation index
//! and keeps it current as files change.
//!
//! # Architecture
//!
//! - **roots**: upward root discovery and per-file layout classification
//! - **builder**: full index construction from a set of roots
//! - **update**: incremental application of changed paths
//! - **index**: the merged candidate/winner data structure itself
//!
//! Priorities are fixed per file shape: i18next namespace files win over
//! next-intl root files, which win over next-intl namespace files. Lower
//! numbers win, and a file change only ever recomputes the pairs it touched.

// Library surface for embedding; the CLI only exercises part of it.
#![allow(dead_code)]

pub mod builder;
pub mod error;
pub mod index;
pub mod roots;
pub mod update;

pub use builder::build_index;
pub use error::ResourceError;
pub use index::{FileError, ResourceEntry, ResourceIndex, canonical_key, split_canonical_key};
pub use roots::{ConventionKind, ResourceFileShape, Root, resolve_roots};
pub use update::{ApplyOutcome, apply_changes};
