//! Debounced filesystem watching for resource trees
//!
//! One [`WatcherRegistry`] owns every active watch. Watches are
//! reference-counted per key so concurrent callers share a single native
//! watcher, and raw events are coalesced in a quiet-gap window before the
//! change handler fires. When native notifications cannot be installed the
//! watch degrades to periodic snapshot polling.

#![allow(dead_code)]

pub mod poll;
pub mod registry;

pub use registry::{
    watch_signature, ChangeEvent, ChangeHandler, WatchConfig, WatchMode, WatcherRegistry,
    DEFAULT_DEBOUNCE, POLL_INTERVAL,
};
