#![forbid(unsafe_code)]

//! Keeps a local mirror of YouTube playlists and channels in sync with a
//! per-collection manifest.

pub mod config;
pub mod fetch;
pub mod manifest;
pub mod mux;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod sanitize;
pub mod stats;
