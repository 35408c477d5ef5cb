#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # iwill
//!
//! Command-line tooling around the public will feed.
//!
//! This library re-exports the feed crate for convenience.

pub use iwill_feed;

pub mod cli;
pub mod replay;
