//! Shared plumbing for the gfxtrace crates.

pub mod logging;
