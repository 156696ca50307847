#![allow(clippy::new_without_default)]

//! Ambient stack shared by the `reactor`, `dispatcher` and `resolver` crates: logging setup,
//! the common timestamp helper, and the `ErrorUtils`/`Wait` plumbing every fallible network
//! operation in this workspace is built on.

pub mod error;
pub mod logging;
pub mod time;
