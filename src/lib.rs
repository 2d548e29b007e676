//! Block-level delta patches between directory trees.
//!
//! The pieces, leaves first:
//!
//! - [`container`] describes a tree, [`signature`] hashes its blocks.
//! - [`pool`] reads and writes files by index, whatever the storage.
//! - [`create`] diffs a new tree against an old signature, [`rediff`]
//!   shrinks the result with bsdiff.
//! - [`apply`] rebuilds the new tree, fresh or in place.
//! - [`validator`] checks a tree against a signature and reports
//!   [`wounds`], which a [`healer`] can repair.
//!
//! None of it prints: progress and messages go through a
//! [`consumer::Consumer`] supplied by the caller.

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod bsdiff;
pub mod checkpoint;
pub mod compression;
pub mod consumer;
pub mod container;
pub mod create;
pub mod error;
pub mod healer;
pub mod overlay;
pub mod patch_format;
pub mod pool;
pub mod probe;
pub mod rediff;
pub mod rolling_hash;
pub mod signature;
pub mod util;
pub mod validator;
pub mod wire;
pub mod wounds;

pub use error::{Error, Result};
