//! Testing infrastructure for mender.
//!
//! Scripted test doubles for the execution adapter and the reasoning
//! capability, plus fixtures for building artifacts and transcripts.
//! Everything here runs without a browser runner or a model.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::testing::{ScriptedAdapter, ScriptedReasoner};
//!
//! let adapter = ScriptedAdapter::new()
//!     .then(Ok(selector_failure("#login")))
//!     .then(Ok(passing()));
//! let reasoner = ScriptedReasoner::new().then(Ok(patch_json));
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;

pub use mocks::*;
