//! The healing loop.
//!
//! - [`state`]: session states, transitions and adapter backoff
//! - [`controller`]: the retry controller driving one session
//! - [`pool`]: bounded concurrent sessions for several artifacts

pub mod controller;
pub mod pool;
pub mod state;

pub use controller::RetryController;
pub use pool::heal_many;
pub use state::{calculate_backoff, HealState};
