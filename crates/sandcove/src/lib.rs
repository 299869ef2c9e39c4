//! sandcove: a sidecar process supervisor driven over stdin/stdout.
//!
//! The host writes length-prefixed CALL and STDIN frames; the supervisor
//! replies, forks children (each of which may itself become a supervisor),
//! and proxies their output back tagged with their pid.

pub mod bootstrap;
pub mod bridge;
pub mod calls;
pub mod child;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod signal;
pub mod term;

pub use calls::{CallTable, SysCalls};
pub use config::Config;
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use term::Term;
