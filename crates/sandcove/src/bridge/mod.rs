//! Host pipe protocol for sandcove.
//!
//! # Architecture
//!
//! - **protocol**: header shapes, message types, the depth-aware payload budget
//! - **codec**: length-delimited framing for the host pipe and for nested
//!   supervisors' stdout
//! - **host**: blocking, exact-length frame I/O on the host descriptors

pub mod codec;
pub mod host;
pub mod protocol;
