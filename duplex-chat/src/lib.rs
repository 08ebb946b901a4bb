//! Two-party text chat over a single TCP connection.
//!
//! One side waits for a peer (`server`), the other dials it (`client`).
//! After that both run the same loop: a single task watches the terminal and
//! the socket together and reacts to whichever becomes readable first.
//!
//! - [`cli`] parses the command line for both endpoint variants.
//! - [`establish`] connects or accepts exactly one peer and reports why that
//!   failed, with a suggested remedy.
//! - [`connection`] wraps the connected stream with an idempotent close.
//! - [`session`] is the duplex loop: it forwards typed lines to the peer and
//!   prints whatever the peer sends, until either side leaves.
//!
//! The session is generic over its console, connection and output so tests
//! can drive it with in-memory pipes instead of a terminal and a socket.

pub mod cli;
pub mod connection;
pub mod establish;
pub mod session;
