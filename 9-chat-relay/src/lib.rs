//! Multi-client line relay over TCP.
//!
//! Clients connect, send one line with their username, and from then on every
//! line they send is written verbatim to every other connected client. See
//! `README.md` for usage. Each module covers one concern:
//!
//! - [`server`] accepts TCP connections and spawns one session task each.
//! - [`session`] runs the username handshake, the receive loop, and teardown.
//! - [`registry`] tracks admitted sessions behind a single lock and fans
//!   broadcasts out to them.
//! - [`line`] reads and writes newline-terminated UTF-8 lines.
//! - [`notice`] formats the join and leave lines the server sends itself.
//! - [`client`] is the terminal client; [`cli`] parses both modes.

pub mod cli;
pub mod client;
pub mod line;
pub mod notice;
pub mod registry;
pub mod server;
pub mod session;
