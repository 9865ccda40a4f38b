//! CLI command implementations for kiri.
//!
//! Each module corresponds to one subcommand. `daemon` holds the client-side
//! supervisor shared by every command that needs a running daemon; `serve`
//! is the daemon process itself.

pub mod daemon;
pub mod index;
pub mod mcp;
pub mod serve;
pub mod start;
pub mod status;
pub mod stop;
