//! Model Context Protocol front end: JSON-RPC over stdio.

pub mod protocol;
mod server;

pub use server::McpServer;
