//! analytics-mcp - MCP tool server for a BI platform's REST API.
//!
//! This library exposes the core modules for use by the binary and in
//! integration tests.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod mcp;
pub mod query;
pub mod safety;
pub mod session;
pub mod tools;
