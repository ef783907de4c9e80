//! Research MCP Server
//!
//! A Model Context Protocol (MCP) server exposing research tools — web
//! search, page scraping, document parsing, transcript extraction, and
//! multi-step research tracking — over stdio and HTTP+SSE transports.
//!
//! # Features
//!
//! - **Resumable streaming**: every SSE frame is persisted, so clients
//!   reconnect with `Last-Event-ID` and replay what they missed
//! - **Persistent caching**: two-tier cache with single-flight and
//!   stale-while-revalidate
//! - **Resilient**: per-dependency circuit breakers, per-call deadlines,
//!   SSRF policy on every outbound fetch
//! - **Authenticated**: OAuth 2.1 bearer validation with JWKS caching and
//!   composite scopes
//!
//! # Example
//!
//! ```no_run
//! use research_mcp::{config::Config, server::McpServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let server = McpServer::new(config).await?;
//!     server.run_stdio().await
//! }
//! ```

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod resilience;
pub mod security;
pub mod server;
pub mod text;
pub mod tools;

pub use config::Config;
pub use error::{ErrorKind, FetchError, ToolError};
pub use server::McpServer;
