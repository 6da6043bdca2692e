//! trellis-core: Core library for Trellis
//!
//! This crate hosts the session hierarchy of a terminal/browser multiplexer,
//! its control socket and its cross-restart persistence.
//!
//! # Architecture
//!
//! ```text
//! CLI / automation ─► control socket (line + structured calls)
//!                            │
//!                        Dispatcher ─► Session (RwLock<SessionTree>)
//!                            │              │
//!                      Tree/Query view   Persistence engine ─► snapshot JSON
//! ```
//!
//! # Modules
//!
//! - `identity`: opaque IDs and positional handles
//! - `layout`: binary pane split tree
//! - `surface`: terminal and browser surface adapters
//! - `session`: window → workspace → pane → surface tree and its operations
//! - `persistence`: snapshot save/restore
//! - `query`: aggregated tree view and text rendering
//! - `protocol`: wire format of the control socket
//! - `dispatch`: maps requests onto session operations
//! - `server` / `client`: Unix socket transport
//! - `host`: process lifecycle (restore, serve, autosave, final save)
//! - `config`: configuration management
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod identity;
pub mod layout;
pub mod logging;
pub mod persistence;
pub mod protocol;
pub mod query;
pub mod server;
pub mod session;
pub mod surface;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
