#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! termcast library — a PTY-backed terminal sharing server.
//!
//! This library re-exports the key building blocks:
//! - `config` — configuration loading
//! - `pty` — PTY allocation and process spawning
//! - `session` — session lifecycle, fan-out hub, and transcript recording
//! - `registry` — process-wide session catalog
//! - `routes` — REST control-plane route handlers
//! - `transport` — WebSocket and SSE attach protocols
//! - `state` — shared Axum application state
//! - `supervisor` — crash-restart supervisor for `termcast supervise`

pub mod config;
pub mod error;
pub mod pty;
pub mod registry;
pub mod routes;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::SessionError;
pub use registry::Registry;
pub use state::AppState;
