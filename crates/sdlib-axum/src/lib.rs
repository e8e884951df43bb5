//! Axum web adapter for sdlib.
//!
//! Exposes the job, model, image, and download APIs plus the WebSocket
//! event stream. `bootstrap` is the composition root where every
//! concrete component is wired together.

pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod ws;

pub use bootstrap::{bootstrap, serve, AxumContext, ServerConfig};
pub use error::HttpError;
pub use routes::create_router;
pub use state::AppState;
