//! REST API and WebSocket handlers for the Control RPC and Management RPC
//! surfaces.

pub mod auth;
pub mod control_handlers;
pub mod management_handlers;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use routes::{control_router, management_router};
