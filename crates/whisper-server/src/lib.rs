pub mod dirs;
pub mod envelope;
pub mod handlers;
pub mod lifecycle;
pub mod link;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: lifecycle::Lifecycle,
}

pub use server::{router, run, ServerConfig};
