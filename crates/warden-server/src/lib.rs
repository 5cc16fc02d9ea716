pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod script;
pub mod state;

pub use config::{ConfigError, ServerConfig};
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
