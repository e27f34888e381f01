// WebSocket transport
pub mod connection;
pub mod routes;
pub mod server;

pub use routes::AppState;
pub use server::{shutdown_signal, RelayServer};
