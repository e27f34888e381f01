// Application entry points
pub mod web_server;

pub use web_server::run_relay_server;
