pub mod bindings;
pub mod client;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod server;
pub mod shutdown;

pub use config::ServerConfig;
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
