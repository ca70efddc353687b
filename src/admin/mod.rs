//! Operator surface: chat commands and read-only status routes.

pub mod command;
pub mod routes;
pub mod service;

pub use command::AdminCommand;
pub use routes::{StatusRouteState, status_routes};
pub use service::AdminService;
