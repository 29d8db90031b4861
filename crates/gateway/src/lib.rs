//! Gateway: HTTP server, instance registry, guard pipeline, and the
//! instance/dispatch controllers.
//!
//! Request flow:
//! 1. Resolve the auth context from headers (strategy chosen at startup)
//! 2. Run the guard pipeline (existence → login → auth)
//! 3. Invoke the controller, which reads/mutates the registry
//! 4. Map the result (or typed error) onto an HTTP response
//!
//! The network itself lives behind `switchboard_channels::ChannelTransport`.

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod guards;
pub mod instances;
pub mod registry;
pub mod server;
pub mod state;

pub use {
    error::GatewayError,
    registry::{Instance, InstanceRegistry, InstanceState},
};
