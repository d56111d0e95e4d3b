//! Routing fabric: manager-addressed requests onto individual minion
//! sessions.
//!
//! The manager talks to the broker over its own multiplexed session; the
//! routes mounted here let it name a minion by session id and have the
//! traffic hop onto that minion's session instead of any real network dial.

pub mod fabric;
pub mod routes;

pub use fabric::{RouteError, RoutingFabric};
pub use routes::routes;
