// HTTP surface consumed by the dashboard

pub mod api;
pub mod error;
pub mod server;
