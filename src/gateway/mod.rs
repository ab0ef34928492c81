//! Gateway server: listener lifecycle, route table ownership and the
//! configure/start/stop operations.

pub mod server;

pub use server::Gateway;
