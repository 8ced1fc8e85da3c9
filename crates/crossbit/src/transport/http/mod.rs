//! HTTP control channel served by the worker.

mod routes;
mod server;

pub use routes::routes;
pub use server::{ServerConfig, bind, serve};
