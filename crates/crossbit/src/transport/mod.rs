//! Transport layer for the worker's control channel.

pub mod http;
