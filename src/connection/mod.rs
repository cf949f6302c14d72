// src/connection/mod.rs

//! Handles a single accepted Unix-domain connection: one request in, zero or
//! more pushed replies out, for as long as the admission server keeps the
//! session's job blocked.

mod handler;

pub use handler::handle_connection;
