//! Stream service: consumes the commands topic and applies each command to the
//! pet store.

pub mod app;
