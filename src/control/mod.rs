//! HTTP control API for the listener

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{AppState, ControlServer};
