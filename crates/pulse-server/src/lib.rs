pub mod broadcast;
pub mod longpoll;
pub mod registry;
pub mod server;
pub mod sse;
pub mod websocket;

pub use server::{start, AppState, ServerConfig, ServerHandle};
