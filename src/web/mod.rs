//! Browser surface: the web server, SSE fan-out, and the in-process web
//! channel that bridges HTTP to the message pipeline.

pub mod channel;
pub mod server;
pub mod sse;

pub use channel::WebChannel;
pub use server::{serve, AppState};
pub use sse::SseManager;
