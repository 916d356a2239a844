pub mod protocol;
pub mod ws_handler;

// Re-export the WebSocket handler for the binary's router.
pub use ws_handler::ws_handler;
