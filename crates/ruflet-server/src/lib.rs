//! WebSocket session server for Ruflet.
//!
//! Accepts raw TCP connections, performs the WebSocket handshake itself,
//! and runs one worker per connection that decodes protocol messages and
//! drives that connection's [`ruflet_core::Page`].

pub mod connection;
pub mod events;
pub mod frame;
pub mod server;
pub mod state;

pub use events::broadcast;
pub use server::{Server, bind_with_retry, run};
pub use state::{App, ServerState, make_app};
