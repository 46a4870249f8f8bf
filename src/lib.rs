//! Local control plane for a running code editor.
//!
//! Exposes the editor's command surface over HTTP and WebSocket on the
//! loopback interface, tracks the instance identity and developer tools
//! state, and provides a reconnecting client for the WebSocket side.

pub mod api;
pub mod client;
pub mod config;
pub mod correlation;
pub mod devtools;
pub mod dispatch;
pub mod host;
pub mod instance;
pub mod protocol;
pub mod server;
pub mod shutdown;
