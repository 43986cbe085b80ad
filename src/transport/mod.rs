//! Websocket transport for the session channel
//!
//! Connects to the job server, owns the socket in a single task and exposes
//! a cloneable client handle.

pub mod client;
pub mod websocket;

pub use client::{TaskClient, TaskResponses};
pub use websocket::{JobSocket, JobSocketOptions, TransportError};
