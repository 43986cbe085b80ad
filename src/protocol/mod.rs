//! Toyz job socket protocol
//!
//! Wire types for task requests and server frames. Inbound frames are split
//! into control frames and ordinary results at the parse boundary.

pub mod types;

// Re-export commonly used types
pub use types::*;
