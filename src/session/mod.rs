//! Session channel module
//!
//! Correlates many logical requests over one job socket: session identity,
//! request id allocation, the pending request table, the pre-session send
//! queue and inbound frame dispatch.

pub mod channel;
pub mod handlers;
pub mod id_allocator;
pub mod request_table;

pub use channel::{ChannelError, ChannelOptions, ChannelState, SendOutcome, Session, SessionChannel};
pub use handlers::{
    ChannelHandlers, ControlHandler, RequestHandlers, ResponseHandler, StreamHandler, TaskEvent,
};
pub use id_allocator::{MAX_REQUEST_ID, RequestIdAllocator};
