//! Length-prefixed framed IPC: wire framing plus the request/response
//! envelope exchanged over it.

pub mod framing;
pub mod protocol;

pub use framing::{read_frame, write_frame, FramingError};
pub use protocol::{Request, Response};
