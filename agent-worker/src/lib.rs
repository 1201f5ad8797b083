//! Daemon runtime: embedded store for sessions and tasks, length-prefixed
//! framed IPC, a worker server that can run an agent loop independently of
//! any front-end, and the client/lifecycle glue that starts, finds, and
//! stops that daemon.

pub mod client;
pub mod ipc;
pub mod lifecycle;
pub mod output_buffer;
pub mod server;
pub mod store;

pub use client::{Client, ClientError};
pub use output_buffer::{ChunkAttrs, ChunkType, OutputBuffer, OutputBufferManager, OutputChunk};
pub use server::{Server, ServerError, ServerState};
pub use store::{Session, SessionStatus, Store, StoreError, Task, TaskStatus};
