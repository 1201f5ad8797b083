//! SSH-bootstrapped remote execution fabric: build a worker on a remote
//! host over SSH, then talk to it over a bearer-token HTTP channel through
//! a small connection pool.

pub mod askpass;
pub mod bootstrap;
pub mod pool;

pub use bootstrap::{AuthMethod, BootstrapConfig, BootstrapError, DaemonInfo, HostDescriptor};
pub use pool::{ConnectionState, ExecResult, RemoteError, RemotePool};
