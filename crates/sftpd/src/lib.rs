//! sftpd server library
//!
//! A minimal SSH server whose only job is serving the `sftp` subsystem.

pub mod auth;
pub mod constants;
pub mod host_key;
pub mod local_fs;
pub mod protocol;
pub mod router;
pub mod ssh;

pub use auth::{Credentials, Verdict};
pub use host_key::{ensure_identity, HostKeyError};
pub use local_fs::LocalFs;
pub use protocol::{ProtocolError, ProtocolHandler, SftpProtocol};
pub use router::{ChannelRequest, Route, RouteState, SubsystemRouter};
pub use ssh::{ServeError, SshServer, SshServerConfig};
