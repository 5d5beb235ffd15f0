//! Per-channel request routing.
//!
//! Each accepted session channel owns a [`SubsystemRouter`]. The router sees
//! every request on its channel and decides, one request at a time, whether
//! to reject it or hand the channel to the sftp handler:
//!
//! ```text
//! AwaitRequest ──(subsystem "sftp")──► Dispatched
//!      ▲    │
//!      └────┘ anything else: reject
//! ```
//!
//! `Dispatched` is terminal. A dispatched channel belongs to the protocol
//! handler, so any request that still arrives on it is rejected.

use std::fmt;

use crate::constants::SFTP_SUBSYSTEM;

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    AwaitRequest,
    Dispatched,
}

/// A channel request as the router sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRequest<'a> {
    /// `subsystem` request with its decoded name.
    Subsystem(&'a str),
    /// Any other request type (`shell`, `exec`, `pty-req`, ...).
    Other(&'a str),
}

impl fmt::Display for ChannelRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRequest::Subsystem(name) => write!(f, "subsystem {:?}", name),
            ChannelRequest::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// The router's answer to one request. The caller turns this into exactly
/// one reply on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Reply with failure; the channel keeps waiting for requests.
    Reject(RejectReason),
    /// Reply with success and hand the channel to the protocol handler.
    Dispatch,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("unsupported request type {0:?}")]
    UnsupportedRequest(String),
    #[error("unknown subsystem {0:?}")]
    UnknownSubsystem(String),
    #[error("channel already handed to the protocol handler")]
    AlreadyDispatched,
}

/// Request state machine for one channel.
#[derive(Debug)]
pub struct SubsystemRouter {
    state: RouteState,
}

impl Default for SubsystemRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubsystemRouter {
    pub fn new() -> Self {
        Self {
            state: RouteState::AwaitRequest,
        }
    }

    pub fn state(&self) -> RouteState {
        self.state
    }

    pub fn is_dispatched(&self) -> bool {
        self.state == RouteState::Dispatched
    }

    /// Route one request. The transport has already decoded its payload.
    pub fn route(&mut self, request: ChannelRequest<'_>) -> Route {
        if self.is_dispatched() {
            return Route::Reject(RejectReason::AlreadyDispatched);
        }

        match request {
            ChannelRequest::Subsystem(SFTP_SUBSYSTEM) => {
                self.state = RouteState::Dispatched;
                Route::Dispatch
            }
            ChannelRequest::Subsystem(name) => {
                Route::Reject(RejectReason::UnknownSubsystem(name.to_string()))
            }
            ChannelRequest::Other(kind) => {
                Route::Reject(RejectReason::UnsupportedRequest(kind.to_string()))
            }
        }
    }
}
