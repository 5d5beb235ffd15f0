//! SSH server for sftpd
//!
//! Accepts SSH connections, authenticates them against the static
//! credentials, accepts `session` channels and hands channels that ask for
//! the `sftp` subsystem to the protocol handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::auth::{Credentials, Verdict};
use crate::constants::{
    ACCEPT_ERROR_BACKOFF, SESSION_CHANNEL_TYPE, SFTP_SUBSYSTEM, SSH_AUTH_REJECTION_DELAY,
};
use crate::host_key::{self, HostKeyError};
use crate::protocol::ProtocolHandler;
use crate::router::{ChannelRequest, Route, SubsystemRouter};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// SSH server configuration. Built once at startup, read-only afterwards.
#[derive(Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
    pub credentials: Credentials,
}

impl SshServerConfig {
    pub fn new(bind_addr: SocketAddr, host_key: PrivateKey, credentials: Credentials) -> Self {
        Self {
            bind_addr,
            host_key,
            credentials,
        }
    }

    /// Create config on localhost with an ephemeral key (for testing)
    pub fn ephemeral(port: u16, credentials: Credentials) -> Result<Self, HostKeyError> {
        Ok(Self::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            host_key::ephemeral()?,
            credentials,
        ))
    }

    fn russh_config(&self) -> server::Config {
        server::Config {
            auth_rejection_time: SSH_AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            keys: vec![self.host_key.clone()],
            ..Default::default()
        }
    }
}

/// SSH server
pub struct SshServer<P> {
    config: Arc<SshServerConfig>,
    russh_config: Arc<server::Config>,
    protocol: Arc<P>,
}

impl<P: ProtocolHandler> SshServer<P> {
    pub fn new(config: SshServerConfig, protocol: P) -> Self {
        let russh_config = Arc::new(config.russh_config());
        Self {
            config: Arc::new(config),
            russh_config,
            protocol: Arc::new(protocol),
        }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, ServeError> {
        let addr = self.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServeError::Bind { addr, source })
    }

    /// Run the SSH server. Only returns if the listen address can't be bound.
    pub async fn run(&self) -> Result<(), ServeError> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on `listener` forever, one task per connection.
    pub async fn serve(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => log::info!("SFTP server listening on {}", addr),
            Err(_) => log::info!("SFTP server listening on {}", self.config.bind_addr),
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let handler = ConnectionHandler::new(
                peer,
                Arc::clone(&self.config),
                Arc::clone(&self.protocol),
            );
            let russh_config = Arc::clone(&self.russh_config);
            tokio::spawn(handle_connection(russh_config, stream, peer, handler));
        }
    }
}

/// Drive one connection from handshake to disconnect.
async fn handle_connection<P: ProtocolHandler>(
    russh_config: Arc<server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: ConnectionHandler<P>,
) {
    log::info!("New connection from {}", peer);

    let session = match server::run_stream(russh_config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            log::warn!("Failed to handshake with {}: {}", peer, e);
            return;
        }
    };

    match session.await {
        Ok(()) => log::info!("Connection from {} closed", peer),
        Err(e) => log::warn!("Connection from {} ended with error: {}", peer, e),
    }
}

/// Handler for a single SSH connection
struct ConnectionHandler<P> {
    peer: SocketAddr,
    config: Arc<SshServerConfig>,
    protocol: Arc<P>,
    username: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

/// Router for one session channel, plus the trigger that releases the
/// channel's task into the protocol handler.
struct ChannelState {
    router: SubsystemRouter,
    handoff: Option<oneshot::Sender<()>>,
}

impl ChannelState {
    fn new(handoff: oneshot::Sender<()>) -> Self {
        Self {
            router: SubsystemRouter::new(),
            handoff: Some(handoff),
        }
    }
}

/// Owns one session channel for its whole life.
///
/// Until the handoff fires, every message russh queues on the channel is
/// read and dropped: the handler callbacks already answer requests, and an
/// undrained channel would back up into the connection's session loop and
/// stall its sibling channels. After the handoff the channel's stream goes to
/// the protocol handler, and the channel is closed once the handler returns.
async fn drive_channel<P: ProtocolHandler>(
    mut channel: Channel<Msg>,
    mut handoff: oneshot::Receiver<()>,
    protocol: Arc<P>,
    handle: server::Handle,
    user: String,
    peer: SocketAddr,
) {
    let id = channel.id();
    loop {
        tokio::select! {
            biased;
            fired = &mut handoff => {
                if fired.is_err() {
                    // Channel closed before any handoff.
                    return;
                }
                break;
            }
            msg = channel.wait() => {
                if msg.is_none() {
                    return;
                }
                log::trace!("Discarding message on channel {} before handoff", id);
            }
        }
    }

    log::info!(
        "Starting {} subsystem on channel {} for {}@{}",
        SFTP_SUBSYSTEM,
        id,
        user,
        peer
    );
    match protocol.serve(channel.into_stream()).await {
        Ok(()) => log::info!("{} session on channel {} ended", SFTP_SUBSYSTEM, id),
        Err(e) => log::error!("{} session on channel {} failed: {}", SFTP_SUBSYSTEM, id, e),
    }
    if handle.close(id).await.is_err() {
        log::debug!("Channel {} was already gone", id);
    }
}

impl<P: ProtocolHandler> ConnectionHandler<P> {
    fn new(peer: SocketAddr, config: Arc<SshServerConfig>, protocol: Arc<P>) -> Self {
        Self {
            peer,
            config,
            protocol,
            username: None,
            channels: HashMap::new(),
        }
    }

    /// Answer one channel request. Exactly one of `channel_success` /
    /// `channel_failure` is sent per call.
    fn route(
        &mut self,
        id: ChannelId,
        request: ChannelRequest<'_>,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let Some(state) = self.channels.get_mut(&id) else {
            log::warn!("{} on unknown channel {} from {}", request, id, self.peer);
            return session.channel_failure(id);
        };

        match state.router.route(request) {
            Route::Reject(reason) => {
                log::info!("Rejected {} on channel {}: {}", request, id, reason);
                session.channel_failure(id)
            }
            Route::Dispatch => {
                // The trigger fires before the success reply goes out, so the
                // channel's task stops draining before any client data can
                // follow the reply.
                let released = state
                    .handoff
                    .take()
                    .is_some_and(|handoff| handoff.send(()).is_ok());
                if !released {
                    log::warn!("Channel {} went away before handoff", id);
                    return session.channel_failure(id);
                }
                session.channel_success(id)
            }
        }
    }
}

impl<P: ProtocolHandler> server::Handler for ConnectionHandler<P> {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.config.credentials.validate(user, password, Some(self.peer)) {
            Verdict::Accept => {
                self.username = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Verdict::Reject => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        log::info!("Accepted {} channel {} from {}", SESSION_CHANNEL_TYPE, id, self.peer);

        let (handoff, released) = oneshot::channel();
        self.channels.insert(id, ChannelState::new(handoff));
        tokio::spawn(drive_channel(
            channel,
            released,
            Arc::clone(&self.protocol),
            session.handle(),
            self.username.clone().unwrap_or_default(),
            self.peer,
        ));
        Ok(true)
    }

    // russh refuses a declined open with "administratively prohibited";
    // only types it cannot parse get "unknown channel type".
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        log::info!(
            "Rejected direct-tcpip channel {} to {}:{} from {}",
            channel.id(),
            host_to_connect,
            port_to_connect,
            self.peer
        );
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        log::info!("Rejected x11 channel {} from {}", channel.id(), self.peer);
        Ok(false)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelRequest::Subsystem(name), session)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelRequest::Other("pty-req"), session)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelRequest::Other("x11-req"), session)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelRequest::Other("env"), session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelRequest::Other("shell"), session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, ChannelRequest::Other("exec"), session)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // A dispatched channel is closed by its protocol task instead.
        let waiting = self
            .channels
            .get(&channel)
            .is_some_and(|state| !state.router.is_dispatched());
        if waiting {
            log::debug!("Client sent EOF on channel {}, closing", channel);
            session.close(channel)?;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        log::debug!("Channel {} closed", channel);
        self.channels.remove(&channel);
        Ok(())
    }
}
