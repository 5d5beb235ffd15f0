//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port for the sftp server.
pub const DEFAULT_SSH_PORT: u16 = 2022;

/// Default bind address (all interfaces).
pub const DEFAULT_BIND_ADDRESS: [u8; 4] = [0, 0, 0, 0];

/// Default location of the persisted host identity.
pub const DEFAULT_HOST_KEY_PATH: &str = "/keys/host_ed25519_key";

/// Default static credentials.
pub const DEFAULT_USERNAME: &str = "testuser";
pub const DEFAULT_PASSWORD: &str = "testpass";

/// The only channel type the server accepts.
pub const SESSION_CHANNEL_TYPE: &str = "session";

/// The only subsystem the server serves.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// SSH authentication rejection delay (prevents timing attacks).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// Pause after a failed `accept()` before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on a single SFTP read, regardless of what the client asks for.
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// Most directory entries returned by one SFTP `readdir` reply.
pub const READDIR_BATCH: usize = 100;
