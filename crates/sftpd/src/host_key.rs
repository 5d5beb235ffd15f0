//! Host identity persistence.
//!
//! The server presents one Ed25519 key for its whole lifetime. The key lives
//! in a single unencrypted PKCS#8 PEM file: the first run generates it, every
//! later run loads it unchanged. Failing to produce a key is fatal.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use russh::keys::{Algorithm, HashAlg, PrivateKey};

/// Errors from loading or creating the host key.
#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("failed to read host key {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse host key {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("failed to generate host key: {0}")]
    Generate(#[source] russh::keys::ssh_key::Error),

    #[error("failed to encode host key: {0}")]
    Encode(#[source] russh::keys::Error),

    #[error("failed to write host key {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Load the host key at `path`, generating and saving a fresh one if the
/// file does not exist.
///
/// An existing file is never rewritten: a file that cannot be parsed is an
/// error rather than a reason to generate a replacement.
pub fn ensure_identity(path: &Path) -> Result<PrivateKey, HostKeyError> {
    match fs::read_to_string(path) {
        Ok(pem) => {
            log::info!("Loading existing host key from {}", path.display());
            let key = parse(path, &pem)?;
            log_fingerprint(&key);
            Ok(key)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("Generating new ED25519 host key at {}", path.display());
            generate_and_save(path)
        }
        Err(source) => Err(HostKeyError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Generate a random Ed25519 key (for tests and throwaway servers).
pub fn ephemeral() -> Result<PrivateKey, HostKeyError> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).map_err(HostKeyError::Generate)
}

fn generate_and_save(path: &Path) -> Result<PrivateKey, HostKeyError> {
    let key = ephemeral()?;

    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(&key, &mut pem).map_err(HostKeyError::Encode)?;

    write_private(path, &pem).map_err(|source| HostKeyError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Host key saved to {}", path.display());

    // Hand back what is on disk, so a later load yields the same key.
    let pem = String::from_utf8_lossy(&pem);
    let key = parse(path, &pem)?;
    log_fingerprint(&key);
    Ok(key)
}

fn parse(path: &Path, pem: &str) -> Result<PrivateKey, HostKeyError> {
    russh::keys::decode_secret_key(pem, None).map_err(|source| HostKeyError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `contents` readable and writable by the owner only.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            create_private_dir(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

fn log_fingerprint(key: &PrivateKey) {
    log::info!(
        "Host key fingerprint: {}",
        key.public_key().fingerprint(HashAlg::Sha256)
    );
}
