//! SFTP backend using `russh` + `russh-sftp`.
//!
//! The backend owns one long-lived SSH connection established during
//! `init` and released by `close`. The async SSH stack is bridged into
//! the synchronous `Backend` trait through the shared storage runtime.
//! The remote directory layout mirrors the local backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::ssh_key;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SnapkeepError};
use crate::storage::runtime::ASYNC_RUNTIME;
use crate::storage::{ensure_active, validate_hash, Backend};

/// Connection timeout for the SSH handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity timeout for the established SSH session.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// SSH client handler.
///
/// TODO: verify the server key against a known-hosts file instead of
/// accepting any host key.
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Clone)]
struct SftpConnectParams {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key_path: Option<String>,
    root: String,
}

struct SftpConn {
    sftp: SftpSession,
    root: String,
    session: client::Handle<AcceptAnyHostKey>,
}

impl SftpConn {
    fn chunk_path(&self, hash: &str) -> Result<String> {
        validate_hash(hash)?;
        Ok(format!(
            "{}/chunks/{}/{}/{hash}",
            self.root,
            &hash[..2],
            &hash[2..4]
        ))
    }

    fn manifest_path(&self, snapshot_id: &str) -> String {
        format!("{}/manifests/{snapshot_id}.json", self.root)
    }
}

#[derive(Default)]
pub struct SftpBackend {
    conn: Option<SftpConn>,
}

impl SftpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self) -> Result<&SftpConn> {
        self.conn
            .as_ref()
            .ok_or_else(|| SnapkeepError::BackendInit("sftp backend not initialized".into()))
    }
}

fn required<'a>(config: &'a HashMap<String, String>, key: &str) -> Result<&'a String> {
    config
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SnapkeepError::BackendInit(format!("{key} is required in config")))
}

fn parse_params(config: &HashMap<String, String>) -> Result<SftpConnectParams> {
    let host = required(config, "host")?.clone();
    let user = required(config, "user")?.clone();

    // Remote root is kept absolute without a trailing slash; "/" becomes
    // the empty string ahead of joining.
    let trimmed = required(config, "path")?.trim_matches('/');
    let root = if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    };

    let port = match config.get("port").filter(|p| !p.is_empty()) {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            SnapkeepError::BackendInit(format!("invalid port '{raw}' in config"))
        })?,
        None => 22,
    };

    let password = config.get("password").filter(|p| !p.is_empty()).cloned();
    let key_path = config.get("key_path").filter(|p| !p.is_empty()).cloned();
    if password.is_none() && key_path.is_none() {
        return Err(SnapkeepError::BackendInit(
            "no authentication method provided (password or key_path required)".into(),
        ));
    }

    Ok(SftpConnectParams {
        host,
        port,
        user,
        password,
        key_path,
        root,
    })
}

fn sftp_err(op: &str, path: &str, e: russh_sftp::client::error::Error) -> SnapkeepError {
    SnapkeepError::BackendIo(format!("SFTP {op} '{path}': {e}"))
}

fn io_err(op: &str, path: &str, e: std::io::Error) -> SnapkeepError {
    SnapkeepError::BackendIo(format!("SFTP {op} '{path}': {e}"))
}

/// True when an SFTP error indicates "no such file".
fn is_not_found(e: &russh_sftp::client::error::Error) -> bool {
    matches!(
        e,
        russh_sftp::client::error::Error::Status(s)
            if s.status_code == StatusCode::NoSuchFile
    )
}

/// Create every directory level of `path`, tolerating levels that already
/// exist.
async fn mkdir_p(sftp: &SftpSession, path: &str) -> Result<()> {
    let mut current = String::new();
    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        current = format!("{current}/{component}");
        match sftp.create_dir(&current).await {
            Ok(()) => {}
            Err(e) => match &e {
                russh_sftp::client::error::Error::Status(s)
                    if s.status_code == StatusCode::Failure =>
                {
                    // Likely already exists; verify with metadata.
                    if sftp.metadata(&current).await.is_err() {
                        return Err(sftp_err("mkdir", &current, e));
                    }
                }
                _ => return Err(sftp_err("mkdir", &current, e)),
            },
        }
    }
    Ok(())
}

/// Establish the SSH session, authenticate, and open the SFTP subsystem.
async fn connect(params: &SftpConnectParams) -> Result<SftpConn> {
    let config = Arc::new(client::Config {
        inactivity_timeout: Some(INACTIVITY_TIMEOUT),
        ..Default::default()
    });

    let addr = (params.host.as_str(), params.port);
    let mut session = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(config, addr, AcceptAnyHostKey),
    )
    .await
    .map_err(|_| {
        SnapkeepError::BackendInit(format!(
            "SSH connect to {}:{} timed out after {}s",
            params.host,
            params.port,
            CONNECT_TIMEOUT.as_secs()
        ))
    })?
    .map_err(|e| {
        SnapkeepError::BackendInit(format!(
            "failed to connect to SSH server {}:{}: {e}",
            params.host, params.port
        ))
    })?;

    let auth_ok = if let Some(password) = &params.password {
        session
            .authenticate_password(params.user.as_str(), password.as_str())
            .await
            .map_err(|e| SnapkeepError::BackendInit(format!("SSH password auth: {e}")))?
    } else {
        let key_path = params.key_path.as_deref().unwrap_or_default();
        let key = load_secret_key(key_path, None).map_err(|e| {
            SnapkeepError::BackendInit(format!("failed to load SSH key {key_path}: {e}"))
        })?;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| {
                SnapkeepError::BackendInit(format!("SSH hash negotiation: {e}"))
            })?
            .flatten();
        session
            .authenticate_publickey(
                params.user.as_str(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| SnapkeepError::BackendInit(format!("SSH public-key auth: {e}")))?
    };

    if !auth_ok.success() {
        return Err(SnapkeepError::BackendInit(format!(
            "SSH authentication failed for user '{}' on {}:{}",
            params.user, params.host, params.port
        )));
    }

    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| SnapkeepError::BackendInit(format!("SSH open channel: {e}")))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| SnapkeepError::BackendInit(format!("SSH request sftp subsystem: {e}")))?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| SnapkeepError::BackendInit(format!("SFTP session init: {e}")))?;

    Ok(SftpConn {
        sftp,
        root: params.root.clone(),
        session,
    })
}

impl Backend for SftpBackend {
    fn init(&mut self, config: &HashMap<String, String>) -> Result<()> {
        let params = parse_params(config)?;

        let conn = ASYNC_RUNTIME.block_on(async {
            let conn = connect(&params).await?;
            for dir in ["chunks", "manifests"] {
                mkdir_p(&conn.sftp, &format!("{}/{dir}", conn.root))
                    .await
                    .map_err(|e| {
                        SnapkeepError::BackendInit(format!(
                            "failed to create {dir} directory: {e}"
                        ))
                    })?;
            }
            Ok::<_, SnapkeepError>(conn)
        })?;

        self.conn = Some(conn);
        Ok(())
    }

    fn store_chunk(&self, cancel: &CancellationToken, hash: &str, data: &[u8]) -> Result<()> {
        ensure_active(cancel)?;
        let conn = self.conn()?;
        let path = conn.chunk_path(hash)?;

        ASYNC_RUNTIME.block_on(async {
            // Dedup short-circuit before uploading.
            match conn.sftp.metadata(&path).await {
                Ok(_) => return Ok(()),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(sftp_err("stat", &path, e)),
            }

            if let Some((parent, _)) = path.rsplit_once('/') {
                mkdir_p(&conn.sftp, parent).await?;
            }

            let mut file = conn
                .sftp
                .open_with_flags(&path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
                .await
                .map_err(|e| sftp_err("create", &path, e))?;
            file.write_all(data)
                .await
                .map_err(|e| io_err("write", &path, e))?;
            file.flush().await.map_err(|e| io_err("flush", &path, e))?;
            file.shutdown()
                .await
                .map_err(|e| io_err("close", &path, e))?;
            Ok(())
        })
    }

    fn load_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        let conn = self.conn()?;
        let path = conn.chunk_path(hash)?;

        ASYNC_RUNTIME.block_on(async {
            let mut file = match conn.sftp.open(&path).await {
                Ok(f) => f,
                Err(e) if is_not_found(&e) => {
                    return Err(SnapkeepError::NotFound(format!("chunk {hash}")))
                }
                Err(e) => return Err(sftp_err("open", &path, e)),
            };
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| io_err("read", &path, e))?;
            Ok(buf)
        })
    }

    fn delete_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<()> {
        ensure_active(cancel)?;
        let conn = self.conn()?;
        let path = conn.chunk_path(hash)?;

        ASYNC_RUNTIME.block_on(async {
            match conn.sftp.remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if is_not_found(&e) => {
                    Err(SnapkeepError::NotFound(format!("chunk {hash}")))
                }
                Err(e) => Err(sftp_err("delete", &path, e)),
            }
        })
    }

    fn chunk_exists(&self, cancel: &CancellationToken, hash: &str) -> Result<bool> {
        ensure_active(cancel)?;
        let conn = self.conn()?;
        let path = conn.chunk_path(hash)?;

        ASYNC_RUNTIME.block_on(async {
            match conn.sftp.metadata(&path).await {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(sftp_err("stat", &path, e)),
            }
        })
    }

    fn store_manifest(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        manifest: &[u8],
    ) -> Result<()> {
        ensure_active(cancel)?;
        let conn = self.conn()?;
        let path = conn.manifest_path(snapshot_id);

        ASYNC_RUNTIME.block_on(async {
            let mut file = conn
                .sftp
                .open_with_flags(&path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
                .await
                .map_err(|e| sftp_err("create", &path, e))?;
            file.write_all(manifest)
                .await
                .map_err(|e| io_err("write", &path, e))?;
            file.flush().await.map_err(|e| io_err("flush", &path, e))?;
            file.shutdown()
                .await
                .map_err(|e| io_err("close", &path, e))?;
            Ok(())
        })
    }

    fn load_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        let conn = self.conn()?;
        let path = conn.manifest_path(snapshot_id);

        ASYNC_RUNTIME.block_on(async {
            let mut file = match conn.sftp.open(&path).await {
                Ok(f) => f,
                Err(e) if is_not_found(&e) => {
                    return Err(SnapkeepError::NotFound(format!("manifest {snapshot_id}")))
                }
                Err(e) => return Err(sftp_err("open", &path, e)),
            };
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| io_err("read", &path, e))?;
            Ok(buf)
        })
    }

    fn delete_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<()> {
        ensure_active(cancel)?;
        let conn = self.conn()?;
        let path = conn.manifest_path(snapshot_id);

        ASYNC_RUNTIME.block_on(async {
            match conn.sftp.remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if is_not_found(&e) => {
                    Err(SnapkeepError::NotFound(format!("manifest {snapshot_id}")))
                }
                Err(e) => Err(sftp_err("delete", &path, e)),
            }
        })
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let result = ASYNC_RUNTIME.block_on(conn.session.disconnect(
                Disconnect::ByApplication,
                "closing",
                "en",
            ));
            if let Err(e) = result {
                tracing::debug!(error = %e, "SSH disconnect during close");
            }
        }
    }
}
