//! S3-compatible backend over presigned requests.
//!
//! Works against AWS as well as MinIO/Garage/Ceph/Backblaze-style
//! endpoints. When an explicit `endpoint` is configured, path-style
//! addressing is the default; `path_style` overrides in either
//! direction. Credentials are static config values only: there is no
//! credential chain and no instance-metadata lookup.
//!
//! Object keys: `chunks/<hash>` and `manifests/<snapshot_id>.json`.

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::S3Action;
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SnapkeepError};
use crate::storage::{ensure_active, Backend};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 5_000;

struct S3Client {
    bucket: Bucket,
    credentials: Option<Credentials>,
    agent: ureq::Agent,
}

#[derive(Default)]
pub struct S3Backend {
    client: Option<S3Client>,
}

impl S3Backend {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&S3Client> {
        self.client
            .as_ref()
            .ok_or_else(|| SnapkeepError::BackendInit("s3 backend not initialized".into()))
    }
}

fn chunk_key(hash: &str) -> String {
    format!("chunks/{hash}")
}

fn manifest_key(snapshot_id: &str) -> String {
    format!("manifests/{snapshot_id}.json")
}

fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

impl S3Client {
    /// Retry a request on transient errors with exponential backoff and
    /// jitter.
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        let mut delay_ms = RETRY_DELAY_MS;
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(RETRY_MAX_DELAY_MS);
            }
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "S3 {op_name}: transient error (attempt {}/{}), retrying: {e}",
                        attempt + 1,
                        MAX_RETRIES,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }

    fn get(&self, op: &str, key: &str) -> Result<Vec<u8>> {
        let url = self
            .bucket
            .get_object(self.credentials.as_ref(), key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(op, || self.agent.get(url.as_str()).call()) {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(|e| SnapkeepError::BackendIo(format!("S3 GET {key}: {e}")))?;
                Ok(buf)
            }
            Err(ureq::Error::Status(404, _)) => Err(SnapkeepError::NotFound(key.to_string())),
            Err(e) => Err(SnapkeepError::BackendIo(format!("S3 GET {key}: {e}"))),
        }
    }

    fn put(&self, op: &str, key: &str, data: &[u8]) -> Result<()> {
        let url = self
            .bucket
            .put_object(self.credentials.as_ref(), key)
            .sign(PRESIGN_DURATION);

        self.retry_call(op, || self.agent.put(url.as_str()).send_bytes(data))
            .map_err(|e| SnapkeepError::BackendIo(format!("S3 PUT {key}: {e}")))?;
        Ok(())
    }

    fn delete(&self, op: &str, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(self.credentials.as_ref(), key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(op, || self.agent.delete(url.as_str()).call()) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Err(SnapkeepError::NotFound(key.to_string())),
            Err(e) => Err(SnapkeepError::BackendIo(format!("S3 DELETE {key}: {e}"))),
        }
    }

    fn head(&self, op: &str, key: &str) -> Result<bool> {
        let url = self
            .bucket
            .head_object(self.credentials.as_ref(), key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(op, || self.agent.head(url.as_str()).call()) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(SnapkeepError::BackendIo(format!("S3 HEAD {key}: {e}"))),
        }
    }
}

impl Backend for S3Backend {
    fn init(&mut self, config: &HashMap<String, String>) -> Result<()> {
        let bucket_name = config
            .get("bucket")
            .ok_or_else(|| SnapkeepError::BackendInit("bucket is required in config".into()))?;

        let region = config
            .get("region")
            .map(String::as_str)
            .filter(|r| !r.is_empty())
            .unwrap_or("us-east-1");

        let endpoint = config.get("endpoint").filter(|e| !e.is_empty());
        let endpoint_url = endpoint
            .cloned()
            .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
        let base_url = endpoint_url.parse().map_err(|e| {
            SnapkeepError::BackendInit(format!("invalid S3 endpoint URL '{endpoint_url}': {e}"))
        })?;

        // Custom endpoints default to path-style addressing; an explicit
        // `path_style` key overrides in either direction.
        let url_style = match config.get("path_style").map(String::as_str) {
            Some("true") | Some("1") => UrlStyle::Path,
            Some("false") | Some("0") => UrlStyle::VirtualHost,
            _ if endpoint.is_some() => UrlStyle::Path,
            _ => UrlStyle::VirtualHost,
        };

        let bucket = Bucket::new(
            base_url,
            url_style,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| {
            SnapkeepError::BackendInit(format!("failed to create S3 bucket handle: {e}"))
        })?;

        let access_key = config.get("access_key").filter(|k| !k.is_empty());
        let secret_key = config.get("secret_key").filter(|k| !k.is_empty());
        let credentials = match (access_key, secret_key) {
            (Some(access), Some(secret)) => Some(Credentials::new(access.as_str(), secret.as_str())),
            (None, None) => None,
            _ => {
                return Err(SnapkeepError::BackendInit(
                    "access_key and secret_key must be provided together".into(),
                ))
            }
        };

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        self.client = Some(S3Client {
            bucket,
            credentials,
            agent,
        });
        Ok(())
    }

    fn store_chunk(&self, cancel: &CancellationToken, hash: &str, data: &[u8]) -> Result<()> {
        ensure_active(cancel)?;
        let client = self.client()?;
        let key = chunk_key(hash);

        // Dedup short-circuit before uploading.
        if client.head("HEAD", &key)? {
            return Ok(());
        }
        client.put("PUT", &key, data)
    }

    fn load_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        self.client()?.get("GET", &chunk_key(hash))
    }

    fn delete_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<()> {
        ensure_active(cancel)?;
        self.client()?.delete("DELETE", &chunk_key(hash))
    }

    fn chunk_exists(&self, cancel: &CancellationToken, hash: &str) -> Result<bool> {
        ensure_active(cancel)?;
        self.client()?.head("HEAD", &chunk_key(hash))
    }

    fn store_manifest(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        manifest: &[u8],
    ) -> Result<()> {
        ensure_active(cancel)?;
        self.client()?.put("PUT", &manifest_key(snapshot_id), manifest)
    }

    fn load_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        self.client()?.get("GET", &manifest_key(snapshot_id))
    }

    fn delete_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<()> {
        ensure_active(cancel)?;
        self.client()?.delete("DELETE", &manifest_key(snapshot_id))
    }
}
