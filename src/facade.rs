//! Unified storage facade
//!
//! The single entry point callers use: resolve the virtual path to a mount,
//! check out a pooled connection, run the operation, and absorb the two
//! failure modes worth retrying. An `Unauthorized` answer triggers one
//! credential refresh and one retry on a fresh connection; `Unavailable`
//! answers are retried with exponential backoff until the mount's retry
//! budget is spent, then surface as `BackendUnreachable` naming the mount.
//!
//! Everything else surfaces unchanged, and the connection that produced a
//! clean domain error (not found, already exists, ...) goes back to the
//! pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{create_driver, DirEntry, Handle, Metadata};
use crate::config::{
    BackendOptions, Config, CredentialConfig, MountConfig, MountId, ResolvedMount,
};
use crate::credentials::oauth::{HttpTokenExchanger, HttpTokenExchangerConfig};
use crate::credentials::{CredentialStore, TokenExchanger};
use crate::error::{Result, StorageError};
use crate::pool::MountPool;
use crate::resolver::{Caller, MountTable, Resolution};

/// One operation against a backend, ready to run on any connection of the
/// resolved mount. The path it carries is the backend path: mount-relative
/// with the remote subfolder already applied.
enum FsOp<'a> {
    Stat { path: String },
    Open { path: String },
    Exists { path: String },
    Read { path: String, offset: u64, size: u32 },
    Write { path: String, data: &'a [u8] },
    List { path: String },
    Delete { path: String },
    Mkdir { path: String },
}

impl FsOp<'_> {
    fn name(&self) -> &'static str {
        match self {
            FsOp::Stat { .. } => "stat",
            FsOp::Open { .. } => "open",
            FsOp::Exists { .. } => "exists",
            FsOp::Read { .. } => "read",
            FsOp::Write { .. } => "write",
            FsOp::List { .. } => "list",
            FsOp::Delete { .. } => "delete",
            FsOp::Mkdir { .. } => "mkdir",
        }
    }

    fn mutates(&self) -> bool {
        matches!(
            self,
            FsOp::Write { .. } | FsOp::Delete { .. } | FsOp::Mkdir { .. }
        )
    }

    async fn execute(&self, handle: &mut dyn Handle) -> Result<FsReply> {
        Ok(match self {
            FsOp::Stat { path } => FsReply::Metadata(handle.stat(path).await?),
            FsOp::Open { path } => FsReply::Metadata(handle.open(path).await?),
            FsOp::Exists { path } => FsReply::Exists(handle.exists(path).await?),
            FsOp::Read { path, offset, size } => {
                FsReply::Data(handle.read(path, *offset, *size).await?)
            }
            FsOp::Write { path, data } => FsReply::Written(handle.write(path, data).await?),
            FsOp::List { path } => FsReply::Entries(handle.list(path).await?),
            FsOp::Delete { path } => {
                handle.delete(path).await?;
                FsReply::Unit
            }
            FsOp::Mkdir { path } => {
                handle.mkdir(path).await?;
                FsReply::Unit
            }
        })
    }
}

enum FsReply {
    Metadata(Metadata),
    Data(Bytes),
    Written(u64),
    Entries(Vec<DirEntry>),
    Exists(bool),
    Unit,
}

struct MountState {
    config: Arc<MountConfig>,
    pool: MountPool,
    /// Registration order, preserved when the mount table is rebuilt
    seq: u64,
}

/// The pluggable external-storage layer.
pub struct ExternalStorage {
    table: RwLock<Arc<MountTable>>,
    mounts: DashMap<MountId, Arc<MountState>>,
    credentials: Arc<CredentialStore>,
    next_seq: AtomicU64,
}

impl Default for ExternalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalStorage {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(MountTable::default())),
            mounts: DashMap::new(),
            credentials: Arc::new(CredentialStore::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Build the storage layer from a resolved configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let storage = Self::new();
        for mount in config.mounts {
            storage.register_mount(mount)?;
        }
        info!(mounts = storage.mount_count(), "storage layer ready");
        Ok(storage)
    }

    /// Register one mount: stash its credentials, build its driver, give it
    /// a pool, and publish a new mount table.
    pub fn register_mount(&self, resolved: ResolvedMount) -> Result<()> {
        let config = Arc::new(resolved.config);
        config.backend.validate()?;

        if let Some(cred) = &resolved.credentials {
            let exchanger = build_exchanger(cred, &config.backend);
            self.credentials
                .insert_from_config(config.mount_id.clone(), cred, exchanger);
        }

        let driver = create_driver(&config, Arc::clone(&self.credentials))?;
        let pool = MountPool::new(config.mount_id.clone(), driver, config.limits.clone());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        debug!(
            mount = %config.mount_id,
            backend = %config.backend_type(),
            mount_point = %config.mount_point,
            "registered mount"
        );
        self.mounts.insert(
            config.mount_id.clone(),
            Arc::new(MountState { config, pool, seq }),
        );
        self.rebuild_table();
        Ok(())
    }

    /// Register a mount backed by an already-built driver. Used where the
    /// driver cannot be derived from configuration alone, such as harnesses
    /// injecting failures.
    pub fn register_mount_with_driver(
        &self,
        config: MountConfig,
        driver: Arc<dyn crate::backend::Driver>,
    ) {
        let config = Arc::new(config);
        let pool = MountPool::new(config.mount_id.clone(), driver, config.limits.clone());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.mounts.insert(
            config.mount_id.clone(),
            Arc::new(MountState { config, pool, seq }),
        );
        self.rebuild_table();
    }

    /// Remove a mount; its credentials and parked connections go with it.
    pub fn remove_mount(&self, mount_id: &MountId) {
        if self.mounts.remove(mount_id).is_some() {
            self.credentials.remove(mount_id);
            self.rebuild_table();
            debug!(mount = %mount_id, "removed mount");
        }
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Mounts visible to a caller, in configuration order.
    pub fn visible_mounts(&self, caller: &Caller) -> Vec<Arc<MountConfig>> {
        self.table.read().visible(caller)
    }

    fn rebuild_table(&self) {
        let mut states: Vec<Arc<MountState>> =
            self.mounts.iter().map(|e| Arc::clone(e.value())).collect();
        states.sort_by_key(|s| s.seq);
        let table = MountTable::new(states.iter().map(|s| Arc::clone(&s.config)));
        *self.table.write() = Arc::new(table);
    }

    fn resolve(&self, caller: &Caller, path: &str) -> Result<(Resolution, Arc<MountState>)> {
        let table = Arc::clone(&self.table.read());
        let resolution = table.resolve(caller, path)?;
        let state = self
            .mounts
            .get(&resolution.mount.mount_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StorageError::NoSuchMount(path.to_string()))?;
        Ok((resolution, state))
    }

    // -- public operations ---------------------------------------------------

    pub async fn stat(&self, caller: &Caller, path: &str) -> Result<Metadata> {
        match self.run(caller, path, |p| FsOp::Stat { path: p }).await? {
            FsReply::Metadata(m) => Ok(m),
            _ => Err(StorageError::ProtocolError("mismatched reply".into())),
        }
    }

    /// Probe a path for reading; directories are rejected.
    pub async fn open(&self, caller: &Caller, path: &str) -> Result<Metadata> {
        match self.run(caller, path, |p| FsOp::Open { path: p }).await? {
            FsReply::Metadata(m) => Ok(m),
            _ => Err(StorageError::ProtocolError("mismatched reply".into())),
        }
    }

    pub async fn exists(&self, caller: &Caller, path: &str) -> Result<bool> {
        match self.run(caller, path, |p| FsOp::Exists { path: p }).await? {
            FsReply::Exists(e) => Ok(e),
            _ => Err(StorageError::ProtocolError("mismatched reply".into())),
        }
    }

    pub async fn read(
        &self,
        caller: &Caller,
        path: &str,
        offset: u64,
        size: u32,
    ) -> Result<Bytes> {
        let reply = self
            .run(caller, path, |p| FsOp::Read {
                path: p,
                offset,
                size,
            })
            .await?;
        match reply {
            FsReply::Data(b) => Ok(b),
            _ => Err(StorageError::ProtocolError("mismatched reply".into())),
        }
    }

    pub async fn write(&self, caller: &Caller, path: &str, data: &[u8]) -> Result<u64> {
        let reply = self
            .run(caller, path, |p| FsOp::Write { path: p, data })
            .await?;
        match reply {
            FsReply::Written(n) => Ok(n),
            _ => Err(StorageError::ProtocolError("mismatched reply".into())),
        }
    }

    pub async fn list(&self, caller: &Caller, path: &str) -> Result<Vec<DirEntry>> {
        match self.run(caller, path, |p| FsOp::List { path: p }).await? {
            FsReply::Entries(e) => Ok(e),
            _ => Err(StorageError::ProtocolError("mismatched reply".into())),
        }
    }

    pub async fn delete(&self, caller: &Caller, path: &str) -> Result<()> {
        self.run(caller, path, |p| FsOp::Delete { path: p }).await?;
        Ok(())
    }

    pub async fn mkdir(&self, caller: &Caller, path: &str) -> Result<()> {
        self.run(caller, path, |p| FsOp::Mkdir { path: p }).await?;
        Ok(())
    }

    // -- retry pipeline ------------------------------------------------------

    async fn run<'a, F>(&self, caller: &Caller, path: &str, make_op: F) -> Result<FsReply>
    where
        F: FnOnce(String) -> FsOp<'a>,
    {
        let (resolution, state) = self.resolve(caller, path)?;
        let backend_path = join_remote_path(
            state.config.remote_subfolder.as_deref(),
            &resolution.relative_path,
        );
        let op = make_op(backend_path);

        if state.config.read_only && op.mutates() {
            return Err(StorageError::ReadOnly(state.config.display_name.clone()));
        }

        self.refresh_if_expiring(&state).await;
        self.run_with_retry(&state, &op).await
    }

    /// Refresh an OAuth credential that is about to lapse, before the call
    /// instead of after its failure. A failed proactive refresh is only
    /// logged; the call itself decides what to surface.
    async fn refresh_if_expiring(&self, state: &MountState) {
        let mount_id = &state.config.mount_id;
        if !self.credentials.is_refreshable(mount_id) {
            return;
        }
        let expiring = self
            .credentials
            .get(mount_id)
            .map(|c| c.expires_soon())
            .unwrap_or(false);
        if !expiring {
            return;
        }
        debug!(mount = %mount_id, "access token expiring, refreshing ahead of call");
        if let Err(e) = self.credentials.refresh(mount_id).await {
            warn!(mount = %mount_id, error = %e, "proactive refresh failed");
        } else {
            state.pool.clear_idle();
        }
    }

    async fn run_with_retry(&self, state: &MountState, op: &FsOp<'_>) -> Result<FsReply> {
        let mount_id = &state.config.mount_id;
        let limits = &state.config.limits;
        let mut refreshed = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut conn = state.pool.acquire().await?;

            let outcome = tokio::time::timeout(
                limits.call_timeout,
                op.execute(conn.handle_mut()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::Unavailable(format!(
                    "{} timed out after {:?}",
                    op.name(),
                    limits.call_timeout
                )))
            });

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(e) if e.triggers_refresh() && !refreshed => {
                    conn.evict();
                    drop(conn);
                    state.pool.clear_idle();

                    if !self.credentials.is_refreshable(mount_id) {
                        // nothing to refresh; the rejection stands
                        return Err(e);
                    }
                    warn!(
                        mount = %mount_id,
                        op = op.name(),
                        "backend rejected credentials, refreshing"
                    );
                    self.credentials.refresh(mount_id).await?;
                    refreshed = true;
                    // retry once on a fresh connection with the new token
                }
                Err(e) if e.is_transient() => {
                    conn.evict();
                    drop(conn);
                    state.pool.clear_idle();

                    if attempt >= limits.retry.max_attempts {
                        warn!(
                            mount = %mount_id,
                            op = op.name(),
                            attempts = attempt,
                            "backend unreachable, giving up"
                        );
                        return Err(StorageError::BackendUnreachable {
                            mount: state.config.display_name.clone(),
                            backend: state.config.backend_type(),
                            detail: e.to_string(),
                        });
                    }
                    let backoff = limits.retry.backoff_base * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        mount = %mount_id,
                        op = op.name(),
                        attempt,
                        backoff = ?backoff,
                        "backend unavailable, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    // domain errors leave the connection healthy; a session
                    // the backend rejected, or one that violated the
                    // protocol, never goes back to the pool
                    if e.triggers_refresh() || matches!(e, StorageError::ProtocolError(_)) {
                        conn.evict();
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Choose the token exchanger for a mount's OAuth credential. The client
/// pair comes from the backend options; backends without one still get an
/// exchanger, the endpoint may not require it.
fn build_exchanger(
    cred: &CredentialConfig,
    backend: &BackendOptions,
) -> Option<Arc<dyn TokenExchanger>> {
    let CredentialConfig::OAuth { token_endpoint, .. } = cred else {
        return None;
    };
    let (client_id, client_secret) = oauth_client_pair(backend);
    Some(Arc::new(HttpTokenExchanger::new(HttpTokenExchangerConfig {
        endpoint: token_endpoint.clone(),
        client_id,
        client_secret,
    })))
}

fn oauth_client_pair(backend: &BackendOptions) -> (String, String) {
    match backend {
        BackendOptions::Dropbox(o) => (
            o.app_key.clone().unwrap_or_default(),
            o.app_secret.clone().unwrap_or_default(),
        ),
        BackendOptions::GoogleDrive(o) => (
            o.client_id.clone().unwrap_or_default(),
            o.client_secret.clone().unwrap_or_default(),
        ),
        _ => (String::new(), String::new()),
    }
}

/// Prefix the mount's remote subfolder onto a resolved relative path.
fn join_remote_path(subfolder: Option<&str>, relative: &str) -> String {
    let sub = subfolder.map(|s| s.trim_matches('/')).unwrap_or("");
    if sub.is_empty() {
        return relative.to_string();
    }
    if relative == "/" {
        format!("/{}", sub)
    } else {
        format!("/{}{}", sub, relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path(None, "/a/b"), "/a/b");
        assert_eq!(join_remote_path(Some("backup"), "/a/b"), "/backup/a/b");
        assert_eq!(join_remote_path(Some("/backup/"), "/"), "/backup");
        assert_eq!(join_remote_path(Some(""), "/x"), "/x");
    }

    #[test]
    fn test_oauth_client_pair() {
        let dropbox = BackendOptions::Dropbox(crate::config::DropboxOptions {
            app_key: Some("key".into()),
            app_secret: Some("secret".into()),
            ..Default::default()
        });
        assert_eq!(
            oauth_client_pair(&dropbox),
            ("key".to_string(), "secret".to_string())
        );

        let ftp = BackendOptions::Ftp(crate::config::FtpOptions::default());
        assert_eq!(oauth_client_pair(&ftp), (String::new(), String::new()));
    }
}
