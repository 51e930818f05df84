//! Facade-level integration tests
//!
//! Exercise the resolve / pool / retry pipeline end to end against the
//! in-memory backend, with scripted drivers injecting the failures the
//! retry policy exists for.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_test::assert_ok;

use extmount::backend::memory::MemoryDriver;
use extmount::backend::{DirEntry, Driver, Handle, Metadata};
use extmount::config::{
    BackendOptions, MemoryOptions, MountConfig, MountId, MountLimits, MountScope, ResolvedMount,
    RetryPolicy,
};
use extmount::credentials::{Credential, OAuthToken, RefreshError, TokenExchanger};
use extmount::facade::ExternalStorage;
use extmount::resolver::Caller;
use extmount::{Result, StorageError};

fn everyone() -> MountScope {
    MountScope::System {
        users: vec![],
        groups: vec![],
    }
}

fn fast_limits() -> MountLimits {
    MountLimits {
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
        ..MountLimits::default()
    }
}

fn memory_mount(id: &str, mount_point: &str) -> MountConfig {
    MountConfig {
        mount_id: MountId::from(id),
        display_name: id.to_string(),
        mount_point: mount_point.to_string(),
        backend: BackendOptions::Memory(MemoryOptions::default()),
        scope: everyone(),
        remote_subfolder: None,
        read_only: false,
        limits: fast_limits(),
    }
}

fn alice() -> Caller {
    Caller::new("alice", vec!["staff".into()])
}

// -- scripted failure injection ----------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> StorageError + Send + Sync>;

/// Delegates to an in-memory backend after injecting a scripted number of
/// failures (usize::MAX means fail forever). Counts every operation and
/// every opened connection.
struct ScriptedDriver {
    inner: MemoryDriver,
    failures_left: Arc<AtomicUsize>,
    ops: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    error: ErrorFactory,
}

impl ScriptedDriver {
    fn new(failures: usize, error: ErrorFactory) -> Self {
        Self {
            inner: MemoryDriver::new(),
            failures_left: Arc::new(AtomicUsize::new(failures)),
            ops: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            error,
        }
    }

    fn op_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.ops)
    }

    fn connect_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle {
            inner: self.inner.connect().await?,
            failures_left: Arc::clone(&self.failures_left),
            ops: Arc::clone(&self.ops),
            error: Arc::clone(&self.error),
        }))
    }
}

struct ScriptedHandle {
    inner: Box<dyn Handle>,
    failures_left: Arc<AtomicUsize>,
    ops: Arc<AtomicUsize>,
    error: ErrorFactory,
}

impl ScriptedHandle {
    fn check(&self) -> Result<()> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        if left != usize::MAX {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
        }
        Err((self.error)())
    }
}

#[async_trait]
impl Handle for ScriptedHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        self.check()?;
        self.inner.stat(path).await
    }
    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        self.check()?;
        self.inner.read(path, offset, size).await
    }
    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        self.check()?;
        self.inner.write(path, data).await
    }
    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.check()?;
        self.inner.list(path).await
    }
    async fn delete(&mut self, path: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(path).await
    }
    async fn mkdir(&mut self, path: &str) -> Result<()> {
        self.check()?;
        self.inner.mkdir(path).await
    }
}

/// Delegates to an in-memory backend, but hangs every operation while the
/// `stalled` flag is set.
struct StallingDriver {
    inner: MemoryDriver,
    stalled: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl StallingDriver {
    fn new() -> Self {
        Self {
            inner: MemoryDriver::new(),
            stalled: Arc::new(AtomicBool::new(true)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Driver for StallingDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StallingHandle {
            inner: self.inner.connect().await?,
            stalled: Arc::clone(&self.stalled),
        }))
    }
}

struct StallingHandle {
    inner: Box<dyn Handle>,
    stalled: Arc<AtomicBool>,
}

impl StallingHandle {
    async fn gate(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Handle for StallingHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        self.gate().await;
        self.inner.stat(path).await
    }
    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        self.gate().await;
        self.inner.read(path, offset, size).await
    }
    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        self.gate().await;
        self.inner.write(path, data).await
    }
    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.gate().await;
        self.inner.list(path).await
    }
    async fn delete(&mut self, path: &str) -> Result<()> {
        self.gate().await;
        self.inner.delete(path).await
    }
    async fn mkdir(&mut self, path: &str) -> Result<()> {
        self.gate().await;
        self.inner.mkdir(path).await
    }
}

struct CountingExchanger {
    exchanges: AtomicUsize,
    fail: bool,
}

impl CountingExchanger {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            exchanges: AtomicUsize::new(0),
            fail,
        })
    }
}

#[async_trait]
impl TokenExchanger for CountingExchanger {
    async fn exchange(&self, token: &OAuthToken) -> std::result::Result<OAuthToken, RefreshError> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RefreshError("grant revoked".to_string()));
        }
        Ok(OAuthToken {
            access_token: format!("at-{}", n + 1),
            refresh_token: token.refresh_token.clone(),
            expires_at: None,
        })
    }
}

fn oauth_credential() -> Credential {
    Credential::OAuth(OAuthToken {
        access_token: "at-0".to_string(),
        refresh_token: "rt".to_string(),
        expires_at: None,
    })
}

// -- tests --------------------------------------------------------------------

#[tokio::test]
async fn test_memory_round_trip() {
    let storage = ExternalStorage::new();
    storage
        .register_mount(ResolvedMount {
            config: memory_mount("mem", "/data"),
            credentials: None,
        })
        .unwrap();
    let caller = alice();

    assert_ok!(storage.mkdir(&caller, "/data/docs").await);
    let written = storage
        .write(&caller, "/data/docs/a.txt", b"hello world")
        .await
        .unwrap();
    assert_eq!(written, 11);

    let meta = storage.stat(&caller, "/data/docs/a.txt").await.unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.size, 11);

    let data = storage.read(&caller, "/data/docs/a.txt", 6, 5).await.unwrap();
    assert_eq!(&data[..], b"world");

    let entries = storage.list(&caller, "/data/docs").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a.txt");

    assert!(storage.exists(&caller, "/data/docs/a.txt").await.unwrap());
    storage.delete(&caller, "/data/docs/a.txt").await.unwrap();
    assert!(!storage.exists(&caller, "/data/docs/a.txt").await.unwrap());
}

#[tokio::test]
async fn test_no_mount_matches() {
    let storage = ExternalStorage::new();
    storage
        .register_mount(ResolvedMount {
            config: memory_mount("mem", "/data"),
            credentials: None,
        })
        .unwrap();

    let err = storage.stat(&alice(), "/elsewhere/x").await.unwrap_err();
    assert!(matches!(err, StorageError::NoSuchMount(_)));
}

#[tokio::test]
async fn test_read_only_mount_rejects_mutations() {
    let storage = ExternalStorage::new();
    let mut config = memory_mount("ro", "/archive");
    config.read_only = true;
    storage
        .register_mount(ResolvedMount {
            config,
            credentials: None,
        })
        .unwrap();
    let caller = alice();

    let err = storage.write(&caller, "/archive/x", b"data").await.unwrap_err();
    assert!(matches!(err, StorageError::ReadOnly(_)));
    let err = storage.mkdir(&caller, "/archive/d").await.unwrap_err();
    assert!(matches!(err, StorageError::ReadOnly(_)));

    // reads still go through
    assert!(storage.stat(&caller, "/archive").await.unwrap().is_dir());
}

#[tokio::test]
async fn test_longest_prefix_routes_to_nested_mount() {
    let storage = ExternalStorage::new();
    storage
        .register_mount(ResolvedMount {
            config: memory_mount("outer", "/docs"),
            credentials: None,
        })
        .unwrap();
    storage
        .register_mount(ResolvedMount {
            config: memory_mount("inner", "/docs/archive"),
            credentials: None,
        })
        .unwrap();
    let caller = alice();

    storage
        .write(&caller, "/docs/archive/old.txt", b"archived")
        .await
        .unwrap();

    // the nested mount holds the file; the outer mount's backend is empty
    assert!(storage.exists(&caller, "/docs/archive/old.txt").await.unwrap());
    let outer = storage.list(&caller, "/docs").await.unwrap();
    assert!(outer.is_empty());
}

#[tokio::test]
async fn test_personal_mount_invisible_to_others() {
    let storage = ExternalStorage::new();
    let mut config = memory_mount("home", "/home");
    config.scope = MountScope::Personal {
        owner: "alice".to_string(),
    };
    storage
        .register_mount(ResolvedMount {
            config,
            credentials: None,
        })
        .unwrap();

    assert!(storage.stat(&alice(), "/home").await.is_ok());
    let err = storage
        .stat(&Caller::new("bob", vec![]), "/home")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NoSuchMount(_)));
}

#[tokio::test]
async fn test_remote_subfolder_is_prefixed() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(ScriptedDriver::new(0, Arc::new(|| unreachable!())));
    let mut config = memory_mount("sub", "/mnt");
    config.remote_subfolder = Some("backup".to_string());
    storage.register_mount_with_driver(config, Arc::clone(&driver) as Arc<dyn Driver>);
    let caller = alice();

    storage.write(&caller, "/mnt/x.txt", b"abc").await.unwrap();

    // the driver stored the object under the subfolder
    let mut handle = driver.inner.connect().await.unwrap();
    assert!(handle.exists("/backup/x.txt").await.unwrap());
    assert!(!handle.exists("/x.txt").await.unwrap());
}

#[tokio::test]
async fn test_unauthorized_refreshes_and_retries_once() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(ScriptedDriver::new(
        1,
        Arc::new(|| StorageError::Unauthorized("token expired".into())),
    ));
    let ops = driver.op_count();
    let exchanger = CountingExchanger::new(false);

    let config = memory_mount("oauth", "/cloud");
    storage.credentials().insert(
        config.mount_id.clone(),
        oauth_credential(),
        Some(exchanger.clone()),
    );
    storage.register_mount_with_driver(config, driver);
    let caller = alice();

    storage.mkdir(&caller, "/cloud/d").await.unwrap();

    assert_eq!(exchanger.exchanges.load(Ordering::SeqCst), 1);
    // one rejected call, one retried call
    assert_eq!(ops.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_session_not_recycled_after_refresh_retry() {
    let storage = ExternalStorage::new();
    // both the original call and the post-refresh retry are rejected
    let driver = Arc::new(ScriptedDriver::new(
        2,
        Arc::new(|| StorageError::Unauthorized("access denied".into())),
    ));
    let connects = driver.connect_count();
    let exchanger = CountingExchanger::new(false);

    let config = memory_mount("tainted", "/cloud");
    storage.credentials().insert(
        config.mount_id.clone(),
        oauth_credential(),
        Some(exchanger),
    );
    storage.register_mount_with_driver(config, driver);
    let caller = alice();

    let err = storage.stat(&caller, "/cloud").await.unwrap_err();
    assert!(matches!(err, StorageError::Unauthorized(_)));
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    // the session that was rejected after the retry must not be parked;
    // the next call gets a fresh connection
    storage.stat(&caller, "/cloud").await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_static_credentials_surface_unauthorized() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(ScriptedDriver::new(
        usize::MAX,
        Arc::new(|| StorageError::Unauthorized("bad password".into())),
    ));
    let ops = driver.op_count();

    let config = memory_mount("smb-like", "/share");
    storage.credentials().insert(
        config.mount_id.clone(),
        Credential::StaticSecret {
            user: "svc".to_string(),
            secret: "old".to_string(),
        },
        None,
    );
    storage.register_mount_with_driver(config, driver);

    let err = storage.stat(&alice(), "/share/x").await.unwrap_err();
    // nothing to refresh: the original rejection stands, without a retry
    assert!(matches!(err, StorageError::Unauthorized(_)));
    assert_eq!(ops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_refresh_surfaces_refresh_failed() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(ScriptedDriver::new(
        usize::MAX,
        Arc::new(|| StorageError::Unauthorized("token expired".into())),
    ));
    let exchanger = CountingExchanger::new(true);

    let config = memory_mount("revoked", "/cloud");
    storage.credentials().insert(
        config.mount_id.clone(),
        oauth_credential(),
        Some(exchanger),
    );
    storage.register_mount_with_driver(config, driver);

    let err = storage.stat(&alice(), "/cloud/x").await.unwrap_err();
    match err {
        StorageError::RefreshFailed { mount, detail } => {
            assert_eq!(mount, "revoked");
            assert!(detail.contains("grant revoked"));
        }
        other => panic!("expected RefreshFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unavailable_exhausts_retry_budget() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(ScriptedDriver::new(
        usize::MAX,
        Arc::new(|| StorageError::Unavailable("connection reset".into())),
    ));
    let ops = driver.op_count();

    storage.register_mount_with_driver(memory_mount("flaky", "/flaky"), driver);

    let err = storage.stat(&alice(), "/flaky/x").await.unwrap_err();
    match err {
        StorageError::BackendUnreachable { mount, detail, .. } => {
            assert_eq!(mount, "flaky");
            assert!(detail.contains("connection reset"));
        }
        other => panic!("expected BackendUnreachable, got {:?}", other),
    }
    // exactly max_attempts calls, no fourth attempt
    assert_eq!(ops.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_hung_call_cut_off_by_call_timeout() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(StallingDriver::new());
    let connects = Arc::clone(&driver.connects);

    let mut config = memory_mount("hung", "/hung");
    config.limits.call_timeout = Duration::from_millis(30);
    config.limits.retry.max_attempts = 2;
    storage.register_mount_with_driver(config, driver);

    let err = storage.stat(&alice(), "/hung").await.unwrap_err();
    match err {
        StorageError::BackendUnreachable { mount, detail, .. } => {
            assert_eq!(mount, "hung");
            assert!(detail.contains("timed out"), "detail: {}", detail);
        }
        other => panic!("expected BackendUnreachable, got {:?}", other),
    }
    // every timed-out connection was evicted, so each attempt reconnected
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancelled_call_releases_pool_slot() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(StallingDriver::new());
    let stalled = Arc::clone(&driver.stalled);
    let connects = Arc::clone(&driver.connects);

    let mut config = memory_mount("slot", "/s");
    config.limits.max_connections = 1;
    config.limits.acquire_timeout = Duration::from_millis(100);
    storage.register_mount_with_driver(config, driver);
    let caller = alice();

    {
        let op = storage.stat(&caller, "/s");
        tokio::pin!(op);
        tokio::select! {
            _ = &mut op => panic!("stalled call should not resolve"),
            _ = tokio::time::sleep(Duration::from_millis(30)) => {}
        }
        // dropping the operation releases the mount's only slot
    }

    stalled.store(false, Ordering::SeqCst);
    storage.stat(&caller, "/s").await.unwrap();
    // the released connection went back to the pool and was reused
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_failure_recovers_within_budget() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(ScriptedDriver::new(
        1,
        Arc::new(|| StorageError::Unavailable("blip".into())),
    ));
    let ops = driver.op_count();

    storage.register_mount_with_driver(memory_mount("blippy", "/b"), driver);
    let caller = alice();

    storage.mkdir(&caller, "/b/dir").await.unwrap();
    assert_eq!(ops.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_domain_errors_do_not_retry() {
    let storage = ExternalStorage::new();
    let driver = Arc::new(ScriptedDriver::new(0, Arc::new(|| unreachable!())));
    let ops = driver.op_count();

    storage.register_mount_with_driver(memory_mount("mem", "/m"), driver);

    let err = storage.stat(&alice(), "/m/missing").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert_eq!(ops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_visible_mounts_respect_scope() {
    let storage = ExternalStorage::new();
    storage
        .register_mount(ResolvedMount {
            config: memory_mount("shared", "/shared"),
            credentials: None,
        })
        .unwrap();
    let mut personal = memory_mount("home", "/home");
    personal.scope = MountScope::Personal {
        owner: "alice".to_string(),
    };
    storage
        .register_mount(ResolvedMount {
            config: personal,
            credentials: None,
        })
        .unwrap();

    assert_eq!(storage.visible_mounts(&alice()).len(), 2);
    assert_eq!(storage.visible_mounts(&Caller::new("bob", vec![])).len(), 1);
}

#[tokio::test]
async fn test_remove_mount() {
    let storage = ExternalStorage::new();
    storage
        .register_mount(ResolvedMount {
            config: memory_mount("mem", "/data"),
            credentials: None,
        })
        .unwrap();
    assert!(storage.stat(&alice(), "/data").await.is_ok());

    storage.remove_mount(&MountId::from("mem"));
    assert_eq!(storage.mount_count(), 0);
    let err = storage.stat(&alice(), "/data").await.unwrap_err();
    assert!(matches!(err, StorageError::NoSuchMount(_)));
}
