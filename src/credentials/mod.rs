//! Credential store
//!
//! Owns every mount's secret material. Drivers borrow credential values per
//! call and never keep their own copy, so a refresh is visible to the next
//! call on every connection.
//!
//! OAuth refreshes are single-flight per mount: concurrent callers share one
//! in-flight token exchange and all observe its result, success or failure.

pub mod oauth;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CredentialConfig, MountId};
use crate::error::{Result, StorageError};

pub use oauth::HttpTokenExchanger;

/// Buffer before token expiry at which a refresh is triggered proactively.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// An OAuth token pair with optional expiry.
#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<SystemTime>,
}

impl OAuthToken {
    /// Whether the access token is expired or inside the refresh buffer.
    pub fn expires_soon(&self) -> bool {
        match self.expires_at {
            Some(at) => match at.duration_since(SystemTime::now()) {
                Ok(remaining) => remaining < EXPIRY_BUFFER,
                Err(_) => true,
            },
            None => false,
        }
    }
}

/// Secret material for one mount.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Static username/secret pair (passwords, access keys)
    StaticSecret { user: String, secret: String },
    /// OAuth token pair, refreshed in place
    OAuth(OAuthToken),
}

impl Credential {
    pub fn expires_soon(&self) -> bool {
        match self {
            Credential::StaticSecret { .. } => false,
            Credential::OAuth(token) => token.expires_soon(),
        }
    }

    /// Static user/secret pair, or `Unauthorized` for OAuth credentials.
    pub fn static_pair(&self) -> Result<(&str, &str)> {
        match self {
            Credential::StaticSecret { user, secret } => Ok((user, secret)),
            Credential::OAuth(_) => Err(StorageError::Unauthorized(
                "backend requires a static secret, found an OAuth token".into(),
            )),
        }
    }

    /// Bearer access token, or `Unauthorized` for static credentials.
    pub fn bearer_token(&self) -> Result<&str> {
        match self {
            Credential::OAuth(token) => Ok(&token.access_token),
            Credential::StaticSecret { .. } => Err(StorageError::Unauthorized(
                "backend requires an OAuth token, found a static secret".into(),
            )),
        }
    }
}

/// Failure of a token exchange. Cloneable so every waiter of a shared
/// in-flight refresh observes the same outcome.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RefreshError(pub String);

/// Performs the network token exchange for an OAuth credential.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, token: &OAuthToken) -> std::result::Result<OAuthToken, RefreshError>;
}

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<Credential, RefreshError>>>;

struct Entry {
    credential: RwLock<Credential>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    /// The one in-flight refresh for this mount, if any
    inflight: Mutex<Option<SharedRefresh>>,
}

/// Store of per-mount credentials with single-flight refresh.
#[derive(Default)]
pub struct CredentialStore {
    entries: DashMap<MountId, Arc<Entry>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount's credentials, replacing any previous entry.
    pub fn insert(
        &self,
        mount_id: MountId,
        credential: Credential,
        exchanger: Option<Arc<dyn TokenExchanger>>,
    ) {
        self.entries.insert(
            mount_id,
            Arc::new(Entry {
                credential: RwLock::new(credential),
                exchanger,
                inflight: Mutex::new(None),
            }),
        );
    }

    /// Register credentials straight from a mount's configuration.
    pub fn insert_from_config(
        &self,
        mount_id: MountId,
        config: &CredentialConfig,
        exchanger: Option<Arc<dyn TokenExchanger>>,
    ) {
        let credential = match config {
            CredentialConfig::Static { user, secret } => Credential::StaticSecret {
                user: user.clone(),
                secret: secret.clone(),
            },
            CredentialConfig::OAuth {
                refresh_token,
                access_token,
                ..
            } => Credential::OAuth(OAuthToken {
                access_token: access_token.clone().unwrap_or_default(),
                refresh_token: refresh_token.clone(),
                expires_at: Some(SystemTime::now()),
            }),
        };
        self.insert(mount_id, credential, exchanger);
    }

    /// Destroy a mount's credentials (mount deleted).
    pub fn remove(&self, mount_id: &MountId) {
        self.entries.remove(mount_id);
    }

    /// Current credential for a mount.
    pub fn get(&self, mount_id: &MountId) -> Result<Credential> {
        let entry = self
            .entries
            .get(mount_id)
            .ok_or_else(|| StorageError::NotFound(format!("no credentials for mount {}", mount_id)))?;
        let credential = entry.credential.read().clone();
        Ok(credential)
    }

    /// Whether `refresh` can do anything useful for this mount.
    pub fn is_refreshable(&self, mount_id: &MountId) -> bool {
        match self.entries.get(mount_id) {
            Some(entry) => {
                entry.exchanger.is_some()
                    && matches!(&*entry.credential.read(), Credential::OAuth(_))
            }
            None => false,
        }
    }

    /// Refresh a mount's OAuth credential.
    ///
    /// Concurrent callers collapse into one token exchange; every caller
    /// observes that exchange's result. A rejected exchange is terminal until
    /// the administrator reconfigures the mount.
    pub async fn refresh(&self, mount_id: &MountId) -> Result<Credential> {
        let entry = self
            .entries
            .get(mount_id)
            .map(|e| e.clone())
            .ok_or_else(|| StorageError::NotFound(format!("no credentials for mount {}", mount_id)))?;

        let fut = {
            let mut inflight = entry.inflight.lock();
            if let Some(existing) = inflight.as_ref() {
                debug!(mount = %mount_id, "joining in-flight credential refresh");
                existing.clone()
            } else {
                let fut = Self::refresh_future(entry.clone(), mount_id.clone())
                    .boxed()
                    .shared();
                *inflight = Some(fut.clone());
                fut
            }
        };

        fut.await.map_err(|e| StorageError::RefreshFailed {
            mount: mount_id.to_string(),
            detail: e.0,
        })
    }

    async fn refresh_future(
        entry: Arc<Entry>,
        mount_id: MountId,
    ) -> std::result::Result<Credential, RefreshError> {
        let result = Self::do_refresh(&entry, &mount_id).await;
        // Clear the slot before waiters resolve; the shared future keeps the
        // result alive for them.
        *entry.inflight.lock() = None;
        result
    }

    async fn do_refresh(
        entry: &Entry,
        mount_id: &MountId,
    ) -> std::result::Result<Credential, RefreshError> {
        let current = match &*entry.credential.read() {
            Credential::OAuth(token) => token.clone(),
            Credential::StaticSecret { .. } => {
                return Err(RefreshError(
                    "static credential cannot be refreshed".into(),
                ))
            }
        };

        let exchanger = entry
            .exchanger
            .as_ref()
            .ok_or_else(|| RefreshError("no token endpoint configured".into()))?;

        debug!(mount = %mount_id, "exchanging refresh token");
        match exchanger.exchange(&current).await {
            Ok(token) => {
                let credential = Credential::OAuth(token);
                *entry.credential.write() = credential.clone();
                Ok(credential)
            }
            Err(e) => {
                warn!(mount = %mount_id, error = %e, "token exchange rejected");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

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
        async fn exchange(
            &self,
            token: &OAuthToken,
        ) -> std::result::Result<OAuthToken, RefreshError> {
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
            // Hold the exchange open long enough for callers to pile up.
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(RefreshError("invalid app key or secret".into()));
            }
            Ok(OAuthToken {
                access_token: format!("access-{}", n),
                refresh_token: token.refresh_token.clone(),
                expires_at: Some(SystemTime::now() + Duration::from_secs(3600)),
            })
        }
    }

    fn oauth_credential() -> Credential {
        Credential::OAuth(OAuthToken {
            access_token: "stale".into(),
            refresh_token: "refresh-1".into(),
            expires_at: Some(SystemTime::now()),
        })
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_exchange() {
        let store = Arc::new(CredentialStore::new());
        let exchanger = CountingExchanger::new(false);
        let mount: MountId = "dropbox-home".into();
        store.insert(mount.clone(), oauth_credential(), Some(exchanger.clone()));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let mount = mount.clone();
            tasks.push(tokio::spawn(async move { store.refresh(&mount).await }));
        }

        let mut tokens = Vec::new();
        for task in tasks {
            let credential = task.await.unwrap().unwrap();
            match credential {
                Credential::OAuth(t) => tokens.push(t.access_token),
                _ => panic!("expected OAuth credential"),
            }
        }

        assert_eq!(exchanger.exchanges.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "access-1"));
    }

    #[tokio::test]
    async fn test_all_waiters_observe_refresh_failure() {
        let store = Arc::new(CredentialStore::new());
        let exchanger = CountingExchanger::new(true);
        let mount: MountId = "dropbox-home".into();
        store.insert(mount.clone(), oauth_credential(), Some(exchanger.clone()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let mount = mount.clone();
            tasks.push(tokio::spawn(async move { store.refresh(&mount).await }));
        }

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            match err {
                StorageError::RefreshFailed { mount, detail } => {
                    assert_eq!(mount, "dropbox-home");
                    assert!(detail.contains("invalid app key"));
                }
                other => panic!("expected RefreshFailed, got {:?}", other),
            }
        }
        assert_eq!(exchanger.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_are_separate_exchanges() {
        let store = CredentialStore::new();
        let exchanger = CountingExchanger::new(false);
        let mount: MountId = "gdrive".into();
        store.insert(mount.clone(), oauth_credential(), Some(exchanger.clone()));

        store.refresh(&mount).await.unwrap();
        store.refresh(&mount).await.unwrap();
        assert_eq!(exchanger.exchanges.load(Ordering::SeqCst), 2);

        // The stored credential reflects the latest exchange.
        match store.get(&mount).unwrap() {
            Credential::OAuth(t) => assert_eq!(t.access_token, "access-2"),
            _ => panic!("expected OAuth credential"),
        }
    }

    #[tokio::test]
    async fn test_static_credential_not_refreshable() {
        let store = CredentialStore::new();
        let mount: MountId = "smb-share".into();
        store.insert(
            mount.clone(),
            Credential::StaticSecret {
                user: "svc".into(),
                secret: "hunter2".into(),
            },
            None,
        );

        assert!(!store.is_refreshable(&mount));
        let err = store.refresh(&mount).await.unwrap_err();
        assert!(matches!(err, StorageError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn test_remove_destroys_credentials() {
        let store = CredentialStore::new();
        let mount: MountId = "gone".into();
        store.insert(mount.clone(), oauth_credential(), None);
        store.remove(&mount);
        assert!(store.get(&mount).is_err());
    }

    #[test]
    fn test_token_expiry_buffer() {
        let soon = OAuthToken {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Some(SystemTime::now() + Duration::from_secs(30)),
        };
        assert!(soon.expires_soon());

        let later = OAuthToken {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Some(SystemTime::now() + Duration::from_secs(3600)),
        };
        assert!(!later.expires_soon());

        let never = OAuthToken {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: None,
        };
        assert!(!never.expires_soon());
    }
}
