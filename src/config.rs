//! Configuration parsing and structures
//!
//! Mount configurations are deserialized from YAML into a raw form, then
//! resolved against top-level defaults into immutable [`MountConfig`] values.
//! Reconfiguration never mutates an active mount; a new snapshot is built and
//! swapped in through the facade.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;
use crate::error::{Result, StorageError};

/// Identifier of a configured mount. Connections and credentials are keyed
/// by this and never shared across mounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct MountId(pub String);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MountId {
    fn from(s: &str) -> Self {
        MountId(s.to_string())
    }
}

/// Closed set of supported backend protocols. Adding a backend means adding
/// a variant and a driver, not touching dispatch logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    S3,
    Swift,
    Smb,
    Ftp,
    WebDav,
    Dropbox,
    GoogleDrive,
    /// In-memory backend for tests and local development
    Memory,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendType::S3 => "Amazon S3",
            BackendType::Swift => "OpenStack Swift",
            BackendType::Smb => "SMB/CIFS",
            BackendType::Ftp => "FTP",
            BackendType::WebDav => "WebDAV",
            BackendType::Dropbox => "Dropbox",
            BackendType::GoogleDrive => "Google Drive",
            BackendType::Memory => "Memory",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Per-backend options
// =============================================================================

/// Backend options (tagged enum). Required fields are validated at driver
/// construction so a misconfigured mount fails fast, naming the field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendOptions {
    S3(S3Options),
    Swift(SwiftOptions),
    Smb(SmbOptions),
    Ftp(FtpOptions),
    #[serde(rename = "webdav")]
    WebDav(WebDavOptions),
    Dropbox(DropboxOptions),
    #[serde(rename = "gdrive")]
    GoogleDrive(GDriveOptions),
    Memory(MemoryOptions),
}

/// Amazon S3 and compatible object stores
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3Options {
    /// Bucket name
    pub bucket: Option<String>,
    /// Custom endpoint host (for S3-compatible stores)
    pub host: Option<String>,
    /// Endpoint port
    pub port: Option<u16>,
    /// Region
    pub region: Option<String>,
    /// Use SSL for custom endpoints
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    /// Force path-style addressing (MinIO, LocalStack, etc.)
    #[serde(default)]
    pub use_path_style: bool,
    /// Key prefix for mounting a subpath within the bucket
    pub prefix: Option<String>,
}

/// OpenStack Swift object storage
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SwiftOptions {
    /// URL of the identity (Keystone) endpoint
    pub identity_endpoint: Option<String>,
    /// Tenant name
    pub tenant: Option<String>,
    /// Container holding the mounted objects
    pub container: Option<String>,
    /// Region, matched against the service catalog
    pub region: Option<String>,
    /// Service name in the catalog (defaults to the object store entry)
    pub service_name: Option<String>,
}

/// SMB / CIFS share
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SmbOptions {
    /// Server host
    pub host: Option<String>,
    /// Server port (defaults to 445)
    pub port: Option<u16>,
    /// Share name
    pub share: Option<String>,
    /// Path inside the share to treat as the mount root
    pub root: Option<String>,
}

/// FTP / FTPS server
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FtpOptions {
    /// Server host
    pub host: Option<String>,
    /// Control-channel port (defaults to 21)
    pub port: Option<u16>,
    /// Secure ftps://
    #[serde(default)]
    pub secure: bool,
    /// Path on the server to treat as the mount root
    pub root: Option<String>,
}

/// WebDAV server
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebDavOptions {
    /// Base URL of the DAV endpoint
    pub url: Option<String>,
    /// Secure https://
    #[serde(default = "default_true")]
    pub secure: bool,
    /// Path below the base URL to treat as the mount root
    pub root: Option<String>,
}

/// Dropbox-style OAuth HTTP API
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DropboxOptions {
    /// App key
    pub app_key: Option<String>,
    /// App secret
    pub app_secret: Option<String>,
    /// RPC endpoint override (for tests against a local stub)
    pub api_endpoint: Option<String>,
    /// Content endpoint override
    pub content_endpoint: Option<String>,
}

/// Google-Drive-style OAuth HTTP API
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GDriveOptions {
    /// Client ID
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<String>,
    /// Folder ID used as the mount root (defaults to the drive root)
    pub root_folder_id: Option<String>,
    /// API endpoint override (for tests against a local stub)
    pub api_endpoint: Option<String>,
}

/// In-memory backend; has no required options
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryOptions {}

fn default_true() -> bool {
    true
}

impl BackendOptions {
    pub fn backend_type(&self) -> BackendType {
        match self {
            BackendOptions::S3(_) => BackendType::S3,
            BackendOptions::Swift(_) => BackendType::Swift,
            BackendOptions::Smb(_) => BackendType::Smb,
            BackendOptions::Ftp(_) => BackendType::Ftp,
            BackendOptions::WebDav(_) => BackendType::WebDav,
            BackendOptions::Dropbox(_) => BackendType::Dropbox,
            BackendOptions::GoogleDrive(_) => BackendType::GoogleDrive,
            BackendOptions::Memory(_) => BackendType::Memory,
        }
    }

    /// Validate that every option required by this backend is present.
    ///
    /// The failure names the missing field so the administrator knows what to
    /// fix ("required for OpenStack Object Storage" class of hints).
    pub fn validate(&self) -> Result<()> {
        let required: &[(&str, bool)] = match self {
            BackendOptions::S3(o) => &[("bucket", o.bucket.is_some())],
            BackendOptions::Swift(o) => &[
                ("identity_endpoint", o.identity_endpoint.is_some()),
                ("tenant", o.tenant.is_some()),
                ("container", o.container.is_some()),
            ],
            BackendOptions::Smb(o) => {
                &[("host", o.host.is_some()), ("share", o.share.is_some())]
            }
            BackendOptions::Ftp(o) => &[("host", o.host.is_some())],
            BackendOptions::WebDav(o) => &[("url", o.url.is_some())],
            BackendOptions::Dropbox(o) => &[
                ("app_key", o.app_key.is_some()),
                ("app_secret", o.app_secret.is_some()),
            ],
            BackendOptions::GoogleDrive(o) => &[
                ("client_id", o.client_id.is_some()),
                ("client_secret", o.client_secret.is_some()),
            ],
            BackendOptions::Memory(_) => &[],
        };

        for (field, present) in required {
            if !present {
                return Err(StorageError::ConfigurationInvalid {
                    backend: self.backend_type(),
                    detail: format!("missing required option `{}`", field),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Scope, credentials, limits
// =============================================================================

/// Who a mount is available for.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountScope {
    /// Visible only to its owner
    Personal { owner: String },
    /// Visible to configured users/groups; empty lists mean everyone
    System {
        #[serde(default)]
        users: Vec<String>,
        #[serde(default)]
        groups: Vec<String>,
    },
}

/// Credential material configured next to a mount. Handed to the credential
/// store at startup; drivers never hold a copy.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CredentialConfig {
    /// Static username/secret pair (passwords, access keys)
    Static { user: String, secret: String },
    /// OAuth refresh token, exchanged at the token endpoint
    OAuth {
        refresh_token: String,
        token_endpoint: String,
        #[serde(default)]
        access_token: Option<String>,
    },
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before surfacing `BackendUnreachable`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
        }
    }
}

/// Per-mount concurrency and timeout knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct MountLimits {
    /// Maximum concurrent connections per mount
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long `acquire` waits for a free slot before `PoolExhausted`
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Idle connections past this age are closed
    #[serde(default = "default_idle_ttl", with = "humantime_serde")]
    pub idle_ttl: Duration,
    /// Timeout per network call (not per overall operation)
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for MountLimits {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            idle_ttl: default_idle_ttl(),
            call_timeout: default_call_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(100)
}

fn default_max_connections() -> usize {
    8
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Defaults applied to every mount unless overridden
    #[serde(default)]
    pub defaults: MountDefaults,

    /// Configured mounts
    pub mounts: Vec<RawMountConfig>,
}

/// Top-level defaults section
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MountDefaults {
    pub limits: Option<MountLimits>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Mount configuration before resolution
#[derive(Debug, Clone, Deserialize)]
pub struct RawMountConfig {
    /// Identifier, unique across the configuration
    pub id: MountId,
    /// Folder name shown to users in failures and listings
    pub display_name: Option<String>,
    /// Virtual path prefix this mount answers for
    pub mount_point: String,
    /// Backend protocol and its options
    pub backend: BackendOptions,
    /// Personal or system scope ("Available for")
    pub scope: MountScope,
    /// Remote subfolder to treat as the mount root
    pub remote_subfolder: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    /// Per-mount overrides of the default limits
    pub limits: Option<MountLimits>,
    /// Credential material for this mount
    pub credentials: Option<CredentialConfig>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub mounts: Vec<ResolvedMount>,
}

/// A resolved mount plus its credential material. The credential part is
/// consumed by the credential store and dropped; only `MountConfig` stays
/// around.
#[derive(Debug, Clone)]
pub struct ResolvedMount {
    pub config: MountConfig,
    pub credentials: Option<CredentialConfig>,
}

/// Immutable description of one active mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub mount_id: MountId,
    pub display_name: String,
    /// Normalized virtual prefix, e.g. `/docs` (root is `/`)
    pub mount_point: String,
    pub backend: BackendOptions,
    pub scope: MountScope,
    /// Remote subfolder prefixed to every path handed to the driver
    pub remote_subfolder: Option<String>,
    pub read_only: bool,
    pub limits: MountLimits,
}

impl MountConfig {
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by merging mount settings with
    /// defaults and normalizing mount points.
    pub fn resolve(self) -> Result<Config> {
        let RawConfig {
            logging,
            defaults,
            mounts,
        } = self;

        let mut resolved = Vec::with_capacity(mounts.len());
        for raw in mounts {
            let mount_point = normalize_mount_point(&raw.mount_point)?;
            let display_name = raw
                .display_name
                .unwrap_or_else(|| raw.id.0.clone());
            let limits = raw
                .limits
                .or_else(|| defaults.limits.clone())
                .unwrap_or_default();

            resolved.push(ResolvedMount {
                config: MountConfig {
                    mount_id: raw.id,
                    display_name,
                    mount_point,
                    backend: raw.backend,
                    scope: raw.scope,
                    remote_subfolder: raw.remote_subfolder,
                    read_only: raw.read_only,
                    limits,
                },
                credentials: raw.credentials,
            });
        }

        Ok(Config {
            logging,
            mounts: resolved,
        })
    }
}

/// Normalize a configured mount point: leading slash, no trailing slash,
/// no empty or relative components.
fn normalize_mount_point(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('/') {
        return Err(StorageError::InvalidPath(format!(
            "mount point must be absolute: {:?}",
            raw
        )));
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(StorageError::InvalidPath(format!(
                    "mount point may not contain `..`: {:?}",
                    raw
                )))
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    ///
    /// `${VAR}` references are substituted from the environment before
    /// parsing, so secrets never have to live in the file itself.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;
        let raw: RawConfig = serde_yaml::from_str(&content)
            .map_err(|e| StorageError::Config(format!("failed to parse config: {}", e)))?;
        let config = raw.resolve()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the resolved configuration.
    pub fn validate(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        let mut points = std::collections::HashSet::new();
        for mount in &self.mounts {
            if !ids.insert(&mount.config.mount_id) {
                return Err(StorageError::ConfigurationInvalid {
                    backend: mount.config.backend_type(),
                    detail: format!("duplicate mount id: {}", mount.config.mount_id),
                });
            }
            if !points.insert(&mount.config.mount_point) {
                return Err(StorageError::ConfigurationInvalid {
                    backend: mount.config.backend_type(),
                    detail: format!("duplicate mount point: {}", mount.config.mount_point),
                });
            }
            mount.config.backend.validate()?;
        }
        Ok(())
    }
}
