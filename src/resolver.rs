//! Mount resolution
//!
//! Maps a virtual path plus the calling identity to the mount responsible
//! for it. Longest mount-point prefix wins; among mounts at the same depth
//! the more specific grant wins (a mount addressed to the user directly
//! beats one granted via a group, which beats one open to everyone), and
//! configuration order breaks remaining ties.

use std::sync::Arc;

use tracing::trace;

use crate::config::{MountConfig, MountScope};
use crate::error::{Result, StorageError};

/// The identity a request is made on behalf of.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: String,
    pub groups: Vec<String>,
}

impl Caller {
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }

    fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// How specifically a visible mount was granted to the caller. Lower is
/// more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GrantRank {
    User,
    Group,
    Everyone,
}

fn grant_rank(scope: &MountScope, caller: &Caller) -> Option<GrantRank> {
    match scope {
        MountScope::Personal { owner } => {
            if owner == &caller.user {
                Some(GrantRank::User)
            } else {
                None
            }
        }
        MountScope::System { users, groups } => {
            if users.is_empty() && groups.is_empty() {
                Some(GrantRank::Everyone)
            } else if users.iter().any(|u| u == &caller.user) {
                Some(GrantRank::User)
            } else if groups.iter().any(|g| caller.in_group(g)) {
                Some(GrantRank::Group)
            } else {
                None
            }
        }
    }
}

/// A successfully resolved request: the chosen mount and the path relative
/// to its mount point.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub mount: Arc<MountConfig>,
    pub relative_path: String,
}

/// Immutable snapshot of the active mounts. The facade swaps in a whole new
/// table on reconfiguration rather than mutating this one.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<Arc<MountConfig>>,
}

impl MountTable {
    pub fn new(mounts: impl IntoIterator<Item = Arc<MountConfig>>) -> Self {
        Self {
            mounts: mounts.into_iter().collect(),
        }
    }

    /// Resolve a virtual path for a caller.
    pub fn resolve(&self, caller: &Caller, path: &str) -> Result<Resolution> {
        let path = normalize_request_path(path)?;

        let mut best: Option<(usize, GrantRank, &Arc<MountConfig>)> = None;
        for mount in &self.mounts {
            let Some(rank) = grant_rank(&mount.scope, caller) else {
                continue;
            };
            let Some(depth) = prefix_depth(&mount.mount_point, &path) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((best_depth, best_rank, _)) => {
                    depth > *best_depth || (depth == *best_depth && rank < *best_rank)
                }
            };
            if better {
                best = Some((depth, rank, mount));
            }
        }

        let (_, _, mount) = best.ok_or_else(|| StorageError::NoSuchMount(path.clone()))?;
        let relative_path = strip_prefix(&mount.mount_point, &path);
        trace!(
            mount = %mount.mount_id,
            %path,
            relative = %relative_path,
            "resolved"
        );
        Ok(Resolution {
            mount: Arc::clone(mount),
            relative_path,
        })
    }

    /// Mounts visible to a caller, in configuration order.
    pub fn visible(&self, caller: &Caller) -> Vec<Arc<MountConfig>> {
        self.mounts
            .iter()
            .filter(|m| grant_rank(&m.scope, caller).is_some())
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MountConfig>> {
        self.mounts.iter()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

/// Normalize a request path: absolute, no `.`/`..`, collapsed slashes.
///
/// Rejecting `..` outright keeps a caller from escaping a mount by
/// resolving through its prefix.
pub fn normalize_request_path(raw: &str) -> Result<String> {
    if !raw.starts_with('/') {
        return Err(StorageError::InvalidPath(format!(
            "path must be absolute: {:?}",
            raw
        )));
    }
    let mut parts = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(StorageError::InvalidPath(format!(
                    "path may not contain `..`: {:?}",
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

/// Number of components the mount point contributes if it is a prefix of
/// `path`, `None` otherwise. Both inputs are normalized.
fn prefix_depth(mount_point: &str, path: &str) -> Option<usize> {
    if mount_point == "/" {
        return Some(0);
    }
    if path == mount_point {
        return Some(mount_point.matches('/').count());
    }
    if path.starts_with(mount_point) && path.as_bytes().get(mount_point.len()) == Some(&b'/') {
        return Some(mount_point.matches('/').count());
    }
    None
}

fn strip_prefix(mount_point: &str, path: &str) -> String {
    if mount_point == "/" {
        return path.to_string();
    }
    let rest = &path[mount_point.len()..];
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendOptions, MemoryOptions, MountId, MountLimits};

    fn mount(id: &str, mount_point: &str, scope: MountScope) -> Arc<MountConfig> {
        Arc::new(MountConfig {
            mount_id: MountId::from(id),
            display_name: id.to_string(),
            mount_point: mount_point.to_string(),
            backend: BackendOptions::Memory(MemoryOptions::default()),
            scope,
            remote_subfolder: None,
            read_only: false,
            limits: MountLimits::default(),
        })
    }

    fn everyone() -> MountScope {
        MountScope::System {
            users: vec![],
            groups: vec![],
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = MountTable::new([
            mount("root", "/", everyone()),
            mount("docs", "/docs", everyone()),
            mount("deep", "/docs/archive", everyone()),
        ]);
        let alice = Caller::new("alice", vec![]);

        let r = table.resolve(&alice, "/docs/archive/2023/a.txt").unwrap();
        assert_eq!(r.mount.mount_id.0, "deep");
        assert_eq!(r.relative_path, "/2023/a.txt");

        let r = table.resolve(&alice, "/docs/readme.md").unwrap();
        assert_eq!(r.mount.mount_id.0, "docs");

        let r = table.resolve(&alice, "/other").unwrap();
        assert_eq!(r.mount.mount_id.0, "root");
        assert_eq!(r.relative_path, "/other");
    }

    #[test]
    fn test_mount_point_itself_resolves_to_root() {
        let table = MountTable::new([mount("docs", "/docs", everyone())]);
        let alice = Caller::new("alice", vec![]);
        let r = table.resolve(&alice, "/docs").unwrap();
        assert_eq!(r.relative_path, "/");
    }

    #[test]
    fn test_prefix_must_fall_on_component_boundary() {
        let table = MountTable::new([mount("docs", "/docs", everyone())]);
        let alice = Caller::new("alice", vec![]);
        // "/docserver" shares a string prefix but not a path prefix
        assert!(matches!(
            table.resolve(&alice, "/docserver/x"),
            Err(StorageError::NoSuchMount(_))
        ));
    }

    #[test]
    fn test_personal_mounts_are_private() {
        let table = MountTable::new([mount(
            "home",
            "/home",
            MountScope::Personal {
                owner: "alice".into(),
            },
        )]);

        let alice = Caller::new("alice", vec![]);
        assert!(table.resolve(&alice, "/home/notes.txt").is_ok());

        let bob = Caller::new("bob", vec![]);
        assert!(matches!(
            table.resolve(&bob, "/home/notes.txt"),
            Err(StorageError::NoSuchMount(_))
        ));
    }

    #[test]
    fn test_grant_rank_breaks_depth_ties() {
        let for_group = MountScope::System {
            users: vec![],
            groups: vec!["staff".into()],
        };
        let for_user = MountScope::System {
            users: vec!["alice".into()],
            groups: vec![],
        };
        // identical mount points; the user-specific grant must win
        // regardless of configuration order
        let table = MountTable::new([
            mount("shared-group", "/projects", for_group.clone()),
            mount("shared-user", "/projects", for_user.clone()),
            mount("shared-all", "/projects", everyone()),
        ]);

        let alice = Caller::new("alice", vec!["staff".into()]);
        let r = table.resolve(&alice, "/projects/x").unwrap();
        assert_eq!(r.mount.mount_id.0, "shared-user");

        // a caller matched only via group falls back to the group grant
        let carol = Caller::new("carol", vec!["staff".into()]);
        let r = table.resolve(&carol, "/projects/x").unwrap();
        assert_eq!(r.mount.mount_id.0, "shared-group");

        // everyone-mounts catch the rest
        let dave = Caller::new("dave", vec![]);
        let r = table.resolve(&dave, "/projects/x").unwrap();
        assert_eq!(r.mount.mount_id.0, "shared-all");
    }

    #[test]
    fn test_system_scope_visibility() {
        let scoped = MountScope::System {
            users: vec!["alice".into()],
            groups: vec!["eng".into()],
        };
        let table = MountTable::new([mount("eng", "/eng", scoped)]);

        assert!(table
            .resolve(&Caller::new("alice", vec![]), "/eng/x")
            .is_ok());
        assert!(table
            .resolve(&Caller::new("bob", vec!["eng".into()]), "/eng/x")
            .is_ok());
        assert!(table
            .resolve(&Caller::new("mallory", vec!["sales".into()]), "/eng/x")
            .is_err());
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_request_path("/a//b/./c").unwrap(), "/a/b/c");
        assert_eq!(normalize_request_path("/").unwrap(), "/");
        assert!(normalize_request_path("relative").is_err());
        assert!(normalize_request_path("/a/../b").is_err());
    }

    #[test]
    fn test_visible_listing() {
        let table = MountTable::new([
            mount("all", "/all", everyone()),
            mount(
                "home",
                "/home",
                MountScope::Personal {
                    owner: "alice".into(),
                },
            ),
        ]);
        let bob = Caller::new("bob", vec![]);
        let visible = table.visible(&bob);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].mount_id.0, "all");
    }
}
