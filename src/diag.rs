//! Mount diagnostics
//!
//! Checks each configured mount against what the compiled-in drivers can
//! actually do, so an administrator learns at setup time that a mount will
//! not work instead of at first access. Blocking notes mean the mount
//! cannot be used at all; advisory notes flag degraded or risky setups.

use std::fmt;

use crate::config::{BackendOptions, BackendType, MountConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The mount works, but the administrator should know
    Advisory,
    /// The mount cannot be used as configured
    Blocking,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Advisory => f.write_str("advisory"),
            Severity::Blocking => f.write_str("blocking"),
        }
    }
}

/// One finding about a configured mount.
#[derive(Debug, Clone)]
pub struct DiagnosticNote {
    pub mount_id: String,
    pub display_name: String,
    pub backend: BackendType,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for DiagnosticNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.severity, self.display_name, self.backend, self.message
        )
    }
}

/// Inspect one mount's configuration.
pub fn check_mount(config: &MountConfig) -> Vec<DiagnosticNote> {
    let mut notes = Vec::new();
    let note = |severity, message: String| DiagnosticNote {
        mount_id: config.mount_id.to_string(),
        display_name: config.display_name.clone(),
        backend: config.backend_type(),
        severity,
        message,
    };

    if let Err(e) = config.backend.validate() {
        notes.push(note(Severity::Blocking, e.to_string()));
    }

    match &config.backend {
        BackendOptions::Ftp(o) => {
            if o.secure {
                notes.push(note(
                    Severity::Blocking,
                    format!(
                        "FTPS support is not available; mounting of \"{}\" is not possible",
                        config.display_name
                    ),
                ));
            } else {
                notes.push(note(
                    Severity::Advisory,
                    "FTP transfers credentials and data in clear text".to_string(),
                ));
            }
        }
        BackendOptions::Smb(_) => {
            notes.push(note(
                Severity::Advisory,
                "SMB sessions authenticate as guest; password authentication is not available"
                    .to_string(),
            ));
        }
        BackendOptions::WebDav(o) => {
            if !o.secure {
                notes.push(note(
                    Severity::Advisory,
                    "WebDAV over plain http transfers credentials in clear text".to_string(),
                ));
            }
        }
        BackendOptions::S3(o) => {
            if o.host.is_some() && !o.use_ssl {
                notes.push(note(
                    Severity::Advisory,
                    "custom S3 endpoint without SSL transfers credentials in clear text"
                        .to_string(),
                ));
            }
        }
        _ => {}
    }

    notes
}

/// Inspect every mount; blocking notes sort first.
pub fn check_all<'a>(mounts: impl IntoIterator<Item = &'a MountConfig>) -> Vec<DiagnosticNote> {
    let mut notes: Vec<DiagnosticNote> = mounts.into_iter().flat_map(check_mount).collect();
    notes.sort_by_key(|n| match n.severity {
        Severity::Blocking => 0,
        Severity::Advisory => 1,
    });
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FtpOptions, MountId, MountLimits, MountScope, WebDavOptions};

    fn mount(backend: BackendOptions) -> MountConfig {
        MountConfig {
            mount_id: MountId::from("m1"),
            display_name: "Team FTP".to_string(),
            mount_point: "/ftp".to_string(),
            backend,
            scope: MountScope::System {
                users: vec![],
                groups: vec![],
            },
            remote_subfolder: None,
            read_only: false,
            limits: MountLimits::default(),
        }
    }

    #[test]
    fn test_ftps_is_blocking() {
        let config = mount(BackendOptions::Ftp(FtpOptions {
            host: Some("ftp.example.com".into()),
            secure: true,
            ..Default::default()
        }));
        let notes = check_mount(&config);
        assert!(notes
            .iter()
            .any(|n| n.severity == Severity::Blocking && n.message.contains("FTPS")));
        assert!(notes[0].message.contains("Team FTP"));
    }

    #[test]
    fn test_plain_ftp_is_advisory() {
        let config = mount(BackendOptions::Ftp(FtpOptions {
            host: Some("ftp.example.com".into()),
            ..Default::default()
        }));
        let notes = check_mount(&config);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Advisory);
    }

    #[test]
    fn test_missing_required_option_is_blocking() {
        let config = mount(BackendOptions::Ftp(FtpOptions::default()));
        let notes = check_mount(&config);
        assert!(notes
            .iter()
            .any(|n| n.severity == Severity::Blocking && n.message.contains("host")));
    }

    #[test]
    fn test_blocking_notes_sort_first() {
        let ok_dav = mount(BackendOptions::WebDav(WebDavOptions {
            url: Some("https://dav.example.com".into()),
            secure: false,
            root: None,
        }));
        let broken_ftp = mount(BackendOptions::Ftp(FtpOptions {
            secure: true,
            ..Default::default()
        }));
        let notes = check_all([&ok_dav, &broken_ftp]);
        assert!(!notes.is_empty());
        assert_eq!(notes[0].severity, Severity::Blocking);
    }
}
