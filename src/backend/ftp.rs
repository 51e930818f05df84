//! FTP driver
//!
//! Minimal async FTP client: control channel with reply-code parsing,
//! passive-mode data channels for transfers and listings. Binary mode is
//! negotiated at connect time and every path sent to the server is absolute,
//! so handles stay stateless between calls.
//!
//! The `secure` (ftps://) option is accepted by configuration but the TLS
//! upgrade is not implemented; such mounts are reported by the setup
//! diagnostics instead of failing mid-operation.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::backend::{DirEntry, Driver, Handle, Metadata};
use crate::config::{MountId, FtpOptions};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

const DEFAULT_PORT: u16 = 21;

pub struct FtpDriver {
    mount_id: MountId,
    options: FtpOptions,
    credentials: Arc<CredentialStore>,
}

impl FtpDriver {
    pub fn new(mount_id: MountId, options: FtpOptions, credentials: Arc<CredentialStore>) -> Self {
        Self {
            mount_id,
            options,
            credentials,
        }
    }
}

#[async_trait]
impl Driver for FtpDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        if self.options.secure {
            return Err(StorageError::NotSupported(
                "FTPS (secure ftps://) is not supported".into(),
            ));
        }

        let credential = self.credentials.get(&self.mount_id)?;
        let (user, password) = credential.static_pair()?;

        let host = self.options.host.clone().unwrap_or_default();
        let port = self.options.port.unwrap_or(DEFAULT_PORT);
        debug!(mount = %self.mount_id, %host, port, "opening FTP control connection");

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(map_io_error)?;
        let mut handle = FtpHandle {
            control: BufReader::new(stream),
            root: self
                .options
                .root
                .clone()
                .map(|r| format!("/{}", r.trim_matches('/')))
                .unwrap_or_default(),
        };

        let greeting = handle.read_reply().await?;
        if greeting.code != 220 {
            return Err(StorageError::ProtocolError(format!(
                "unexpected FTP greeting: {} {}",
                greeting.code, greeting.text
            )));
        }

        let reply = handle.command(&format!("USER {}", user)).await?;
        let reply = match reply.code {
            331 => handle.command(&format!("PASS {}", password)).await?,
            230 => reply,
            530 => return Err(StorageError::Unauthorized("FTP login rejected".into())),
            _ => {
                return Err(StorageError::ProtocolError(format!(
                    "unexpected reply to USER: {}",
                    reply.code
                )))
            }
        };
        if reply.code != 230 {
            return Err(StorageError::Unauthorized(format!(
                "FTP login rejected with {}",
                reply.code
            )));
        }

        // Binary transfers throughout
        let reply = handle.command("TYPE I").await?;
        if reply.code != 200 {
            return Err(StorageError::ProtocolError(format!(
                "TYPE I rejected with {}",
                reply.code
            )));
        }

        Ok(Box::new(handle))
    }
}

/// A parsed control-channel reply.
#[derive(Debug, PartialEq)]
struct Reply {
    code: u16,
    text: String,
}

fn map_io_error(e: std::io::Error) -> StorageError {
    // Socket failures on either channel mean the backend is unreachable,
    // which the facade treats as retryable.
    StorageError::Unavailable(format!("FTP connection failed: {}", e))
}

fn parse_reply_line(line: &str) -> Result<(u16, bool, &str)> {
    if line.len() < 3 {
        return Err(StorageError::ProtocolError(format!(
            "short FTP reply: {:?}",
            line
        )));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| StorageError::ProtocolError(format!("bad FTP reply code: {:?}", line)))?;
    let continued = line.as_bytes().get(3) == Some(&b'-');
    let text = line.get(4..).unwrap_or("").trim_end();
    Ok((code, continued, text))
}

/// Parse a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply into an
/// address.
fn parse_pasv(text: &str) -> Result<(String, u16)> {
    let start = text
        .find('(')
        .ok_or_else(|| StorageError::ProtocolError(format!("malformed PASV reply: {}", text)))?;
    let end = text[start..]
        .find(')')
        .map(|e| start + e)
        .ok_or_else(|| StorageError::ProtocolError(format!("malformed PASV reply: {}", text)))?;
    let fields: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse::<u16>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| StorageError::ProtocolError(format!("malformed PASV reply: {}", text)))?;
    if fields.len() != 6 || fields[..4].iter().any(|&f| f > 255) {
        return Err(StorageError::ProtocolError(format!(
            "malformed PASV reply: {}",
            text
        )));
    }
    let host = format!("{}.{}.{}.{}", fields[0], fields[1], fields[2], fields[3]);
    let port = fields[4] * 256 + fields[5];
    Ok((host, port))
}

/// Parse one line of a unix-style `LIST` response.
fn parse_list_line(line: &str) -> Option<DirEntry> {
    let mut parts = line.split_whitespace();
    let mode = parts.next()?;
    // permissions, links, owner, group, size, month, day, time/year, name
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    // The name may contain spaces; take everything after the 8th field.
    let mut offset = 0;
    let mut seen = 0;
    let bytes = line.as_bytes();
    let mut in_field = false;
    for (i, b) in bytes.iter().enumerate() {
        let ws = b.is_ascii_whitespace();
        if !ws && !in_field {
            seen += 1;
            in_field = true;
            if seen == 9 {
                offset = i;
                break;
            }
        } else if ws {
            in_field = false;
        }
    }
    let name = &line[offset..];
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(if mode.starts_with('d') {
        DirEntry::directory(name)
    } else {
        DirEntry::file(name)
    })
}

/// Parse a `213 YYYYMMDDHHMMSS` MDTM timestamp.
fn parse_mdtm(text: &str) -> Option<SystemTime> {
    let stamp = text.trim();
    let parsed = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
    Some(SystemTime::from(parsed.and_utc()))
}

pub struct FtpHandle {
    control: BufReader<TcpStream>,
    root: String,
}

impl FtpHandle {
    fn remote_path(&self, path: &str) -> String {
        let rel = path.trim_matches('/');
        match (self.root.is_empty(), rel.is_empty()) {
            (true, true) => "/".to_string(),
            (true, false) => format!("/{}", rel),
            (false, true) => self.root.clone(),
            (false, false) => format!("{}/{}", self.root, rel),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut line = String::new();
        self.control
            .read_line(&mut line)
            .await
            .map_err(map_io_error)?;
        if line.is_empty() {
            return Err(StorageError::Unavailable(
                "FTP control connection closed".into(),
            ));
        }
        let (code, continued, text) = parse_reply_line(&line)?;
        let mut text = text.to_string();

        if continued {
            // Multi-line reply: read until "NNN " terminator
            loop {
                let mut next = String::new();
                self.control
                    .read_line(&mut next)
                    .await
                    .map_err(map_io_error)?;
                if next.is_empty() {
                    return Err(StorageError::Unavailable(
                        "FTP control connection closed".into(),
                    ));
                }
                if next.len() >= 4
                    && next[..3].parse::<u16>() == Ok(code)
                    && next.as_bytes()[3] == b' '
                {
                    break;
                }
                text.push('\n');
                text.push_str(next.trim_end());
            }
        }

        trace!(code, "ftp reply");
        Ok(Reply { code, text })
    }

    async fn command(&mut self, cmd: &str) -> Result<Reply> {
        trace!(cmd = %cmd.split_whitespace().next().unwrap_or(""), "ftp command");
        self.control
            .get_mut()
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(map_io_error)?;
        self.read_reply().await
    }

    /// Enter passive mode and open the data connection.
    async fn open_data_connection(&mut self) -> Result<TcpStream> {
        let reply = self.command("PASV").await?;
        if reply.code != 227 {
            return Err(StorageError::ProtocolError(format!(
                "PASV rejected with {}",
                reply.code
            )));
        }
        let (host, port) = parse_pasv(&reply.text)?;
        TcpStream::connect((host.as_str(), port))
            .await
            .map_err(map_io_error)
    }

    fn map_reply_error(reply: &Reply, path: &str) -> StorageError {
        match reply.code {
            530 | 532 => StorageError::Unauthorized(format!("FTP rejected access to {}", path)),
            550 => StorageError::NotFound(format!("path not found: {}", path)),
            421 | 425 | 426 => {
                StorageError::Unavailable(format!("FTP transfer failed for {}", path))
            }
            code => StorageError::ProtocolError(format!(
                "unexpected FTP reply {} for {}",
                code, path
            )),
        }
    }

    /// RMD answers 550 both for a missing path and for an occupied
    /// directory; only the reply text tells them apart.
    fn map_rmd_error(reply: &Reply, path: &str) -> StorageError {
        if reply.code == 550 && reply.text.to_ascii_lowercase().contains("not empty") {
            return StorageError::NotEmpty(format!("directory not empty: {}", path));
        }
        Self::map_reply_error(reply, path)
    }
}

#[async_trait]
impl Handle for FtpHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        let remote = self.remote_path(path);
        trace!(%remote, "stat");

        let reply = self.command(&format!("SIZE {}", remote)).await?;
        if reply.code == 213 {
            let size: u64 = reply.text.trim().parse().map_err(|_| {
                StorageError::ProtocolError(format!("bad SIZE reply: {}", reply.text))
            })?;
            let mtime = match self.command(&format!("MDTM {}", remote)).await {
                Ok(r) if r.code == 213 => parse_mdtm(&r.text).unwrap_or_else(SystemTime::now),
                _ => SystemTime::now(),
            };
            return Ok(Metadata::file(size, mtime));
        }

        // SIZE fails for directories on most servers; probe with CWD
        let reply = self.command(&format!("CWD {}", remote)).await?;
        if reply.code == 250 {
            return Ok(Metadata::directory(SystemTime::now()));
        }
        Err(StorageError::NotFound(format!("path not found: {}", path)))
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        let remote = self.remote_path(path);
        trace!(%remote, offset, size, "read");

        let mut data = self.open_data_connection().await?;
        if offset > 0 {
            let reply = self.command(&format!("REST {}", offset)).await?;
            if reply.code != 350 {
                return Err(StorageError::NotSupported(
                    "server does not support resumed transfers".into(),
                ));
            }
        }

        let reply = self.command(&format!("RETR {}", remote)).await?;
        if !(reply.code == 150 || reply.code == 125) {
            return Err(Self::map_reply_error(&reply, path));
        }

        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await.map_err(map_io_error)?;
        drop(data);

        let reply = self.read_reply().await?;
        if reply.code != 226 {
            return Err(Self::map_reply_error(&reply, path));
        }

        buf.truncate(size as usize);
        Ok(Bytes::from(buf))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        let remote = self.remote_path(path);
        debug!(%remote, size = data.len(), "write");

        let mut conn = self.open_data_connection().await?;
        let reply = self.command(&format!("STOR {}", remote)).await?;
        if !(reply.code == 150 || reply.code == 125) {
            return Err(Self::map_reply_error(&reply, path));
        }

        conn.write_all(data).await.map_err(map_io_error)?;
        conn.shutdown().await.map_err(map_io_error)?;
        drop(conn);

        let reply = self.read_reply().await?;
        if reply.code != 226 {
            return Err(Self::map_reply_error(&reply, path));
        }
        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let remote = self.remote_path(path);
        trace!(%remote, "list");

        let mut conn = self.open_data_connection().await?;
        let reply = self.command(&format!("LIST {}", remote)).await?;
        if !(reply.code == 150 || reply.code == 125) {
            return Err(Self::map_reply_error(&reply, path));
        }

        let mut raw = String::new();
        conn.read_to_string(&mut raw).await.map_err(map_io_error)?;
        drop(conn);

        let reply = self.read_reply().await?;
        if reply.code != 226 {
            return Err(Self::map_reply_error(&reply, path));
        }

        Ok(raw.lines().filter_map(parse_list_line).collect())
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        let remote = self.remote_path(path);
        debug!(%remote, "delete");

        let reply = self.command(&format!("DELE {}", remote)).await?;
        if reply.code == 250 {
            return Ok(());
        }
        // DELE fails for directories; fall back to RMD
        let reply = self.command(&format!("RMD {}", remote)).await?;
        if reply.code == 250 {
            return Ok(());
        }
        Err(Self::map_rmd_error(&reply, path))
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        let remote = self.remote_path(path);
        debug!(%remote, "mkdir");

        let reply = self.command(&format!("MKD {}", remote)).await?;
        if reply.code == 257 {
            return Ok(());
        }
        if reply.code == 550 {
            return Err(StorageError::AlreadyExists(format!(
                "cannot create directory: {}",
                path
            )));
        }
        Err(Self::map_reply_error(&reply, path))
    }
}
