//! WebDAV driver
//!
//! Plain RFC 4918 client over `reqwest` with basic auth: PROPFIND for
//! stat/list, GET/PUT for data, MKCOL and DELETE for structure. The
//! multistatus responses are scanned with a small element extractor rather
//! than a full XML parser; the handful of properties we need are flat.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, trace};

use crate::backend::{transport_error, DirEntry, Driver, FileType, Handle, Metadata};
use crate::config::{MountId, WebDavOptions};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

pub struct WebDavDriver {
    mount_id: MountId,
    base_url: Url,
    credentials: Arc<CredentialStore>,
}

impl WebDavDriver {
    pub fn new(
        mount_id: MountId,
        options: WebDavOptions,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self> {
        let raw = options.url.clone().unwrap_or_default();
        let raw = if raw.contains("://") {
            raw
        } else {
            let scheme = if options.secure { "https" } else { "http" };
            format!("{}://{}", scheme, raw)
        };
        let mut base_url =
            Url::parse(&raw).map_err(|e| StorageError::ConfigurationInvalid {
                backend: crate::config::BackendType::WebDav,
                detail: format!("malformed option `url`: {}", e),
            })?;

        if let Some(root) = &options.root {
            let mut segments = base_url.path_segments_mut().map_err(|_| {
                StorageError::ConfigurationInvalid {
                    backend: crate::config::BackendType::WebDav,
                    detail: "option `url` cannot hold a path".to_string(),
                }
            })?;
            segments.pop_if_empty();
            for part in root.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }

        Ok(Self {
            mount_id,
            base_url,
            credentials,
        })
    }
}

#[async_trait]
impl Driver for WebDavDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        let credential = self.credentials.get(&self.mount_id)?;
        let (user, secret) = credential.static_pair()?;

        Ok(Box::new(WebDavHandle {
            client: reqwest::Client::new(),
            base_url: self.base_url.clone(),
            user: user.to_string(),
            secret: secret.to_string(),
        }))
    }
}

pub struct WebDavHandle {
    client: reqwest::Client,
    base_url: Url,
    user: String,
    secret: String,
}

impl WebDavHandle {
    fn url_for(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StorageError::InvalidPath("base URL cannot hold a path".into()))?;
            segments.pop_if_empty();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        depth: Option<&str>,
        body: Option<String>,
    ) -> Result<reqwest::Response> {
        let url = self.url_for(path)?;
        let mut request = self
            .client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.secret));
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/xml")
                .body(body);
        }
        request
            .send()
            .await
            .map_err(|e| transport_error("WebDAV", e))
    }
}

fn check_status(status: StatusCode, path: &str) -> Result<()> {
    if status.is_success() || status == StatusCode::MULTI_STATUS {
        return Ok(());
    }
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::Unauthorized(format!("WebDAV rejected credentials for {}", path))
        }
        StatusCode::NOT_FOUND => StorageError::NotFound(format!("path not found: {}", path)),
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => {
            StorageError::AlreadyExists(format!("conflicting resource at: {}", path))
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            StorageError::Unavailable(format!("WebDAV returned {} for {}", s, path))
        }
        s => StorageError::ProtocolError(format!("WebDAV returned {} for {}", s, path)),
    })
}

/// One `<d:response>` block of a multistatus body.
#[derive(Debug, PartialEq)]
struct DavResponse {
    href: String,
    is_collection: bool,
    content_length: u64,
    last_modified: Option<String>,
}

impl DavResponse {
    fn metadata(&self) -> Metadata {
        let mtime = self
            .last_modified
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| SystemTime::from(dt))
            .unwrap_or_else(SystemTime::now);
        if self.is_collection {
            Metadata::directory(mtime)
        } else {
            Metadata::file(self.content_length, mtime)
        }
    }

    /// Last path component of the href, percent-decoded.
    fn name(&self) -> String {
        let trimmed = self.href.trim_end_matches('/');
        let raw = trimmed.rsplit('/').next().unwrap_or(trimmed);
        percent_decode(raw)
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extract the text content of the first `<ns:tag>` element in `block`,
/// ignoring the namespace prefix.
fn element_text<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let mut search = 0;
    while let Some(open) = block[search..].find('<') {
        let start = search + open;
        let rest = &block[start + 1..];
        let end = rest.find('>')?;
        let raw_name = &rest[..end];
        let name = raw_name
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or("");
        let local = name.rsplit(':').next().unwrap_or(name);
        if local.eq_ignore_ascii_case(tag) && !raw_name.starts_with('/') {
            if raw_name.ends_with('/') {
                return Some("");
            }
            let content_start = start + 1 + end + 1;
            let close = block[content_start..].find('<')?;
            return Some(&block[content_start..content_start + close]);
        }
        search = start + 1 + end + 1;
    }
    None
}

/// Whether a `<d:response>` block describes a collection.
fn block_is_collection(block: &str) -> bool {
    block.contains("collection/>") || block.contains("collection />")
        || block.to_ascii_lowercase().contains(":collection")
}

/// Split a multistatus body into per-resource blocks and parse each.
fn parse_multistatus(body: &str) -> Result<Vec<DavResponse>> {
    let lower = body.to_ascii_lowercase();
    if !lower.contains("multistatus") {
        return Err(StorageError::ProtocolError(
            "WebDAV response is not a multistatus document".into(),
        ));
    }

    let mut responses = Vec::new();
    let mut search = 0;
    while let Some(start_rel) = find_element(&lower[search..], "response", false) {
        let start = search + start_rel;
        let end_rel = match find_element(&lower[start..], "response", true) {
            Some(e) => e,
            None => break,
        };
        let end = start + end_rel;
        let block = &body[start..end];

        let href = element_text(block, "href").ok_or_else(|| {
            StorageError::ProtocolError("multistatus response without href".into())
        })?;
        responses.push(DavResponse {
            href: href.trim().to_string(),
            is_collection: block_is_collection(block),
            content_length: element_text(block, "getcontentlength")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            last_modified: element_text(block, "getlastmodified")
                .map(|v| v.trim().to_string()),
        });
        search = end + 1;
    }
    Ok(responses)
}

/// Find the byte offset of an opening or closing `response` element in a
/// lowercased document, tolerating a namespace prefix.
fn find_element(haystack: &str, tag: &str, closing: bool) -> Option<usize> {
    let mut search = 0;
    while let Some(pos) = haystack[search..].find('<') {
        let at = search + pos;
        let rest = &haystack[at + 1..];
        let is_close = rest.starts_with('/');
        let name_part = if is_close { &rest[1..] } else { rest };
        let name_end = name_part.find(|c: char| c == '>' || c.is_whitespace());
        if let Some(name_end) = name_end {
            let name = &name_part[..name_end];
            let local = name.rsplit(':').next().unwrap_or(name);
            if local == tag && is_close == closing {
                return Some(at);
            }
        }
        search = at + 1;
    }
    None
}

#[async_trait]
impl Handle for WebDavHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        trace!(path, "stat");
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|_| StorageError::ProtocolError("bad method".into()))?;
        let response = self
            .request(method, path, Some("0"), Some(PROPFIND_BODY.to_string()))
            .await?;
        check_status(response.status(), path)?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("WebDAV", e))?;

        let responses = parse_multistatus(&body)?;
        let first = responses.first().ok_or_else(|| {
            StorageError::ProtocolError("empty multistatus for stat".into())
        })?;
        Ok(first.metadata())
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        trace!(path, offset, size, "read");
        let url = self.url_for(path)?;
        let mut request = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.secret));
        if size > 0 {
            request = request.header(
                "Range",
                format!("bytes={}-{}", offset, offset + size as u64 - 1),
            );
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error("WebDAV", e))?;
        check_status(response.status(), path)?;
        response
            .bytes()
            .await
            .map_err(|e| transport_error("WebDAV", e))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        debug!(path, size = data.len(), "write");
        let url = self.url_for(path)?;
        let response = self
            .client
            .put(url)
            .basic_auth(&self.user, Some(&self.secret))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| transport_error("WebDAV", e))?;
        check_status(response.status(), path)?;
        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        trace!(path, "list");
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|_| StorageError::ProtocolError("bad method".into()))?;
        let response = self
            .request(method, path, Some("1"), Some(PROPFIND_BODY.to_string()))
            .await?;
        check_status(response.status(), path)?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("WebDAV", e))?;

        let responses = parse_multistatus(&body)?;
        // Depth 1 includes the collection itself as the first response
        let self_href = self.url_for(path)?.path().trim_end_matches('/').to_string();
        Ok(responses
            .iter()
            .filter(|r| r.href.trim_end_matches('/') != self_href)
            .map(|r| DirEntry {
                name: r.name(),
                file_type: if r.is_collection {
                    FileType::Directory
                } else {
                    FileType::File
                },
            })
            .collect())
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        debug!(path, "delete");
        let url = self.url_for(path)?;
        let response = self
            .client
            .delete(url)
            .basic_auth(&self.user, Some(&self.secret))
            .send()
            .await
            .map_err(|e| transport_error("WebDAV", e))?;
        check_status(response.status(), path)
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        debug!(path, "mkdir");
        let method = Method::from_bytes(b"MKCOL")
            .map_err(|_| StorageError::ProtocolError("bad method".into()))?;
        let response = self.request(method, path, None, None).await?;
        check_status(response.status(), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/docs/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/docs/report%20final.pdf</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>2048</d:getcontentlength>
        <d:getlastmodified>Tue, 15 Nov 1994 12:45:26 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_multistatus() {
        let responses = parse_multistatus(MULTISTATUS).unwrap();
        assert_eq!(responses.len(), 2);

        assert_eq!(responses[0].href, "/dav/docs/");
        assert!(responses[0].is_collection);

        assert_eq!(responses[1].href, "/dav/docs/report%20final.pdf");
        assert!(!responses[1].is_collection);
        assert_eq!(responses[1].content_length, 2048);
        assert_eq!(responses[1].name(), "report final.pdf");

        let metadata = responses[1].metadata();
        assert!(metadata.is_file());
        assert_eq!(metadata.size, 2048);
    }

    #[test]
    fn test_parse_rejects_non_multistatus() {
        assert!(parse_multistatus("<html>login page</html>").is_err());
    }

    #[test]
    fn test_element_text_ignores_namespace_prefix() {
        let block = "<D:href>/a/b</D:href>";
        assert_eq!(element_text(block, "href"), Some("/a/b"));
        let block = "<href>/c</href>";
        assert_eq!(element_text(block, "href"), Some("/c"));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED, "/a"),
            Err(StorageError::Unauthorized(_))
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND, "/a"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY, "/a"),
            Err(StorageError::Unavailable(_))
        ));
        assert!(check_status(StatusCode::MULTI_STATUS, "/a").is_ok());
    }

    #[test]
    fn test_root_option_extends_base_url() {
        let driver = WebDavDriver::new(
            "dav".into(),
            WebDavOptions {
                url: Some("https://dav.example.org/remote.php".into()),
                root: Some("/team/docs/".into()),
                ..Default::default()
            },
            Arc::new(CredentialStore::new()),
        )
        .unwrap();
        assert_eq!(
            driver.base_url.as_str(),
            "https://dav.example.org/remote.php/team/docs"
        );
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%2"), "bad%2");
    }
}
