//! SMB driver
//!
//! A bounded SMB2 client speaking dialect 2.1 over direct TCP (port 445).
//! Sessions are established with an anonymous NTLMSSP exchange, so this
//! driver covers shares that allow guest access; NTLMv2 password
//! authentication is a named follow-up and such mounts are reported by the
//! setup diagnostics.
//!
//! Only the handful of commands the capability interface needs are
//! implemented: NEGOTIATE, SESSION_SETUP, TREE_CONNECT, CREATE, CLOSE,
//! READ, WRITE and QUERY_DIRECTORY. Deletion uses the FILE_DELETE_ON_CLOSE
//! create option, so no SET_INFO round-trip is required.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::backend::{DirEntry, Driver, Handle, Metadata};
use crate::config::{MountId, SmbOptions};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

const DEFAULT_PORT: u16 = 445;
const DIALECT_2_1: u16 = 0x0210;
const HEADER_SIZE: usize = 64;

// Commands
const SMB2_NEGOTIATE: u16 = 0x0000;
const SMB2_SESSION_SETUP: u16 = 0x0001;
const SMB2_TREE_CONNECT: u16 = 0x0003;
const SMB2_CREATE: u16 = 0x0005;
const SMB2_CLOSE: u16 = 0x0006;
const SMB2_READ: u16 = 0x0008;
const SMB2_WRITE: u16 = 0x0009;
const SMB2_QUERY_DIRECTORY: u16 = 0x000E;

// NT status codes
const STATUS_SUCCESS: u32 = 0x0000_0000;
const STATUS_NO_MORE_FILES: u32 = 0x8000_0006;
const STATUS_END_OF_FILE: u32 = 0xC000_0011;
const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;
const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
const STATUS_OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;
const STATUS_OBJECT_NAME_COLLISION: u32 = 0xC000_0035;
const STATUS_OBJECT_PATH_NOT_FOUND: u32 = 0xC000_003A;
const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;
const STATUS_FILE_IS_A_DIRECTORY: u32 = 0xC000_00BA;
const STATUS_DIRECTORY_NOT_EMPTY: u32 = 0xC000_0101;
const STATUS_NOT_A_DIRECTORY: u32 = 0xC000_0103;
const STATUS_BAD_NETWORK_NAME: u32 = 0xC000_00CC;

// CREATE parameters
const FILE_READ_DATA: u32 = 0x0000_0001;
const FILE_WRITE_DATA: u32 = 0x0000_0002;
const FILE_READ_ATTRIBUTES: u32 = 0x0000_0080;
const DELETE: u32 = 0x0001_0000;
const FILE_SHARE_ALL: u32 = 0x0000_0007;
const FILE_OPEN: u32 = 0x0000_0001;
const FILE_CREATE: u32 = 0x0000_0002;
const FILE_OVERWRITE_IF: u32 = 0x0000_0005;
const FILE_DIRECTORY_FILE: u32 = 0x0000_0001;
const FILE_NON_DIRECTORY_FILE: u32 = 0x0000_0040;
const FILE_DELETE_ON_CLOSE: u32 = 0x0000_1000;
const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;

// Chunk size for READ/WRITE; safely below the 64K the 2.1 dialect
// guarantees.
const IO_CHUNK: u32 = 60 * 1024;

// Seconds between the FILETIME epoch (1601) and the unix epoch (1970).
const FILETIME_UNIX_OFFSET: u64 = 11_644_473_600;

pub struct SmbDriver {
    mount_id: MountId,
    options: SmbOptions,
    credentials: Arc<CredentialStore>,
}

impl SmbDriver {
    pub fn new(mount_id: MountId, options: SmbOptions, credentials: Arc<CredentialStore>) -> Self {
        Self {
            mount_id,
            options,
            credentials,
        }
    }
}

#[async_trait]
impl Driver for SmbDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        let credential = self.credentials.get(&self.mount_id)?;
        let (user, _) = credential.static_pair()?;
        let user = if user.is_empty() { "guest" } else { user };

        let host = self.options.host.clone().unwrap_or_default();
        let port = self.options.port.unwrap_or(DEFAULT_PORT);
        let share = self.options.share.clone().unwrap_or_default();
        debug!(mount = %self.mount_id, %host, port, %share, "opening SMB session");

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(map_io_error)?;

        let mut handle = SmbHandle {
            stream,
            message_id: 0,
            session_id: 0,
            tree_id: 0,
            root: self
                .options
                .root
                .clone()
                .map(|r| r.trim_matches('/').replace('/', "\\"))
                .unwrap_or_default(),
        };

        handle.negotiate().await?;
        handle.session_setup(user).await?;
        handle.tree_connect(&host, &share).await?;

        Ok(Box::new(handle))
    }
}

fn map_io_error(e: std::io::Error) -> StorageError {
    StorageError::Unavailable(format!("SMB connection failed: {}", e))
}

fn map_status(status: u32, path: &str) -> StorageError {
    match status {
        STATUS_OBJECT_NAME_NOT_FOUND | STATUS_OBJECT_PATH_NOT_FOUND => {
            StorageError::NotFound(format!("path not found: {}", path))
        }
        STATUS_OBJECT_NAME_COLLISION => {
            StorageError::AlreadyExists(format!("path already exists: {}", path))
        }
        STATUS_ACCESS_DENIED | STATUS_LOGON_FAILURE => {
            StorageError::Unauthorized(format!("SMB denied access to {}", path))
        }
        STATUS_DIRECTORY_NOT_EMPTY => {
            StorageError::NotEmpty(format!("directory not empty: {}", path))
        }
        STATUS_FILE_IS_A_DIRECTORY => {
            StorageError::InvalidPath(format!("is a directory: {}", path))
        }
        STATUS_NOT_A_DIRECTORY => {
            StorageError::InvalidPath(format!("not a directory: {}", path))
        }
        STATUS_BAD_NETWORK_NAME => {
            StorageError::NotFound(format!("no such share: {}", path))
        }
        other => StorageError::ProtocolError(format!(
            "SMB status 0x{:08X} for {}",
            other, path
        )),
    }
}

fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn filetime_to_system(ft: u64) -> SystemTime {
    let secs = ft / 10_000_000;
    let nanos = (ft % 10_000_000) * 100;
    if secs < FILETIME_UNIX_OFFSET {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::new(secs - FILETIME_UNIX_OFFSET, nanos as u32)
}

/// Build an NTLMSSP NEGOTIATE (type 1) token.
fn ntlm_negotiate() -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_slice(b"NTLMSSP\0");
    buf.put_u32_le(1);
    // UNICODE | OEM | REQUEST_TARGET | NTLM | ALWAYS_SIGN
    buf.put_u32_le(0x0000_8207);
    // empty domain and workstation fields
    for _ in 0..2 {
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        buf.put_u32_le(0);
    }
    buf.to_vec()
}

/// Build an anonymous NTLMSSP AUTHENTICATE (type 3) token carrying only the
/// user name. Empty LM/NT responses plus the anonymous flag request a guest
/// session.
fn ntlm_authenticate(user: &str) -> Vec<u8> {
    let user_utf16 = encode_utf16le(user);
    let payload_offset = 64u32;

    let mut buf = BytesMut::new();
    buf.put_slice(b"NTLMSSP\0");
    buf.put_u32_le(3);
    // LmChallengeResponse, NtChallengeResponse, DomainName: all empty
    for _ in 0..3 {
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        buf.put_u32_le(payload_offset);
    }
    // UserName
    buf.put_u16_le(user_utf16.len() as u16);
    buf.put_u16_le(user_utf16.len() as u16);
    buf.put_u32_le(payload_offset);
    // Workstation and EncryptedRandomSessionKey: empty
    for _ in 0..2 {
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        buf.put_u32_le(payload_offset + user_utf16.len() as u32);
    }
    // UNICODE | NTLM | ANONYMOUS | ALWAYS_SIGN
    buf.put_u32_le(0x0000_8A01);
    buf.put_slice(&user_utf16);
    buf.to_vec()
}

/// Fields carried back by a CREATE response that matter to us.
struct CreateReply {
    file_id: [u8; 16],
    last_write: SystemTime,
    end_of_file: u64,
    is_directory: bool,
}

pub struct SmbHandle {
    stream: TcpStream,
    message_id: u64,
    session_id: u64,
    tree_id: u32,
    root: String,
}

impl SmbHandle {
    /// Convert a mount-relative slash path into a share-relative
    /// backslash path.
    fn share_path(&self, path: &str) -> String {
        let rel = path.trim_matches('/').replace('/', "\\");
        match (self.root.is_empty(), rel.is_empty()) {
            (_, true) => self.root.clone(),
            (true, false) => rel,
            (false, false) => format!("{}\\{}", self.root, rel),
        }
    }

    async fn send(&mut self, command: u16, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(4 + HEADER_SIZE + payload.len());
        let length = (HEADER_SIZE + payload.len()) as u32;
        // direct-TCP transport header: zero byte plus 24-bit length
        frame.put_u8(0);
        frame.put_slice(&length.to_be_bytes()[1..]);

        frame.put_slice(b"\xFESMB");
        frame.put_u16_le(HEADER_SIZE as u16);
        frame.put_u16_le(1); // credit charge
        frame.put_u32_le(0); // status
        frame.put_u16_le(command);
        frame.put_u16_le(1); // credits requested
        frame.put_u32_le(0); // flags
        frame.put_u32_le(0); // next command
        frame.put_u64_le(self.message_id);
        frame.put_u32_le(0); // process id
        frame.put_u32_le(self.tree_id);
        frame.put_u64_le(self.session_id);
        frame.put_slice(&[0u8; 16]); // signature
        frame.put_slice(payload);

        self.message_id += 1;
        self.stream
            .write_all(&frame)
            .await
            .map_err(map_io_error)
    }

    /// Receive one response frame; returns the status and the body past the
    /// packet header.
    async fn recv(&mut self) -> Result<(u32, Bytes)> {
        let mut transport = [0u8; 4];
        self.stream
            .read_exact(&mut transport)
            .await
            .map_err(map_io_error)?;
        let length =
            u32::from_be_bytes([0, transport[1], transport[2], transport[3]]) as usize;
        if length < HEADER_SIZE {
            return Err(StorageError::ProtocolError(format!(
                "short SMB frame: {} bytes",
                length
            )));
        }

        let mut frame = vec![0u8; length];
        self.stream
            .read_exact(&mut frame)
            .await
            .map_err(map_io_error)?;
        if &frame[0..4] != b"\xFESMB" {
            return Err(StorageError::ProtocolError(
                "response is not an SMB2 message".into(),
            ));
        }

        let status = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        let session_id = u64::from_le_bytes([
            frame[40], frame[41], frame[42], frame[43], frame[44], frame[45], frame[46],
            frame[47],
        ]);
        if session_id != 0 {
            self.session_id = session_id;
        }
        trace!(status = format_args!("0x{:08X}", status), "smb reply");
        Ok((status, Bytes::from(frame).slice(HEADER_SIZE..)))
    }

    async fn call(&mut self, command: u16, payload: &[u8]) -> Result<(u32, Bytes)> {
        self.send(command, payload).await?;
        self.recv().await
    }

    async fn negotiate(&mut self) -> Result<()> {
        let mut req = BytesMut::new();
        req.put_u16_le(36); // structure size
        req.put_u16_le(1); // dialect count
        req.put_u16_le(1); // security mode: signing enabled
        req.put_u16_le(0); // reserved
        req.put_u32_le(0); // capabilities
        req.put_slice(&[0u8; 16]); // client guid
        req.put_u64_le(0); // client start time
        req.put_u16_le(DIALECT_2_1);
        req.put_u16_le(0); // pad to 4-byte boundary

        let (status, body) = self.call(SMB2_NEGOTIATE, &req).await?;
        if status != STATUS_SUCCESS {
            return Err(map_status(status, "negotiate"));
        }
        if body.len() < 6 {
            return Err(StorageError::ProtocolError(
                "truncated NEGOTIATE response".into(),
            ));
        }
        let dialect = u16::from_le_bytes([body[4], body[5]]);
        if dialect != DIALECT_2_1 {
            return Err(StorageError::ProtocolError(format!(
                "server selected unsupported dialect 0x{:04X}",
                dialect
            )));
        }
        Ok(())
    }

    async fn session_setup(&mut self, user: &str) -> Result<()> {
        let (status, _) = self
            .session_setup_leg(&ntlm_negotiate())
            .await?;
        if status == STATUS_SUCCESS {
            return Ok(());
        }
        if status != STATUS_MORE_PROCESSING_REQUIRED {
            return Err(map_status(status, "session setup"));
        }

        let (status, _) = self
            .session_setup_leg(&ntlm_authenticate(user))
            .await?;
        match status {
            STATUS_SUCCESS => Ok(()),
            STATUS_LOGON_FAILURE | STATUS_ACCESS_DENIED => Err(StorageError::Unauthorized(
                "SMB server rejected the guest session".into(),
            )),
            other => Err(map_status(other, "session setup")),
        }
    }

    async fn session_setup_leg(&mut self, token: &[u8]) -> Result<(u32, Bytes)> {
        let mut req = BytesMut::new();
        req.put_u16_le(25); // structure size
        req.put_u8(0); // flags
        req.put_u8(1); // security mode: signing enabled
        req.put_u32_le(0); // capabilities
        req.put_u32_le(0); // channel
        req.put_u16_le((HEADER_SIZE + 24) as u16); // security buffer offset
        req.put_u16_le(token.len() as u16);
        req.put_u64_le(0); // previous session id
        req.put_slice(token);
        self.call(SMB2_SESSION_SETUP, &req).await
    }

    async fn tree_connect(&mut self, host: &str, share: &str) -> Result<()> {
        let unc = format!("\\\\{}\\{}", host, share);
        let path = encode_utf16le(&unc);

        let mut req = BytesMut::new();
        req.put_u16_le(9); // structure size
        req.put_u16_le(0); // reserved
        req.put_u16_le((HEADER_SIZE + 8) as u16); // path offset
        req.put_u16_le(path.len() as u16);
        req.put_slice(&path);

        self.send(SMB2_TREE_CONNECT, &req).await?;

        // TreeId lives in the packet header, so parse the raw frame here
        let mut transport = [0u8; 4];
        self.stream
            .read_exact(&mut transport)
            .await
            .map_err(map_io_error)?;
        let length =
            u32::from_be_bytes([0, transport[1], transport[2], transport[3]]) as usize;
        if length < HEADER_SIZE {
            return Err(StorageError::ProtocolError(
                "short TREE_CONNECT response".into(),
            ));
        }
        let mut frame = vec![0u8; length];
        self.stream
            .read_exact(&mut frame)
            .await
            .map_err(map_io_error)?;

        let status = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        if status != STATUS_SUCCESS {
            return Err(map_status(status, &unc));
        }
        self.tree_id =
            u32::from_le_bytes([frame[36], frame[37], frame[38], frame[39]]);
        Ok(())
    }

    async fn create(
        &mut self,
        path: &str,
        desired_access: u32,
        disposition: u32,
        create_options: u32,
    ) -> Result<CreateReply> {
        let share_path = self.share_path(path);
        let name = encode_utf16le(&share_path);

        let mut req = BytesMut::new();
        req.put_u16_le(57); // structure size
        req.put_u8(0); // security flags
        req.put_u8(0); // oplock: none
        req.put_u32_le(2); // impersonation
        req.put_u64_le(0); // create flags
        req.put_u64_le(0); // reserved
        req.put_u32_le(desired_access);
        req.put_u32_le(0); // file attributes
        req.put_u32_le(FILE_SHARE_ALL);
        req.put_u32_le(disposition);
        req.put_u32_le(create_options);
        req.put_u16_le((HEADER_SIZE + 56) as u16); // name offset
        req.put_u16_le(name.len() as u16);
        req.put_u32_le(0); // create contexts offset
        req.put_u32_le(0); // create contexts length
        if name.is_empty() {
            // the request body must extend past the fixed part
            req.put_u16_le(0);
        } else {
            req.put_slice(&name);
        }

        let (status, body) = self.call(SMB2_CREATE, &req).await?;
        if status != STATUS_SUCCESS {
            return Err(map_status(status, path));
        }
        if body.len() < 80 {
            return Err(StorageError::ProtocolError(
                "truncated CREATE response".into(),
            ));
        }

        let mut rd = body.clone();
        rd.advance(8); // structure size, oplock, flags, create action
        rd.advance(8); // creation time
        rd.advance(8); // last access time
        let last_write = filetime_to_system(rd.get_u64_le());
        rd.advance(8); // change time
        rd.advance(8); // allocation size
        let end_of_file = rd.get_u64_le();
        let attributes = rd.get_u32_le();
        rd.advance(4); // reserved
        let mut file_id = [0u8; 16];
        rd.copy_to_slice(&mut file_id);

        Ok(CreateReply {
            file_id,
            last_write,
            end_of_file,
            is_directory: attributes & FILE_ATTRIBUTE_DIRECTORY != 0,
        })
    }

    async fn close(&mut self, file_id: [u8; 16]) -> Result<()> {
        let mut req = BytesMut::new();
        req.put_u16_le(24); // structure size
        req.put_u16_le(0); // flags
        req.put_u32_le(0); // reserved
        req.put_slice(&file_id);

        let (status, _) = self.call(SMB2_CLOSE, &req).await?;
        if status != STATUS_SUCCESS {
            return Err(map_status(status, "close"));
        }
        Ok(())
    }

    async fn read_chunk(
        &mut self,
        file_id: [u8; 16],
        offset: u64,
        length: u32,
    ) -> Result<Option<Bytes>> {
        let mut req = BytesMut::new();
        req.put_u16_le(49); // structure size
        req.put_u8(0); // padding
        req.put_u8(0); // flags
        req.put_u32_le(length);
        req.put_u64_le(offset);
        req.put_slice(&file_id);
        req.put_u32_le(0); // minimum count
        req.put_u32_le(0); // channel
        req.put_u32_le(0); // remaining bytes
        req.put_u16_le(0); // read channel info offset
        req.put_u16_le(0); // read channel info length
        req.put_u8(0); // one-byte buffer placeholder

        let (status, body) = self.call(SMB2_READ, &req).await?;
        if status == STATUS_END_OF_FILE {
            return Ok(None);
        }
        if status != STATUS_SUCCESS {
            return Err(map_status(status, "read"));
        }
        if body.len() < 16 {
            return Err(StorageError::ProtocolError("truncated READ response".into()));
        }
        let data_offset = body[2] as usize;
        let data_length =
            u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
        let start = data_offset.saturating_sub(HEADER_SIZE);
        if start + data_length > body.len() {
            return Err(StorageError::ProtocolError(
                "READ response overruns frame".into(),
            ));
        }
        Ok(Some(body.slice(start..start + data_length)))
    }

    async fn write_chunk(
        &mut self,
        file_id: [u8; 16],
        offset: u64,
        data: &[u8],
    ) -> Result<u32> {
        let mut req = BytesMut::with_capacity(48 + data.len());
        req.put_u16_le(49); // structure size
        req.put_u16_le((HEADER_SIZE + 48) as u16); // data offset
        req.put_u32_le(data.len() as u32);
        req.put_u64_le(offset);
        req.put_slice(&file_id);
        req.put_u32_le(0); // channel
        req.put_u32_le(0); // remaining bytes
        req.put_u16_le(0); // write channel info offset
        req.put_u16_le(0); // write channel info length
        req.put_u32_le(0); // flags
        req.put_slice(data);

        let (status, body) = self.call(SMB2_WRITE, &req).await?;
        if status != STATUS_SUCCESS {
            return Err(map_status(status, "write"));
        }
        if body.len() < 8 {
            return Err(StorageError::ProtocolError(
                "truncated WRITE response".into(),
            ));
        }
        Ok(u32::from_le_bytes([body[4], body[5], body[6], body[7]]))
    }

    async fn query_directory_page(
        &mut self,
        file_id: [u8; 16],
        restart: bool,
    ) -> Result<Option<Bytes>> {
        let pattern = encode_utf16le("*");

        let mut req = BytesMut::new();
        req.put_u16_le(33); // structure size
        req.put_u8(1); // FileDirectoryInformation
        req.put_u8(if restart { 0x01 } else { 0x00 }); // SMB2_RESTART_SCANS
        req.put_u32_le(0); // file index
        req.put_slice(&file_id);
        req.put_u16_le((HEADER_SIZE + 32) as u16); // file name offset
        req.put_u16_le(pattern.len() as u16);
        req.put_u32_le(65536); // output buffer length
        req.put_slice(&pattern);

        let (status, body) = self.call(SMB2_QUERY_DIRECTORY, &req).await?;
        if status == STATUS_NO_MORE_FILES {
            return Ok(None);
        }
        if status != STATUS_SUCCESS {
            return Err(map_status(status, "list"));
        }
        if body.len() < 8 {
            return Err(StorageError::ProtocolError(
                "truncated QUERY_DIRECTORY response".into(),
            ));
        }
        let buf_offset = u16::from_le_bytes([body[2], body[3]]) as usize;
        let buf_length =
            u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
        let start = buf_offset.saturating_sub(HEADER_SIZE);
        if start + buf_length > body.len() {
            return Err(StorageError::ProtocolError(
                "QUERY_DIRECTORY response overruns frame".into(),
            ));
        }
        Ok(Some(body.slice(start..start + buf_length)))
    }
}

/// Walk a FileDirectoryInformation buffer, appending the entries it holds.
fn parse_directory_page(buf: &[u8], out: &mut Vec<DirEntry>) -> Result<()> {
    let mut pos = 0usize;
    loop {
        if pos + 64 > buf.len() {
            return Err(StorageError::ProtocolError(
                "truncated directory entry".into(),
            ));
        }
        let entry = &buf[pos..];
        let next = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
        let attributes =
            u32::from_le_bytes([entry[56], entry[57], entry[58], entry[59]]);
        let name_len =
            u32::from_le_bytes([entry[60], entry[61], entry[62], entry[63]]) as usize;
        if 64 + name_len > entry.len() {
            return Err(StorageError::ProtocolError(
                "directory entry name overruns frame".into(),
            ));
        }
        let name = decode_utf16le(&entry[64..64 + name_len]);
        if name != "." && name != ".." {
            out.push(if attributes & FILE_ATTRIBUTE_DIRECTORY != 0 {
                DirEntry::directory(name)
            } else {
                DirEntry::file(name)
            });
        }
        if next == 0 {
            return Ok(());
        }
        pos += next;
    }
}

#[async_trait]
impl Handle for SmbHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        trace!(%path, "stat");
        let reply = self
            .create(path, FILE_READ_ATTRIBUTES, FILE_OPEN, 0)
            .await?;
        let metadata = if reply.is_directory {
            Metadata::directory(reply.last_write)
        } else {
            Metadata::file(reply.end_of_file, reply.last_write)
        };
        self.close(reply.file_id).await?;
        Ok(metadata)
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        trace!(%path, offset, size, "read");
        let reply = self
            .create(path, FILE_READ_DATA, FILE_OPEN, FILE_NON_DIRECTORY_FILE)
            .await?;

        let mut out = BytesMut::with_capacity(size as usize);
        let mut pos = offset;
        while (out.len() as u32) < size {
            let want = (size - out.len() as u32).min(IO_CHUNK);
            match self.read_chunk(reply.file_id, pos, want).await {
                Ok(Some(chunk)) if chunk.is_empty() => break,
                Ok(Some(chunk)) => {
                    pos += chunk.len() as u64;
                    out.put_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    // best-effort close before surfacing the failure
                    let _ = self.close(reply.file_id).await;
                    return Err(e);
                }
            }
        }

        self.close(reply.file_id).await?;
        Ok(out.freeze())
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        debug!(%path, size = data.len(), "write");
        let reply = self
            .create(
                path,
                FILE_WRITE_DATA,
                FILE_OVERWRITE_IF,
                FILE_NON_DIRECTORY_FILE,
            )
            .await?;

        let mut written = 0u64;
        for chunk in data.chunks(IO_CHUNK as usize) {
            match self.write_chunk(reply.file_id, written, chunk).await {
                Ok(count) => written += count as u64,
                Err(e) => {
                    let _ = self.close(reply.file_id).await;
                    return Err(e);
                }
            }
        }

        self.close(reply.file_id).await?;
        Ok(written)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        trace!(%path, "list");
        let reply = self
            .create(path, FILE_READ_DATA, FILE_OPEN, FILE_DIRECTORY_FILE)
            .await?;

        let mut entries = Vec::new();
        let mut first = true;
        loop {
            match self.query_directory_page(reply.file_id, first).await {
                Ok(Some(page)) => {
                    if let Err(e) = parse_directory_page(&page, &mut entries) {
                        let _ = self.close(reply.file_id).await;
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = self.close(reply.file_id).await;
                    return Err(e);
                }
            }
            first = false;
        }

        self.close(reply.file_id).await?;
        Ok(entries)
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        debug!(%path, "delete");
        let reply = self
            .create(path, DELETE, FILE_OPEN, FILE_DELETE_ON_CLOSE)
            .await?;
        // the server unlinks when the last handle goes away; a non-empty
        // directory is rejected here
        self.close(reply.file_id).await
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        debug!(%path, "mkdir");
        let reply = self
            .create(
                path,
                FILE_READ_ATTRIBUTES,
                FILE_CREATE,
                FILE_DIRECTORY_FILE,
            )
            .await?;
        self.close(reply.file_id).await
    }
}
