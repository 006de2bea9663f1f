// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory collaborators for host tests.
//!
//! Handles are cheap clones sharing their state, so a test can hand one to the
//! code under test and keep another to inspect what happened.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

use crate::{
    AttStatus, CharacteristicWrite, ConnectError, Connection, ErrorType, FileError, FileResult,
    FileStore, ProvisioningLink, Read, Reset, TlsConnector, TlsError, TlsSession, WifiControl,
    Write,
};

/// Code reported when a scripted failure kills the connection.
pub const CONN_RESET: i32 = -0x50;

#[derive(Debug, Clone, Default)]
pub struct MemFiles {
    files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
}

impl MemFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, contents: &str) {
        self.files
            .borrow_mut()
            .insert(path.to_string(), contents.as_bytes().to_vec());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files
            .borrow()
            .get(path)
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    pub fn remove(&self, path: &str) {
        self.files.borrow_mut().remove(path);
    }
}

impl FileStore for MemFiles {
    fn read(&mut self, path: &str, buf: &mut [u8]) -> FileResult<usize> {
        let files = self.files.borrow();
        let data = files.get(path).ok_or(FileError::NotFound)?;
        if data.len() > buf.len() {
            return Err(FileError::TooLarge);
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> FileResult<()> {
        self.files
            .borrow_mut()
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

/// Behaviour of the scripted HTTPS server.
#[derive(Debug, Clone, Default)]
pub struct TlsScript {
    /// Served for every path
    pub image: Vec<u8>,
    pub omit_content_length: bool,
    /// Reported as the certificate verification result of each handshake
    pub verify_flags: u32,
    /// Largest number of bytes handed out per read, zero for unlimited
    pub record_size: usize,
    /// Answer every other read with `WantRead` first
    pub interleave_want_read: bool,
    /// Range start -> number of GETs at that start that die halfway through the body
    pub get_failures: HashMap<u32, u32>,
    /// Bytes withheld from the final chunk before the server sends close_notify
    pub truncate_final: usize,
    /// Number of connection attempts to refuse
    pub refuse_connects: u32,
    /// Answer every GET with `200 OK` and the whole image
    pub ignore_range: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TlsLog {
    pub connects: u32,
    pub closes: u32,
    pub requests: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MockTls {
    script: Rc<RefCell<TlsScript>>,
    log: Rc<RefCell<TlsLog>>,
}

impl MockTls {
    pub fn new(script: TlsScript) -> Self {
        Self {
            script: Rc::new(RefCell::new(script)),
            log: Rc::new(RefCell::new(TlsLog::default())),
        }
    }

    /// Changes the server behaviour for the connections that follow.
    pub fn script_mut(&self, f: impl FnOnce(&mut TlsScript)) {
        f(&mut self.script.borrow_mut());
    }

    pub fn log(&self) -> TlsLog {
        self.log.borrow().clone()
    }

    /// Requests whose first line starts with `method`.
    pub fn requests(&self, method: &str) -> Vec<String> {
        self.log
            .borrow()
            .requests
            .iter()
            .filter(|r| r.starts_with(method))
            .cloned()
            .collect()
    }
}

impl TlsConnector for MockTls {
    type Session = MockSession;

    async fn connect(
        &mut self,
        host: &str,
        port: &str,
        _ca_pem: &[u8],
    ) -> Result<Connection<MockSession>, ConnectError> {
        let mut script = self.script.borrow_mut();
        if script.refuse_connects > 0 {
            script.refuse_connects -= 1;
            return Err(ConnectError::Tcp(CONN_RESET));
        }
        debug!("mock: connect {}:{}", host, port);
        self.log.borrow_mut().connects += 1;
        Ok(Connection {
            session: MockSession {
                script: self.script.clone(),
                log: self.log.clone(),
                inbound: Vec::new(),
                outbound: VecDeque::new(),
                want_read_pending: false,
            },
            verify_flags: script.verify_flags,
        })
    }
}

#[derive(Debug)]
enum Reply {
    Data(Vec<u8>),
    Fail(TlsError),
}

#[derive(Debug)]
pub struct MockSession {
    script: Rc<RefCell<TlsScript>>,
    log: Rc<RefCell<TlsLog>>,
    inbound: Vec<u8>,
    outbound: VecDeque<Reply>,
    want_read_pending: bool,
}

impl MockSession {
    fn handle_request(&mut self, request: &str) {
        self.log.borrow_mut().requests.push(request.to_string());

        let mut lines = request.split("\r\n");
        let first = lines.next().unwrap_or_default();
        let mut range = None;
        let mut close = false;
        for line in lines {
            if let Some(r) = line.strip_prefix("Range: bytes=") {
                let (a, b) = r.split_once('-').unwrap_or((r, ""));
                range = Some((a.parse::<u32>().unwrap_or(0), b.parse::<u32>().ok()));
            }
            if line.eq_ignore_ascii_case("connection: close") {
                close = true;
            }
        }

        let mut script = self.script.borrow_mut();
        let total = script.image.len() as u32;

        if first.starts_with("HEAD ") {
            let mut head =
                String::from("HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n");
            if !script.omit_content_length {
                head.push_str(&format!("Content-Length: {}\r\n", total));
            }
            head.push_str("Connection: keep-alive\r\n\r\n");
            self.outbound.push_back(Reply::Data(head.into_bytes()));
            return;
        }

        if script.ignore_range {
            let mut reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                total
            )
            .into_bytes();
            reply.extend_from_slice(&script.image);
            self.outbound.push_back(Reply::Data(reply));
            if close {
                self.outbound.push_back(Reply::Fail(TlsError::PeerCloseNotify));
            }
            return;
        }

        let (start, end) = match range {
            Some((a, Some(b))) => (a, b.min(total.saturating_sub(1))),
            Some((a, None)) => (a, total.saturating_sub(1)),
            None => (0, total.saturating_sub(1)),
        };
        let body = script
            .image
            .get(start as usize..=end as usize)
            .unwrap_or_default()
            .to_vec();
        let mut reply = format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\n\r\n",
            start,
            end,
            total,
            body.len()
        )
        .into_bytes();

        if let Some(left) = script.get_failures.get_mut(&start).filter(|n| **n > 0) {
            *left -= 1;
            reply.extend_from_slice(&body[..body.len() / 2]);
            self.outbound.push_back(Reply::Data(reply));
            self.outbound.push_back(Reply::Fail(TlsError::Io(CONN_RESET)));
            return;
        }

        if end + 1 == total && script.truncate_final > 0 {
            let keep = body.len().saturating_sub(script.truncate_final);
            reply.extend_from_slice(&body[..keep]);
            self.outbound.push_back(Reply::Data(reply));
            self.outbound.push_back(Reply::Fail(TlsError::PeerCloseNotify));
            return;
        }

        reply.extend_from_slice(&body);
        self.outbound.push_back(Reply::Data(reply));
        if close {
            self.outbound.push_back(Reply::Fail(TlsError::PeerCloseNotify));
        }
    }
}

impl ErrorType for MockSession {
    type Error = TlsError;
}

impl Read for MockSession {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        let (interleave, record_size) = {
            let script = self.script.borrow();
            (script.interleave_want_read, script.record_size)
        };
        if interleave {
            self.want_read_pending = !self.want_read_pending;
            if self.want_read_pending {
                return Err(TlsError::WantRead);
            }
        }

        match self.outbound.pop_front() {
            Some(Reply::Data(mut data)) => {
                let mut n = data.len().min(buf.len());
                if record_size > 0 {
                    n = n.min(record_size);
                }
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.outbound.push_front(Reply::Data(data.split_off(n)));
                }
                Ok(n)
            }
            Some(Reply::Fail(e)) => {
                // The connection stays dead
                self.outbound.push_front(Reply::Fail(e));
                Err(e)
            }
            None => Err(TlsError::PeerCloseNotify),
        }
    }
}

impl Write for MockSession {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        self.inbound.extend_from_slice(buf);
        while let Some(pos) = self.inbound.windows(4).position(|w| w == b"\r\n\r\n") {
            let request: Vec<u8> = self.inbound.drain(..pos + 4).collect();
            let request = String::from_utf8_lossy(&request).into_owned();
            self.handle_request(&request);
        }
        Ok(buf.len())
    }
}

impl TlsSession for MockSession {
    async fn close(&mut self) {
        self.log.borrow_mut().closes += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiCall {
    AddNetwork { ssid: String, passphrase: String },
    AutoConnect(bool),
}

#[derive(Debug, Clone, Default)]
pub struct MockWifi {
    calls: Rc<RefCell<Vec<WifiCall>>>,
}

impl MockWifi {
    pub fn calls(&self) -> Vec<WifiCall> {
        self.calls.borrow().clone()
    }
}

impl WifiControl for MockWifi {
    type Error = Infallible;

    fn add_network(&mut self, ssid: &str, passphrase: &str) -> Result<(), Infallible> {
        self.calls.borrow_mut().push(WifiCall::AddNetwork {
            ssid: ssid.to_string(),
            passphrase: passphrase.to_string(),
        });
        Ok(())
    }

    fn set_auto_connect(&mut self, enabled: bool) -> Result<(), Infallible> {
        self.calls.borrow_mut().push(WifiCall::AutoConnect(enabled));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BleState {
    started: Option<Vec<u16>>,
    pending: VecDeque<CharacteristicWrite>,
    responses: Vec<(u16, AttStatus)>,
    current: Option<u16>,
}

/// GATT server replaying a fixed list of client writes.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBle {
    state: Rc<RefCell<BleState>>,
}

impl ScriptedBle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_write(&self, uuid: u16, offset: u16, data: &[u8]) {
        let mut value = heapless::Vec::new();
        let n = data.len().min(value.capacity());
        // Cannot fail, n is within capacity
        let _ = value.extend_from_slice(&data[..n]);
        self.state.borrow_mut().pending.push_back(CharacteristicWrite {
            uuid,
            offset,
            data: value,
        });
    }

    pub fn registered(&self) -> Option<Vec<u16>> {
        self.state.borrow().started.clone()
    }

    pub fn responses(&self) -> Vec<(u16, AttStatus)> {
        self.state.borrow().responses.clone()
    }
}

impl ProvisioningLink for ScriptedBle {
    type Error = Infallible;

    fn start(&mut self, _service: &[u8; 16], characteristics: &[u16]) -> Result<(), Infallible> {
        self.state.borrow_mut().started = Some(characteristics.to_vec());
        Ok(())
    }

    async fn next_write(&mut self) -> CharacteristicWrite {
        let next = {
            let mut state = self.state.borrow_mut();
            let next = state.pending.pop_front();
            state.current = next.as_ref().map(|w| w.uuid);
            next
        };
        match next {
            Some(write) => write,
            None => std::future::pending().await,
        }
    }

    fn respond(&mut self, status: AttStatus) {
        let mut state = self.state.borrow_mut();
        let uuid = state.current.take().unwrap_or_default();
        state.responses.push((uuid, status));
    }
}

/// Reset that unwinds instead of rebooting.
#[derive(Debug, Default)]
pub struct PanicReset;

impl Reset for PanicReset {
    fn reset_device(&mut self) -> ! {
        panic!("device reset");
    }
}
