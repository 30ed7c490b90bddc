//! Client side of a frame session.
//!
//! A client connects once and never retries on its own; a failed connect
//! or a failed send leaves it `Disconnected` until the caller reconnects.
//!
//! With `expect_reply` off, a drain thread reads and discards whatever the
//! server sends back, so a replying server never stalls on a full socket.

use std::io::{BufReader, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::{validate_port, ClientSettings};
use crate::error::ProtocolError;
use crate::frame::{Detection, Frame};
use crate::transport::{read_frame, EncodedFrame, FrameConnection, PixelEncoding, ReadOutcome};

const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Bound on each reply read.
    pub reply_timeout: Duration,
    pub expect_reply: bool,
    pub encoding: PixelEncoding,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            reply_timeout: Duration::from_secs(2),
            expect_reply: true,
            encoding: PixelEncoding::Raw,
        }
    }
}

impl ClientConfig {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            reply_timeout: settings.reply_timeout,
            expect_reply: settings.expect_reply,
            encoding: PixelEncoding::Raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct SessionClient {
    config: ClientConfig,
    state: ClientState,
    connection: Option<FrameConnection>,
    drain: Option<JoinHandle<()>>,
    peer_closed: Arc<AtomicBool>,
    replies_discarded: Arc<AtomicU64>,
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ClientState::Disconnected,
            connection: None,
            drain: None,
            peer_closed: Arc::new(AtomicBool::new(false)),
            replies_discarded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// One connection attempt. On failure the client stays `Disconnected`
    /// and the error is returned.
    pub fn connect(&mut self, address: &str, port: i64) -> Result<SocketAddr> {
        if self.is_connected() {
            return Err(anyhow!("already {}", self.status()));
        }
        let port = validate_port(port)?;
        self.state = ClientState::Connecting;
        let mut opened = self.open(address, port);
        let drain = match &opened {
            Ok(connection) if !self.config.expect_reply => {
                self.peer_closed.store(false, Ordering::SeqCst);
                Some(self.spawn_drain(connection))
            }
            _ => None,
        };
        match drain {
            Some(Ok(drain)) => self.drain = Some(drain),
            Some(Err(err)) => opened = Err(err),
            None => {}
        }
        match opened {
            Ok(connection) => {
                let peer = connection.peer();
                self.connection = Some(connection);
                self.state = ClientState::Connected;
                log::info!("SessionClient: connected to {}", peer);
                Ok(peer)
            }
            Err(err) => {
                self.state = ClientState::Disconnected;
                log::warn!("SessionClient: connect to {}:{} failed: {:#}", address, port, err);
                Err(err)
            }
        }
    }

    fn open(&self, address: &str, port: u16) -> Result<FrameConnection> {
        let candidates: Vec<SocketAddr> = (address, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", address, port))?
            .collect();
        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.config.connect_timeout) {
                Ok(stream) => {
                    let connection = FrameConnection::new(stream)?;
                    if self.config.expect_reply {
                        connection.set_read_timeout(Some(self.config.reply_timeout))?;
                    }
                    return Ok(connection);
                }
                Err(err) => last_error = Some(err),
            }
        }
        match last_error {
            Some(err) => Err(anyhow!(err).context(format!("connect {}:{}", address, port))),
            None => Err(anyhow!("{}:{} resolved to no addresses", address, port)),
        }
    }

    /// Reads and discards replies until the socket closes.
    fn spawn_drain(&self, connection: &FrameConnection) -> Result<JoinHandle<()>> {
        let mut reader = BufReader::new(connection.control_handle()?);
        let peer = connection.peer();
        let peer_closed = self.peer_closed.clone();
        let discarded = self.replies_discarded.clone();
        std::thread::Builder::new()
            .name("session-drain".to_string())
            .spawn(move || {
                loop {
                    match read_frame(&mut reader) {
                        Ok(ReadOutcome::Frame(_)) => {
                            discarded.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(ReadOutcome::Closed) => break,
                        Err(err) => {
                            log::debug!("SessionClient: drain from {} ended: {}", peer, err);
                            break;
                        }
                    }
                }
                peer_closed.store(true, Ordering::SeqCst);
            })
            .context("spawn reply drain")
    }

    /// Replies read and dropped in fire-and-forget mode.
    pub fn replies_discarded(&self) -> u64 {
        self.replies_discarded.load(Ordering::Relaxed)
    }

    /// Send one payload. A failure disconnects.
    pub fn send(&mut self, frame: &EncodedFrame) -> Result<(), ProtocolError> {
        if self.connection.is_some() && self.peer_closed.load(Ordering::SeqCst) {
            log::info!("SessionClient: server closed the session");
            self.drop_connection();
            return Err(not_connected());
        }
        let connection = self.connection.as_ref().ok_or_else(not_connected)?;
        if let Err(err) = connection.send(frame) {
            log::warn!("SessionClient: send failed: {}", err);
            self.drop_connection();
            return Err(err);
        }
        Ok(())
    }

    /// Encode with the configured pixel encoding and send.
    pub fn send_frame(&mut self, frame: &Frame, regions: &[Detection]) -> Result<()> {
        let encoded = EncodedFrame::from_frame(frame, regions, self.config.encoding)?;
        self.send(&encoded)?;
        Ok(())
    }

    /// Send, then read the reply within `reply_timeout` when replies are
    /// expected. A reply timeout, protocol error, or server close disconnects.
    pub fn exchange(&mut self, frame: &EncodedFrame) -> Result<Option<EncodedFrame>, ProtocolError> {
        self.send(frame)?;
        if !self.config.expect_reply {
            return Ok(None);
        }
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;
        match connection.recv() {
            Ok(Some(reply)) => Ok(Some(reply)),
            Ok(None) => {
                log::info!("SessionClient: server closed the session");
                self.drop_connection();
                Ok(None)
            }
            Err(err) => {
                log::warn!("SessionClient: reply failed: {}", err);
                self.drop_connection();
                Err(err)
            }
        }
    }

    /// Idempotent.
    pub fn disconnect(&mut self) {
        if self.connection.is_some() {
            log::info!("SessionClient: disconnecting");
        }
        self.drop_connection();
    }

    fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        if let Some(drain) = self.drain.take() {
            if !crate::join_with_timeout(drain, DRAIN_JOIN_TIMEOUT) {
                log::warn!("SessionClient: reply drain did not exit in time");
            }
        }
        self.state = ClientState::Disconnected;
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(FrameConnection::peer)
    }

    /// `"connected: 127.0.0.1:8089"` or `"disconnected"`.
    pub fn status(&self) -> String {
        match (self.state, self.peer()) {
            (ClientState::Connected, Some(peer)) => format!("connected: {}", peer),
            (ClientState::Connecting, _) => "connecting".to_string(),
            _ => "disconnected".to_string(),
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

fn not_connected() -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(
        ErrorKind::NotConnected,
        "session client is not connected",
    ))
}
