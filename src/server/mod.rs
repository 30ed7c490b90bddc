//! Multi-session frame server.
//!
//! One accept thread polls a non-blocking listener; every accepted
//! connection gets its own handler thread that reads frames, runs them
//! through the `FrameProcessor` and optionally writes the composited frame
//! back. Handlers block on reads without a timeout, so a peer that stalls
//! mid-frame holds its handler until the socket is closed (by the peer or
//! by `stop`).

mod registry;
mod session;

pub use registry::SessionRegistry;
pub use session::{SessionId, SessionInfo, SessionState};

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::config::{validate_port, ServerSettings};
use crate::encode::{FrameProcessor, ProcessedFrame};
use crate::error::{ConfigError, ProtocolError};
use crate::frame::Frame;
use crate::transport::{EncodedFrame, FrameConnection, FrameWriter, PixelEncoding};

const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(50);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives every processed frame, on the session's handler thread.
pub type FrameObserver = Arc<dyn Fn(SessionId, &ProcessedFrame) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub reply: bool,
    pub reply_encoding: PixelEncoding,
    pub accept_poll: Duration,
    pub join_timeout: Duration,
}

impl ServerConfig {
    pub fn new(bind_address: impl Into<String>, port: i64) -> Result<Self, ConfigError> {
        let bind_address = bind_address.into();
        if bind_address.trim().is_empty() {
            return Err(ConfigError::Empty("server address"));
        }
        Ok(Self {
            bind_address,
            port: validate_port(port)?,
            reply: true,
            reply_encoding: PixelEncoding::Raw,
            accept_poll: DEFAULT_ACCEPT_POLL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        })
    }

    /// OS-assigned port; read the real one from `SessionServer::start`.
    pub fn ephemeral(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            port: 0,
            reply: true,
            reply_encoding: PixelEncoding::Raw,
            accept_poll: DEFAULT_ACCEPT_POLL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Result<Self, ConfigError> {
        let mut config = Self::new(settings.address.clone(), settings.port as i64)?;
        config.reply = settings.reply;
        Ok(config)
    }

    pub fn with_reply(mut self, reply: bool) -> Self {
        self.reply = reply;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Listening,
}

/// Everything a handler thread needs, cloned per connection.
#[derive(Clone)]
struct SessionContext {
    config: ServerConfig,
    processor: FrameProcessor,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    observer: Option<FrameObserver>,
    handlers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

pub struct SessionServer {
    context: SessionContext,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SessionServer {
    pub fn new(config: ServerConfig, processor: FrameProcessor) -> Self {
        Self {
            context: SessionContext {
                config,
                processor,
                registry: Arc::new(SessionRegistry::new()),
                running: Arc::new(AtomicBool::new(false)),
                observer: None,
                handlers: Arc::new(Mutex::new(Vec::new())),
            },
            accept_thread: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: FrameObserver) -> Self {
        self.context.observer = Some(observer);
        self
    }

    /// Bind and start accepting. Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        if self.context.running.load(Ordering::SeqCst) {
            return Err(anyhow!("server is already listening"));
        }
        let config = &self.context.config;
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port))
            .with_context(|| format!("bind {}:{}", config.bind_address, config.port))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        self.context.running.store(true, Ordering::SeqCst);
        let context = self.context.clone();
        let spawned = std::thread::Builder::new()
            .name("session-accept".to_string())
            .spawn(move || context.accept_loop(listener));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.context.running.store(false, Ordering::SeqCst);
                return Err(anyhow!("spawn accept thread: {}", err));
            }
        };

        *lock(&self.accept_thread) = Some(handle);
        *lock(&self.local_addr) = Some(addr);
        log::info!("SessionServer: listening on {}", addr);
        Ok(addr)
    }

    /// Stop accepting, close every session, and wait (bounded) for the
    /// accept and handler threads. Idempotent.
    pub fn stop(&self) {
        let was_running = self.context.running.swap(false, Ordering::SeqCst);
        let timeout = self.context.config.join_timeout;

        if let Some(accept) = lock(&self.accept_thread).take() {
            if !crate::join_with_timeout(accept, timeout) {
                log::warn!("SessionServer: accept thread did not exit in time");
            }
        }

        let closed = self.context.registry.close_all();
        let handlers: Vec<JoinHandle<()>> = lock(&self.context.handlers).drain(..).collect();
        let deadline = Instant::now() + timeout;
        for handler in handlers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !crate::join_with_timeout(handler, remaining) {
                log::warn!("SessionServer: session handler did not exit in time");
            }
        }

        lock(&self.local_addr).take();
        if was_running {
            log::info!("SessionServer: stopped ({} session(s) closed)", closed);
        }
    }

    pub fn state(&self) -> ServerState {
        if self.context.running.load(Ordering::SeqCst) {
            ServerState::Listening
        } else {
            ServerState::Stopped
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.context.registry.clone()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.context.registry.sessions()
    }

    pub fn session_count(&self) -> usize {
        self.context.registry.len()
    }

    /// `"listening on 127.0.0.1:8089, 2 sessions"` or `"stopped"`.
    pub fn status(&self) -> String {
        match (self.state(), self.local_addr()) {
            (ServerState::Listening, Some(addr)) => {
                format!("listening on {}, {} sessions", addr, self.session_count())
            }
            _ => "stopped".to_string(),
        }
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SessionContext {
    fn accept_loop(self, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.admit(stream, peer) {
                        log::warn!("SessionServer: rejected {}: {:#}", peer, err);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(self.config.accept_poll);
                }
                Err(err) => {
                    log::warn!("SessionServer: accept failed: {}", err);
                    std::thread::sleep(self.config.accept_poll);
                }
            }
        }
        log::debug!("SessionServer: accept loop exited");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        let connection = FrameConnection::new(stream)?;
        let id = self
            .registry
            .register(connection.control_handle()?, peer);
        log::info!(
            "SessionServer: {} connected from {} ({} active)",
            id,
            peer,
            self.registry.len()
        );

        let context = self.clone();
        let spawned = std::thread::Builder::new()
            .name(id.to_string())
            .spawn(move || context.serve(id, connection));
        match spawned {
            Ok(handle) => {
                let mut handlers = lock(&self.handlers);
                handlers.retain(|handle| !handle.is_finished());
                handlers.push(handle);
                Ok(())
            }
            Err(err) => {
                self.registry.remove(id);
                Err(anyhow!("spawn handler for {}: {}", id, err))
            }
        }
    }

    fn serve(self, id: SessionId, mut connection: FrameConnection) {
        self.registry.set_state(id, SessionState::Connected);
        let writer = connection.writer();

        loop {
            match connection.recv() {
                Ok(Some(payload)) => {
                    self.registry.record_frame(id);
                    if let Err(err) = self.handle_payload(id, &writer, payload) {
                        log::warn!("SessionServer: {} dropped: {}", id, err);
                        break;
                    }
                }
                Ok(None) => {
                    log::info!("SessionServer: {} closed by peer", id);
                    break;
                }
                Err(err) => {
                    if self.running.load(Ordering::SeqCst) {
                        log::warn!("SessionServer: {} protocol error: {}", id, err);
                    } else {
                        log::debug!("SessionServer: {} closed during shutdown: {}", id, err);
                    }
                    break;
                }
            }
        }

        self.registry.set_state(id, SessionState::Closing);
        connection.shutdown();
        self.registry.remove(id);
        log::info!(
            "SessionServer: {} closed ({} active)",
            id,
            self.registry.len()
        );
    }

    /// Process one payload and reply. A frame the processor rejects is
    /// echoed back with no regions and the `unprocessed` flag set, so the
    /// peer's request/reply cadence is kept.
    fn handle_payload(
        &self,
        id: SessionId,
        writer: &FrameWriter,
        payload: EncodedFrame,
    ) -> Result<(), ProtocolError> {
        let frame = payload.decode_frame()?;
        let (reply_frame, regions, processed) = match self.processor.process(&frame) {
            Ok(processed) => {
                log::debug!("SessionServer: {} {}", id, processed.status());
                if let Some(observer) = &self.observer {
                    observer(id, &processed);
                }
                (processed.frame, processed.regions, true)
            }
            Err(err) => {
                log::warn!("SessionServer: {} skipping frame: {}", id, err);
                (frame, Vec::new(), false)
            }
        };

        if self.config.reply {
            self.reply(writer, &reply_frame, &regions, processed)?;
        }
        Ok(())
    }

    fn reply(
        &self,
        writer: &FrameWriter,
        frame: &Frame,
        regions: &[crate::frame::Detection],
        processed: bool,
    ) -> Result<(), ProtocolError> {
        let mut encoded = EncodedFrame::from_frame(frame, regions, self.config.reply_encoding)
            .map_err(|err| ProtocolError::Malformed(format!("{:#}", err)))?;
        if !processed {
            encoded = encoded.mark_unprocessed();
        }
        writer.send(&encoded)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
