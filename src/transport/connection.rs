use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ProtocolError;

use super::payload::EncodedFrame;
use super::wire::{self, ReadOutcome};

/// Cloneable write half. Each frame goes out under the lock, so frames from
/// concurrent producers never interleave.
#[derive(Clone)]
pub struct FrameWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl FrameWriter {
    pub fn write_frame(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut stream = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        wire::write_frame(&mut *stream, payload)
    }

    pub fn send(&self, frame: &EncodedFrame) -> Result<(), ProtocolError> {
        self.write_frame(&frame.to_bytes()?)
    }
}

/// A framed TCP connection.
pub struct FrameConnection {
    reader: BufReader<TcpStream>,
    writer: FrameWriter,
    control: TcpStream,
    peer: SocketAddr,
}

impl FrameConnection {
    pub fn new(stream: TcpStream) -> Result<Self, ProtocolError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer: FrameWriter {
                stream: Arc::new(Mutex::new(writer)),
            },
            control,
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn writer(&self) -> FrameWriter {
        self.writer.clone()
    }

    /// Independent handle to the socket, used to shut it down from another
    /// thread.
    pub fn control_handle(&self) -> Result<TcpStream, ProtocolError> {
        Ok(self.control.try_clone()?)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ProtocolError> {
        self.control.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn read_frame(&mut self) -> Result<ReadOutcome, ProtocolError> {
        wire::read_frame(&mut self.reader)
    }

    /// Next payload, or `None` on graceful close.
    pub fn recv(&mut self) -> Result<Option<EncodedFrame>, ProtocolError> {
        match self.read_frame()? {
            ReadOutcome::Frame(bytes) => EncodedFrame::from_bytes(&bytes).map(Some),
            ReadOutcome::Closed => Ok(None),
        }
    }

    pub fn write_frame(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_frame(payload)
    }

    pub fn send(&self, frame: &EncodedFrame) -> Result<(), ProtocolError> {
        self.writer.send(frame)
    }

    /// Close both directions. Errors from an already-closed socket are ignored.
    pub fn shutdown(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }
}
