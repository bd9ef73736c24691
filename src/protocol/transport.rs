use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    time::Duration,
};

use log::trace;
use thiserror::Error;

use super::{
    Command, Reply, TlsStream,
    codec::{
        self, CodecError, DEFAULT_MAX_COMMAND_SIZE, FrameBuffer, command_from_frame,
        reply_from_frame,
    },
};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    Closed,
}

impl TransportError {
    /// True when a read or write gave up because the stream's timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Io(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

/// A duplex byte stream that can be split into independently owned halves.
///
/// TLS or other wrappers plug in here; the protocol layer only needs bytes.
pub trait Stream: Read + Write + Send + Sized + 'static {
    fn try_clone(&self) -> io::Result<Self>;

    /// Closes both directions, waking any thread blocked on a read.
    fn shutdown(&self) -> io::Result<()>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bounds every later write; clones share the setting with the original.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl Stream for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }
}

/// A TCP socket, optionally wrapped in TLS.
#[derive(Debug)]
pub enum NetworkStream {
    Plain(TcpStream),
    Tls(TlsStream),
}

impl Read for NetworkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Plain(stream) => stream.read(buf),
            NetworkStream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for NetworkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Plain(stream) => stream.write(buf),
            NetworkStream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetworkStream::Plain(stream) => stream.flush(),
            NetworkStream::Tls(stream) => stream.flush(),
        }
    }
}

impl Stream for NetworkStream {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            NetworkStream::Plain(stream) => NetworkStream::Plain(Stream::try_clone(stream)?),
            NetworkStream::Tls(stream) => NetworkStream::Tls(stream.try_clone()?),
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            NetworkStream::Plain(stream) => Stream::shutdown(stream),
            NetworkStream::Tls(stream) => stream.shutdown(),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            NetworkStream::Plain(stream) => Stream::set_read_timeout(stream, timeout),
            NetworkStream::Tls(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            NetworkStream::Plain(stream) => Stream::set_write_timeout(stream, timeout),
            NetworkStream::Tls(stream) => stream.set_write_timeout(timeout),
        }
    }
}

/// Sends and receives whole frames over a byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    buffer: FrameBuffer,
    max_command_size: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self::with_command_limit(stream, DEFAULT_MAX_COMMAND_SIZE)
    }

    pub fn with_command_limit(stream: T, max_command_size: usize) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            max_command_size,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_command(&mut self, command: &Command) -> Result<(), TransportError> {
        let frame = codec::encode_command(command, self.max_command_size)?;
        self.stream.write_all(&frame.to_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_reply(&mut self, reply: &Reply) -> Result<(), TransportError> {
        let frame = codec::encode_reply(reply)?;
        self.stream.write_all(&frame.to_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let frame = self.read_frame()?;
        Ok(reply_from_frame(&frame)?)
    }

    pub fn read_command(&mut self) -> Result<Command, TransportError> {
        let frame = self.read_frame()?;
        Ok(command_from_frame(&frame)?)
    }

    fn read_frame(&mut self) -> Result<codec::Frame, TransportError> {
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                trace!("read {:?} frame #{}", frame.kind, frame.id);
                return Ok(frame);
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.buffer.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use crate::protocol::Response;

    use super::*;

    #[test]
    fn read_write_command() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        let command = Command::query(1, "SELECT * FROM users;");
        transport.write_command(&command).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let read = transport.read_command().unwrap();
        assert_eq!(read, command);
    }

    #[test]
    fn read_write_reply() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        let reply = Reply::new(5, Response::Acknowledgement { affected: 1 });
        transport.write_reply(&reply).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let read = transport.read_reply().unwrap();
        assert_eq!(read, reply);
    }

    #[test]
    fn reads_consecutive_frames() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        for id in 1..=3 {
            transport.write_command(&Command::query(id, "USE store;")).unwrap();
        }
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        for id in 1..=3 {
            assert_eq!(transport.read_command().unwrap().id, id);
        }
        assert!(matches!(
            transport.read_command(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn command_limit_is_enforced_before_writing() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::with_command_limit(stream, 4);

        let err = transport
            .write_command(&Command::query(1, "SELECT"))
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Codec(CodecError::SizeLimitExceeded { .. })
        ));
        assert!(transport.get_ref().get_ref().is_empty());
    }

    #[test]
    fn truncated_stream_reports_closed() {
        let bytes = codec::encode_command(&Command::query(1, "SELECT 1;"), 64)
            .unwrap()
            .to_bytes();
        let mut transport = ProtocolTransport::new(Cursor::new(bytes[..7].to_vec()));

        assert!(matches!(
            transport.read_command(),
            Err(TransportError::Closed)
        ));
    }
}
