//! Duplex byte streams to the adapter
//!
//! The transport only needs three primitives: a non-blocking "is there
//! input" check, a read that returns whatever is buffered, and a write.
//! Wi-Fi adapters are reached over TCP, Bluetooth SPP and USB adapters
//! through a serial port.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio_serial::{ClearBuffer, SerialPort};
use tracing::{debug, info};

/// Byte stream connected to an ELM327 adapter
pub trait ElmStream: Send {
    /// Whether at least one byte can be read without blocking
    fn data_available(&mut self) -> io::Result<bool>;

    /// Read buffered bytes; must not block once `data_available` returned `true`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes and flush
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Drop everything waiting in the input buffer
    fn discard_input(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        while self.data_available()? {
            if self.read(&mut buf)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// TCP connection to a Wi-Fi adapter
pub struct TcpElmStream {
    stream: TcpStream,
}

impl TcpElmStream {
    /// Default address of most Wi-Fi ELM327 clones
    pub const DEFAULT_ADDR: &'static str = "192.168.0.10:35000";

    /// Connect to `addr` (e.g. `192.168.0.10:35000`)
    pub fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        let socket_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {addr}"))
        })?;
        info!("Connecting to ELM327 adapter at {}", socket_addr);
        let stream = TcpStream::connect_timeout(&socket_addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Wrap an already connected socket
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl ElmStream for TcpElmStream {
    fn data_available(&mut self) -> io::Result<bool> {
        self.stream.set_nonblocking(true)?;
        let mut peeked = [0u8; 1];
        let result = match self.stream.peek(&mut peeked) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "adapter closed the connection",
            )),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }
}

/// Serial (USB / Bluetooth SPP) connection to an adapter
pub struct SerialElmStream {
    port: Box<dyn SerialPort>,
}

impl SerialElmStream {
    /// Default baud rate of ELM327 clones
    pub const DEFAULT_BAUD_RATE: u32 = 38400;

    /// Open the serial device at `path`
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        info!("Opening ELM327 serial port {} @ {} baud", path, baud_rate);
        let port = tokio_serial::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        Ok(Self { port })
    }
}

impl ElmStream for SerialElmStream {
    fn data_available(&mut self) -> io::Result<bool> {
        Ok(self.port.bytes_to_read()? > 0)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn discard_input(&mut self) -> io::Result<()> {
        debug!("Clearing serial input buffer");
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
