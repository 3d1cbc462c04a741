//! Communication channel and the packet framing layer.
//!
//! Everything GDB sends arrives as frames of the form `$ payload # cc`
//! with a two-digit hex checksum, `}`-escaping for the delimiter bytes
//! and an out-of-band `0x03` interrupt byte. `Connection` turns the raw
//! byte stream into complete payloads and writes framed replies back.

use buffer::Buffer;
use error::Error;
use hex;

use std::io;
use std::io::prelude::*;
use std::mem;

/// How many bytes to request from the transport per blocking read.
const READ_CHUNK: usize = 4096;

/// A communication channel between the stub and a connecting GDB instance.
///
/// This is a bytewise bidirectional transport comparable to `Read + Write`.
/// It is hence implemented automatically for anything that implements both
/// `Read` and `Write` (eg. `TcpStream`).
pub trait Comm {
    /// Error type returned when reading or writing fails.
    type Error: Into<Box<dyn (::std::error::Error) + Send + Sync>>;

    /// Reads some bytes from the connected debugger, blocking until at
    /// least one is available. Returns 0 when the peer closed the
    /// connection.
    fn read_some(&mut self, out: &mut [u8]) -> Result<usize, Self::Error>;

    /// Sends all bytes in `data` to the connected debugger.
    fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error>;
}

impl<T> Comm for T
where
    T: Read + Write,
{
    type Error = io::Error;

    fn read_some(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.read(out)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self, data)
    }
}

/// Writes one complete frame: `ident payload # cc`.
///
/// The delimiter bytes `#`, `$` and `}` are escaped as `}` followed by the
/// byte xored with `0x20`. The checksum covers the escaped wire form, the
/// same bytes the receiving side feeds through its running sum.
pub fn write_frame<C: Comm>(comm: &mut C, ident: u8, payload: &[u8]) -> Result<(), Error> {
    let mut wire = Vec::with_capacity(payload.len() + 4);
    let mut checksum = 0u8;
    wire.push(ident);
    for &byte in payload {
        match byte {
            b'#' | b'$' | b'}' => {
                wire.push(b'}');
                wire.push(byte ^ 0x20);
                checksum = checksum.wrapping_add(b'}').wrapping_add(byte ^ 0x20);
            }
            _ => {
                wire.push(byte);
                checksum = checksum.wrapping_add(byte);
            }
        }
    }
    wire.push(b'#');
    wire.push(hex::encode_nybble(checksum >> 4));
    wire.push(hex::encode_nybble(checksum));
    comm.write_all(&wire).map_err(Error::comm)
}

/// Framer state, advanced one input byte at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitOpen,
    ReadData,
    Escape,
    Cksum0,
    Cksum1,
}

/// One GDB client connection: input framing and response writing.
pub struct Connection<C: Comm> {
    comm: C,
    in_buffer: Buffer,
    message_buffer: Buffer,
    state: State,
    checksum: u8,
    checksum_hex: [u8; 2],
    /// Whether to answer each received frame with `+`/`-`. Starts enabled;
    /// cleared permanently by `QStartNoAckMode`.
    ack_enabled: bool,
    alive: bool,
}

impl<C: Comm> Connection<C> {
    pub fn new(comm: C) -> Self {
        Connection {
            comm,
            in_buffer: Buffer::new(),
            message_buffer: Buffer::new(),
            state: State::WaitOpen,
            checksum: 0,
            checksum_hex: [0; 2],
            ack_enabled: true,
            alive: true,
        }
    }

    /// Whether the peer is still there. Cleared on end-of-stream and on
    /// unrecoverable framing errors.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Marks the connection as failed so the serve loop winds it down.
    pub fn signal_error(&mut self) {
        self.alive = false;
    }

    /// Stops acknowledging received frames. Takes effect for all packets
    /// after the current one; the `+` for the packet that carried the
    /// request has already been sent by the framer.
    pub fn start_no_ack_mode(&mut self) {
        debug!("entering no-ack mode");
        self.ack_enabled = false;
    }

    /// Runs buffered input through the framer.
    ///
    /// Returns the payload of the next complete, checksum-verified packet,
    /// or `None` once the buffered input is exhausted. `interrupted` is
    /// set (never cleared) when an out-of-band `0x03` interrupt byte shows
    /// up between packets.
    pub fn process(&mut self, interrupted: &mut bool) -> Result<Option<Buffer>, Error> {
        while let Some(byte) = self.in_buffer.read_u8() {
            match self.state {
                State::WaitOpen => match byte {
                    b'$' => {
                        self.state = State::ReadData;
                        self.checksum = 0;
                        self.message_buffer.clear();
                    }
                    // Acks for our own responses; there is no
                    // retransmission, so both are ignored.
                    b'+' | b'-' => {}
                    0x03 => {
                        debug!("received interrupt byte");
                        *interrupted = true;
                    }
                    _ => {}
                },
                State::ReadData => match byte {
                    b'#' => self.state = State::Cksum0,
                    b'}' => {
                        self.checksum = self.checksum.wrapping_add(byte);
                        self.state = State::Escape;
                    }
                    _ => {
                        self.checksum = self.checksum.wrapping_add(byte);
                        self.message_buffer.write_u8(byte);
                    }
                },
                State::Escape => {
                    self.checksum = self.checksum.wrapping_add(byte);
                    self.message_buffer.write_u8(byte ^ 0x20);
                    self.state = State::ReadData;
                }
                State::Cksum0 => {
                    self.checksum_hex[0] = byte;
                    self.state = State::Cksum1;
                }
                State::Cksum1 => {
                    self.checksum_hex[1] = byte;
                    self.state = State::WaitOpen;
                    let received = hex::decode_byte(self.checksum_hex[0], self.checksum_hex[1]);
                    if received == self.checksum {
                        if self.ack_enabled {
                            self.comm.write_all(b"+").map_err(Error::comm)?;
                        }
                        let message = mem::replace(&mut self.message_buffer, Buffer::new());
                        trace!("received packet: {}", message.get_string());
                        return Ok(Some(message));
                    } else if self.ack_enabled {
                        warn!(
                            "bad checksum (got {:02x}, computed {:02x}), requesting retransmission",
                            received, self.checksum
                        );
                        self.comm.write_all(b"-").map_err(Error::comm)?;
                    } else {
                        self.signal_error();
                        return Err(Error::Checksum {
                            received,
                            computed: self.checksum,
                        });
                    }
                }
            }
        }
        Ok(None)
    }

    /// Blocks until the transport delivers more input and queues it for
    /// `process`. A zero-length read means the client disconnected.
    pub fn read_input(&mut self) -> Result<(), Error> {
        let read = {
            let space = self.in_buffer.reserve(READ_CHUNK);
            self.comm.read_some(space).map_err(Error::comm)?
        };
        self.in_buffer.mark_written(read);
        if read == 0 {
            info!("client closed the connection");
            self.alive = false;
        }
        Ok(())
    }

    /// Sends the pending bytes of `buffer` as one frame.
    pub fn send(&mut self, buffer: &Buffer, ident: u8) -> Result<(), Error> {
        write_frame(&mut self.comm, ident, buffer.peek())
    }

    /// Sends a response packet (`$` frame).
    pub fn respond(&mut self, buffer: &Buffer) -> Result<(), Error> {
        trace!("responding: {}", buffer.get_string());
        self.send(buffer, b'$')
    }

    /// Sends a notification (`%` frame).
    pub fn notify(&mut self, buffer: &Buffer) -> Result<(), Error> {
        trace!("notifying: {}", buffer.get_string());
        self.send(buffer, b'%')
    }

    /// The empty response, used for anything unsupported.
    pub fn respond_empty(&mut self) -> Result<(), Error> {
        self.respond(&Buffer::new())
    }

    pub fn respond_ok(&mut self) -> Result<(), Error> {
        let mut buf = Buffer::new();
        buf.write(b"OK");
        self.respond(&buf)
    }

    /// Responds `Exx` with an errno-style code.
    pub fn respond_error(&mut self, no: u8) -> Result<(), Error> {
        let mut buf = Buffer::new();
        buf.write_u8(b'E');
        hex::encode_uint(u64::from(no), 1, &mut buf, true);
        self.respond(&buf)
    }

    #[cfg(test)]
    pub(crate) fn comm_mut(&mut self) -> &mut C {
        &mut self.comm
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.in_buffer.write(data);
    }
}
