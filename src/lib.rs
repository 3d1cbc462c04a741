//! A GDB debugging server for a Game Boy emulator, speaking the GDB
//! remote serial protocol (RSP) over TCP.
//!
//! The emulator hands its CPU to a [`Debugger`] and calls
//! [`Debugger::check_breakpoints`] followed by
//! [`Debugger::wait_while_halted`] on every instruction boundary. The
//! [`GdbStub`] listens for a GDB client, translates the protocol into
//! debugger operations (breakpoints, stepping, register and memory
//! access) and parks the emulator whenever the client should be in
//! control.
//!
//! Does not retransmit its own responses on `-`; use a reliable
//! transport such as TCP.
//!
//! [`Debugger`]: struct.Debugger.html
//! [`Debugger::check_breakpoints`]: struct.Debugger.html#method.check_breakpoints
//! [`Debugger::wait_while_halted`]: struct.Debugger.html#method.wait_while_halted
//! [`GdbStub`]: struct.GdbStub.html

#[macro_use]
extern crate log;
extern crate byteorder;

mod buffer;
mod comm;
mod debugger;
mod error;
mod hex;
mod stop;
pub mod targets;

pub use buffer::Buffer;
pub use comm::{Comm, Connection};
pub use debugger::{Breakpoint, Debugger};
pub use error::Error;
pub use stop::{StopReason, StopType};
pub use targets::Cpu;

use std::cmp;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Default listen address for the acceptor.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
/// Default listen port for the acceptor.
pub const DEFAULT_PORT: u16 = 55555;

/// Largest packet we advertise and the cap on response payloads.
const PACKET_SIZE: usize = 8192;

type Handler<C, S> = fn(&mut GdbStub<C, S>, &mut Buffer) -> Result<(), Error>;

/// A `q`/`Q` query handler. The name is matched by longest prefix while
/// scanning the packet; `separator` is the byte that ends the name on
/// the wire (queries without arguments end at the packet boundary
/// instead).
struct Query<C: Cpu, S: Comm> {
    name: &'static str,
    separator: u8,
    visitor: Handler<C, S>,
}

/// A qXfer special object. Objects without a write hook report EROFS.
struct XferObject<C: Cpu, S: Comm> {
    name: &'static str,
    read: fn(&mut GdbStub<C, S>, &str, usize, usize) -> Result<(), Error>,
    write: Option<fn(&mut GdbStub<C, S>, &str, usize, &mut Buffer) -> Result<(), Error>>,
    advertise_read: bool,
    advertise_write: bool,
}

/// The protocol engine: accepts one GDB client at a time and dispatches
/// its commands against the [`Debugger`].
///
/// [`Debugger`]: struct.Debugger.html
pub struct GdbStub<C: Cpu, S: Comm = TcpStream> {
    debugger: Arc<Debugger<C>>,
    address: String,
    port: u16,

    features: Vec<String>,
    gettable_queries: Vec<Query<C, S>>,
    settable_queries: Vec<Query<C, S>>,
    multiletter_handlers: Vec<(&'static str, Handler<C, S>)>,
    xfer_objects: Vec<XferObject<C, S>>,

    multiprocess_enabled: bool,
    thread_events_enabled: bool,
    sent_thread_info: bool,
    /// Set by `vCont`; the next halt owes the client a stop reply.
    waiting_for_stop: Arc<AtomicBool>,

    connection: Option<Connection<S>>,
}

impl<C: Cpu, S: Comm> GdbStub<C, S> {
    /// Creates a stub bound to the default address and port.
    pub fn new(debugger: Arc<Debugger<C>>) -> Self {
        GdbStub::with_address(debugger, DEFAULT_ADDRESS, DEFAULT_PORT)
    }

    /// Creates a stub that will listen on `address:port`.
    pub fn with_address(debugger: Arc<Debugger<C>>, address: &str, port: u16) -> Self {
        let mut stub = GdbStub {
            debugger,
            address: address.to_owned(),
            port,
            features: Vec::new(),
            gettable_queries: Vec::new(),
            settable_queries: Vec::new(),
            multiletter_handlers: Vec::new(),
            xfer_objects: Vec::new(),
            multiprocess_enabled: false,
            thread_events_enabled: false,
            sent_thread_info: false,
            waiting_for_stop: Arc::new(AtomicBool::new(false)),
            connection: None,
        };
        stub.register_handlers();
        stub
    }

    fn register_handlers(&mut self) {
        self.add_feature(format!("PacketSize={}", PACKET_SIZE));
        self.add_feature("swbreak+".to_owned());

        self.add_gettable_query("Supported", b':', Self::query_supported);
        self.add_gettable_query("C", b':', Self::query_current_thread);
        self.add_gettable_query("fThreadInfo", b':', Self::query_f_thread_info);
        self.add_gettable_query("sThreadInfo", b':', Self::query_s_thread_info);
        self.add_gettable_query("ThreadExtraInfo", b',', Self::query_thread_extra_info);
        self.add_gettable_query("TStatus", b':', Self::query_t_status);
        self.add_gettable_query("Offsets", b':', Self::query_offsets);
        self.add_gettable_query("Rcmd", b',', Self::query_remote_command);
        self.add_gettable_query("Xfer", b':', Self::query_xfer);

        self.add_settable_query("StartNoAckMode", b':', Self::query_start_no_ack_mode);
        self.add_settable_query("ThreadEvents", b':', Self::query_thread_events);

        self.add_multiletter_handler("Attach", Self::handle_v_attach);
        self.add_multiletter_handler("Cont?", Self::handle_v_cont_query);
        self.add_multiletter_handler("Cont", Self::handle_v_cont);
        self.add_multiletter_handler("Stopped", Self::handle_v_stopped);

        self.add_xfer_object(XferObject {
            name: "features",
            read: Self::xfer_features_read,
            write: None,
            advertise_read: true,
            advertise_write: false,
        });
        self.add_xfer_object(XferObject {
            name: "libraries",
            read: Self::xfer_libraries_read,
            write: None,
            advertise_read: true,
            advertise_write: false,
        });
    }

    fn add_feature(&mut self, feature: String) {
        self.features.push(feature);
    }

    fn add_gettable_query(&mut self, name: &'static str, separator: u8, visitor: Handler<C, S>) {
        self.features.push(format!("q{}+", name));
        self.gettable_queries.push(Query {
            name,
            separator,
            visitor,
        });
    }

    fn add_settable_query(&mut self, name: &'static str, separator: u8, visitor: Handler<C, S>) {
        self.features.push(format!("Q{}+", name));
        self.settable_queries.push(Query {
            name,
            separator,
            visitor,
        });
    }

    fn add_multiletter_handler(&mut self, name: &'static str, handler: Handler<C, S>) {
        self.multiletter_handlers.push((name, handler));
    }

    fn add_xfer_object(&mut self, object: XferObject<C, S>) {
        if object.advertise_read {
            self.features.push(format!("qXfer:{}:read+", object.name));
        }
        if object.advertise_write {
            self.features.push(format!("qXfer:{}:write+", object.name));
        }
        self.xfer_objects.push(object);
    }

    // Response plumbing. The connection is absent only between clients,
    // when no handler runs; responding into the void is a no-op.

    fn respond(&mut self, buffer: &Buffer) -> Result<(), Error> {
        match self.connection.as_mut() {
            Some(conn) => conn.respond(buffer),
            None => Ok(()),
        }
    }

    fn respond_empty(&mut self) -> Result<(), Error> {
        self.respond(&Buffer::new())
    }

    fn respond_ok(&mut self) -> Result<(), Error> {
        match self.connection.as_mut() {
            Some(conn) => conn.respond_ok(),
            None => Ok(()),
        }
    }

    fn respond_error(&mut self, no: u8) -> Result<(), Error> {
        match self.connection.as_mut() {
            Some(conn) => conn.respond_error(no),
            None => Ok(()),
        }
    }

    /// Parses and answers all packets currently buffered on the
    /// connection, then handles a pending interrupt or stop reply.
    fn poll_connection(&mut self) -> Result<(), Error> {
        let mut interrupted = false;
        loop {
            let packet = match self.connection.as_mut() {
                Some(conn) => conn.process(&mut interrupted)?,
                None => return Ok(()),
            };
            match packet {
                Some(mut packet) => self.handle_packet(&mut packet)?,
                None => break,
            }
        }

        if interrupted {
            debug!("client interrupt, halting");
            self.debugger.halt(StopReason::breakpoint());
        }

        // A halt that the hook could not report (or that predates the
        // resume request) still owes the client its stop reply.
        if self.waiting_for_stop.load(Ordering::SeqCst) && self.debugger.stop_reason().is_some() {
            self.waiting_for_stop.store(false, Ordering::SeqCst);
            self.handle_get_stop_reason()?;
        }

        Ok(())
    }

    /// One round of the per-client serve loop: drain buffered packets,
    /// then block for more input.
    fn connection_loop(&mut self) -> Result<(), Error> {
        self.poll_connection()?;
        if let Some(conn) = self.connection.as_mut() {
            conn.read_input()?;
        }
        Ok(())
    }

    /// Dispatches one packet by its leading command byte.
    fn handle_packet(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let ident = match packet.read_u8() {
            Some(byte) => byte,
            None => {
                warn!("dropping zero-length packet");
                if let Some(conn) = self.connection.as_mut() {
                    conn.signal_error();
                }
                return Ok(());
            }
        };

        match ident {
            // extended mode
            b'!' => self.respond_ok(),
            b'?' => self.handle_get_stop_reason(),
            b'D' => self.handle_detach(packet),
            b'g' => self.handle_read_registers(),
            b'G' => self.handle_write_registers(packet),
            b'H' => self.handle_set_current_thread(packet),
            b'm' => self.handle_read_memory(packet),
            b'M' => self.handle_write_memory(packet),
            b'q' => self.handle_get_query(packet),
            b'Q' => self.handle_set_query(packet),
            b'T' => self.handle_is_thread_alive(packet),
            b'v' => self.handle_multiletter(packet),
            b'Z' => self.handle_breakpoint(packet, false),
            b'z' => self.handle_breakpoint(packet, true),
            other => {
                info!(
                    "unrecognized packet: {} (rest: {})",
                    other as char,
                    packet.get_string()
                );
                self.respond_empty()
            }
        }
    }

    // Single-letter packets.

    fn handle_get_stop_reason(&mut self) -> Result<(), Error> {
        match self.debugger.stop_reason() {
            Some(reason) => {
                let mut response = Buffer::new();
                reason.encode(&mut response);
                self.respond(&response)
            }
            None => self.respond_ok(),
        }
    }

    fn handle_detach(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        // Keep the connection; GDB closes the socket when it is done.
        self.respond_ok()
    }

    fn handle_read_registers(&mut self) -> Result<(), Error> {
        let mut response = Buffer::with_limit(PACKET_SIZE);
        self.debugger.encode_registers(&mut response);
        self.respond(&response)
    }

    fn handle_write_registers(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        // Register writes are accepted but not applied. Answering OK
        // keeps GDB from treating the target as wedged.
        self.respond_ok()
    }

    fn handle_set_current_thread(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        if packet.read_available() < 2 {
            warn!("invalid H packet");
            return self.respond_error(1);
        }
        // Any (op, thread) pair is accepted; there is only one thread.
        let _op = packet.read_u8();
        let (_pid, _thread_id) = read_thread_id(packet);
        self.respond_ok()
    }

    fn handle_read_memory(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let address = hex::decode_uint_until(b',', packet);
        let length = hex::decode_uint(packet);

        let mut response = Buffer::with_limit(PACKET_SIZE);
        self.debugger.encode_memory(&mut response, address, length);
        self.respond(&response)
    }

    fn handle_write_memory(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let address = hex::decode_uint_until(b',', packet);
        let length = hex::decode_uint_until(b':', packet);
        self.debugger.write_memory(address, length, packet);
        self.respond_ok()
    }

    fn handle_is_thread_alive(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        self.respond_ok()
    }

    fn handle_breakpoint(&mut self, packet: &mut Buffer, remove: bool) -> Result<(), Error> {
        let bp_type = hex::decode_uint_until(b',', packet);
        let address = hex::decode_uint_until(b',', packet);
        let kind = hex::decode_uint_until(b';', packet);
        debug!(
            "{} breakpoint type {} at {:#06x} (kind {})",
            if remove { "removing" } else { "inserting" },
            bp_type,
            address,
            kind
        );

        if remove {
            self.debugger.remove_breakpoints(address as u32);
        } else {
            self.debugger.add_breakpoint(Breakpoint::new(address as u32));
        }
        self.respond_ok()
    }

    // Query dispatch.

    /// Scans `packet` for the longest registered query name. A lookup
    /// hit ends at that entry's separator byte (consumed) or at the end
    /// of the packet, which disambiguates names that prefix each other.
    fn resolve_query(table: &[Query<C, S>], packet: &mut Buffer) -> (Option<usize>, String) {
        let mut name = Vec::new();
        let mut hit = None;
        while let Some(ch) = packet.read_u8() {
            if let Some(idx) = hit {
                let query: &Query<C, S> = &table[idx];
                if ch == query.separator {
                    return (hit, String::from_utf8_lossy(&name).into_owned());
                }
            }
            name.push(ch);
            hit = table.iter().position(|q| q.name.as_bytes() == &name[..]);
        }
        (hit, String::from_utf8_lossy(&name).into_owned())
    }

    fn handle_get_query(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let (hit, name) = Self::resolve_query(&self.gettable_queries, packet);
        debug!("got get query for {}", name);
        match hit {
            Some(idx) => {
                let visitor = self.gettable_queries[idx].visitor;
                visitor(self, packet)
            }
            None => {
                info!("unsupported query: {}", name);
                self.respond_empty()
            }
        }
    }

    fn handle_set_query(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let (hit, name) = Self::resolve_query(&self.settable_queries, packet);
        debug!("got set query for {}", name);
        match hit {
            Some(idx) => {
                let visitor = self.settable_queries[idx].visitor;
                visitor(self, packet)
            }
            None => {
                info!("unsupported query: {}", name);
                self.respond_empty()
            }
        }
    }

    fn handle_multiletter(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let title = read_until(packet, b';');
        debug!("got v{}", title);
        let handler = self
            .multiletter_handlers
            .iter()
            .find(|&&(name, _)| name == title)
            .map(|&(_, handler)| handler);
        match handler {
            Some(handler) => handler(self, packet),
            None => {
                info!("unsupported v packet: v{}", title);
                self.respond_empty()
            }
        }
    }

    // Multiletter packets.

    fn handle_v_attach(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let pid = hex::decode_uint(packet);
        debug!("vAttach to pid {}", pid);
        // Already attached to the only process; report where it stands.
        self.handle_get_stop_reason()
    }

    fn handle_v_cont_query(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        let mut response = Buffer::new();
        response.write(b"vCont;c;C;s");
        self.respond(&response)
    }

    fn handle_v_cont(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let mut resume = false;

        while packet.read_available() > 0 {
            let mut action = Vec::new();
            let mut thread_id = Vec::new();
            let mut in_thread_id = false;
            while let Some(ch) = packet.read_u8() {
                if ch == b';' {
                    break;
                }
                if ch == b':' && !in_thread_id {
                    in_thread_id = true;
                } else if in_thread_id {
                    thread_id.push(ch);
                } else {
                    action.push(ch);
                }
            }

            if action.is_empty() {
                warn!("invalid vCont action: too small");
                return self.respond_error(1);
            }

            // The single emulated thread matches any thread id.
            if !thread_id.is_empty() {
                let mut tid = Buffer::from_vec(thread_id);
                let (pid, thread) = read_thread_id(&mut tid);
                debug!("vCont {}, {}, action {}", pid, thread, action[0] as char);
            }

            match action[0] {
                b'C' => {
                    warn!("vCont 'C' action not well supported");
                    resume = true;
                }
                b'c' => resume = true,
                b's' => {
                    // A one-instruction step: halt at the first PC change.
                    let pc = i64::from(self.debugger.cpu().pc());
                    self.debugger.set_step_range(pc, pc);
                    resume = true;
                }
                other => warn!("unsupported vCont action: {}", other as char),
            }
        }

        // No reply now; the stop reply is pushed when the target halts.
        self.waiting_for_stop.store(true, Ordering::SeqCst);
        if resume {
            self.debugger.unhalt();
        }
        Ok(())
    }

    fn handle_v_stopped(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        self.respond_ok()
    }

    // Get queries.

    fn query_supported(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        while packet.read_available() > 0 {
            let feature = read_until(packet, b';');
            if feature == "multiprocess+" {
                self.multiprocess_enabled = true;
            }
            debug!("client advertises feature: {}", feature);
        }

        let mut response = Buffer::new();
        for (i, feature) in self.features.iter().enumerate() {
            if i > 0 {
                response.write_u8(b';');
            }
            response.write_str(feature);
        }
        self.respond(&response)
    }

    fn query_current_thread(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        let mut response = Buffer::new();
        self.write_thread_id(&mut response);
        self.respond(&response)
    }

    fn query_f_thread_info(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        self.sent_thread_info = false;
        self.query_s_thread_info(packet)
    }

    fn query_s_thread_info(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        let mut response = Buffer::new();
        if self.sent_thread_info {
            // End of the (one-entry) thread list.
            response.write_u8(b'l');
        } else {
            self.sent_thread_info = true;
            response.write_u8(b'm');
            self.write_thread_id(&mut response);
        }
        self.respond(&response)
    }

    fn query_thread_extra_info(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let (_pid, _thread_id) = read_thread_id(packet);
        // No extra information for the single emulated thread.
        self.respond_empty()
    }

    fn query_offsets(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        let mut response = Buffer::new();
        response.write(b"TextSeg=");
        hex::encode_uint(0, 8, &mut response, true);
        self.respond(&response)
    }

    fn query_t_status(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        // No trace experiment running (or supported).
        let mut response = Buffer::new();
        response.write(b"T0");
        self.respond(&response)
    }

    fn query_remote_command(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let mut message = Buffer::from_vec(hex::decode_bytes(packet));
        let command = read_until(&mut message, b' ');

        let reply = if command == "help" {
            "Available commands:\n".to_owned()
        } else {
            format!("Unknown command '{}'\n", command)
        };

        let mut response = Buffer::new();
        hex::encode_str(&reply, &mut response);
        self.respond(&response)
    }

    fn query_xfer(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        let object_name = read_until(packet, b':');
        let object = match self
            .xfer_objects
            .iter()
            .position(|o| o.name == object_name)
        {
            Some(idx) => idx,
            None => {
                info!("unsupported qXfer object: {}", object_name);
                return self.respond_empty();
            }
        };

        let op = read_until(packet, b':');
        match op.as_str() {
            "read" => {
                let annex = read_until(packet, b':');
                let offset = hex::decode_uint_until(b',', packet) as usize;
                let length = hex::decode_uint(packet) as usize;
                let read = self.xfer_objects[object].read;
                read(self, &annex, offset, length)
            }
            "write" => {
                let annex = read_until(packet, b':');
                let offset = hex::decode_uint_until(b':', packet) as usize;
                let write = self.xfer_objects[object].write;
                match write {
                    Some(write) => write(self, &annex, offset, packet),
                    None => self.respond_error(30), // EROFS
                }
            }
            _ => self.respond_empty(),
        }
    }

    // Set queries.

    fn query_start_no_ack_mode(&mut self, _packet: &mut Buffer) -> Result<(), Error> {
        self.respond_ok()?;
        if let Some(conn) = self.connection.as_mut() {
            conn.start_no_ack_mode();
        }
        Ok(())
    }

    fn query_thread_events(&mut self, packet: &mut Buffer) -> Result<(), Error> {
        match packet.read_u8() {
            Some(b'0') => self.thread_events_enabled = false,
            Some(b'1') => self.thread_events_enabled = true,
            _ => return self.respond_error(1),
        }
        debug!("thread events enabled: {}", self.thread_events_enabled);
        self.respond_ok()
    }

    // qXfer objects.

    fn xfer_features_read(
        &mut self,
        annex: &str,
        offset: usize,
        length: usize,
    ) -> Result<(), Error> {
        match targets::description_document(annex) {
            Some(document) => self.respond_xfer_chunk(document.as_bytes(), offset, length),
            None => {
                error!("feature file {} is not known", annex);
                self.respond_error(0)
            }
        }
    }

    fn xfer_libraries_read(
        &mut self,
        annex: &str,
        offset: usize,
        length: usize,
    ) -> Result<(), Error> {
        if !annex.is_empty() {
            return self.respond_error(0);
        }
        self.respond_xfer_chunk(b"<library-list></library-list>", offset, length)
    }

    /// Answers one qXfer read: `l` + data when this chunk reaches the end
    /// of the document, `m` + data when more remains past it.
    fn respond_xfer_chunk(
        &mut self,
        document: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<(), Error> {
        let mut response = Buffer::new();
        if offset.saturating_add(length) >= document.len() {
            response.write_u8(b'l');
        } else {
            response.write_u8(b'm');
        }
        if offset < document.len() {
            let end = cmp::min(document.len(), offset.saturating_add(length));
            response.write(&document[offset..end]);
        }
        self.respond(&response)
    }

    /// Writes the current thread id: `p1.1` in multiprocess mode, `1`
    /// otherwise.
    fn write_thread_id(&mut self, response: &mut Buffer) {
        if self.multiprocess_enabled {
            response.write_u8(b'p');
            hex::encode_uint(1, 0, response, true);
            response.write_u8(b'.');
        }
        hex::encode_uint(1, 0, response, true);
    }
}

impl<C: Cpu + 'static> GdbStub<C, TcpStream> {
    /// Binds the listen socket and serves clients, one at a time, until
    /// the listener fails. Blocks; see [`spawn`].
    ///
    /// [`spawn`]: #method.spawn
    pub fn run(&mut self) {
        let listener = match TcpListener::bind((self.address.as_str(), self.port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!("error opening listening socket: {}", e);
                return;
            }
        };

        info!(
            "listening on {}:{} for incoming connections",
            self.address, self.port
        );

        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.accept_connection(stream, peer),
                Err(e) => error!("had error accepting client connection: {}", e),
            }
        }
    }

    /// Moves the stub onto its own thread and returns the handle.
    pub fn spawn(mut self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("gdb-stub".to_owned())
            .spawn(move || self.run())
    }

    fn accept_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        info!("accepted connection from {}", peer);

        // Halt first so the client sees a stopped target on attach.
        self.debugger.halt(StopReason::breakpoint());

        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                error!("could not clone client stream: {}", e);
                return;
            }
        };

        self.multiprocess_enabled = false;
        self.thread_events_enabled = false;
        self.sent_thread_info = false;
        self.waiting_for_stop.store(false, Ordering::SeqCst);
        self.install_halt_hook(writer);
        self.connection = Some(Connection::new(stream));

        while self.connection.as_ref().map_or(false, |c| c.is_alive()) {
            if let Err(e) = self.connection_loop() {
                error!("connection error: {}", e);
                break;
            }
        }

        info!("connection from {} died", peer);

        self.connection = None;
        self.debugger.clear_halt_hook();
        self.debugger.unhalt();
    }

    /// Arranges for halts on the emulator thread to push their stop
    /// reply to the client directly, on whichever thread triggered them.
    fn install_halt_hook(&self, writer: TcpStream) {
        let writer = Mutex::new(writer);
        let waiting_for_stop = self.waiting_for_stop.clone();
        self.debugger.set_halt_hook(Box::new(move |reason| {
            if waiting_for_stop.swap(false, Ordering::SeqCst) {
                let mut payload = Buffer::new();
                reason.encode(&mut payload);
                let mut writer = writer.lock().unwrap();
                if let Err(e) = comm::write_frame(&mut *writer, b'$', payload.peek()) {
                    error!("failed to push stop reply: {}", e);
                }
            }
        }));
    }
}

/// Consumes bytes up to and including `sep` (or the end of the buffer)
/// and returns them as a string.
fn read_until(packet: &mut Buffer, sep: u8) -> String {
    let mut out = Vec::new();
    while let Some(ch) = packet.read_u8() {
        if ch == sep {
            break;
        }
        out.push(ch);
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses a thread id of the form `[p pid .] tid`, where either part may
/// be `-1` for "all". Returns `(pid, tid)`; the pid defaults to 0 when
/// absent.
fn read_thread_id(packet: &mut Buffer) -> (i64, i64) {
    let mut pid = 0;
    if packet.peek().first() == Some(&b'p') {
        packet.mark_read(1);
        if packet.peek().first() == Some(&b'-') {
            packet.mark_read(1);
            hex::decode_uint_until(b'.', packet);
            pid = -1;
        } else {
            pid = hex::decode_uint_until(b'.', packet) as i64;
        }
    }

    let thread_id = if packet.peek().first() == Some(&b'-') {
        packet.mark_read(1);
        hex::decode_uint(packet);
        -1
    } else {
        hex::decode_uint(packet) as i64
    };

    (pid, thread_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use comm::testing::Loopback;
    use comm::write_frame;
    use debugger::testing::TestCpu;

    type TestStub = GdbStub<TestCpu, Loopback>;

    fn stub() -> TestStub {
        let debugger = Arc::new(Debugger::new(TestCpu::new()));
        let mut stub = GdbStub::with_address(debugger, DEFAULT_ADDRESS, 0);
        stub.connection = Some(Connection::new(Loopback::new()));
        stub
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut writer = Loopback::new();
        write_frame(&mut writer, b'$', payload).unwrap();
        writer.take_output()
    }

    fn output(stub: &mut TestStub) -> String {
        stub.connection.as_mut().unwrap().comm_mut().output_string()
    }

    /// Feeds one framed packet through the stub and returns everything
    /// it wrote back (ack included).
    fn transact(stub: &mut TestStub, packet: &[u8]) -> String {
        let wire = frame(packet);
        stub.connection.as_mut().unwrap().feed(&wire);
        stub.poll_connection().unwrap();
        output(stub)
    }

    /// Strips ack and framing from a response, leaving the payload.
    fn payload(response: &str) -> String {
        let response = response.trim_start_matches('+');
        assert!(
            response.starts_with('$'),
            "no response frame in {:?}",
            response
        );
        let hash = response.rfind('#').unwrap();
        response[1..hash].to_owned()
    }

    const BREAK_REPLY: &str = "T05swbreak:;thread:p1.1;core:1;";

    #[test]
    fn handshake_then_no_ack_mode() {
        let mut stub = stub();

        let reply = payload(&transact(&mut stub, b"qSupported:multiprocess+;swbreak+"));
        assert!(reply.contains("PacketSize=8192"));
        assert!(reply.contains("swbreak+"));
        assert!(reply.contains("qXfer:features:read+"));
        assert!(reply.contains("qXfer:libraries:read+"));
        assert!(reply.contains("QStartNoAckMode+"));
        assert!(reply.contains("qC+"));
        assert!(stub.multiprocess_enabled);

        // The packet carrying the request is still acked...
        let out = transact(&mut stub, b"QStartNoAckMode");
        assert!(out.starts_with('+'));
        assert_eq!(payload(&out), "OK");

        // ...every later one is not.
        let out = transact(&mut stub, b"!");
        assert!(!out.contains('+'));
        assert_eq!(payload(&out), "OK");
    }

    #[test]
    fn stop_reason_query() {
        let mut stub = stub();
        assert_eq!(payload(&transact(&mut stub, b"?")), "OK");

        stub.debugger.halt(StopReason::breakpoint());
        assert_eq!(payload(&transact(&mut stub, b"?")), BREAK_REPLY);
    }

    #[test]
    fn read_registers() {
        let mut stub = stub();
        {
            let mut cpu = stub.debugger.cpu();
            cpu.regs = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde];
            cpu.sp = 0xfffe;
            cpu.pc = 0x0150;
        }
        assert_eq!(
            payload(&transact(&mut stub, b"g")),
            "123456789afeff5001bcde"
        );
    }

    #[test]
    fn write_registers_is_accepted_but_inert() {
        let mut stub = stub();
        let out = payload(&transact(&mut stub, b"G123456789afeff5001bcde"));
        assert_eq!(out, "OK");
        assert_eq!(stub.debugger.cpu().pc(), 0);
    }

    #[test]
    fn memory_read_and_write() {
        let mut stub = stub();
        {
            let mut cpu = stub.debugger.cpu();
            cpu.mem[0x0100..0x0104].copy_from_slice(&[0x00, 0xc3, 0x50, 0x01]);
        }
        assert_eq!(payload(&transact(&mut stub, b"m0100,4")), "00c35001");

        assert_eq!(payload(&transact(&mut stub, b"M0100,2:aabb")), "OK");
        {
            let cpu = stub.debugger.cpu();
            assert_eq!(&cpu.mem[0x0100..0x0102], &[0xaa, 0xbb]);
        }

        // Reads past the end of the bus come back truncated.
        {
            let mut cpu = stub.debugger.cpu();
            cpu.mem[0xfffe] = 0x11;
            cpu.mem[0xffff] = 0x22;
        }
        assert_eq!(payload(&transact(&mut stub, b"mfffe,4")), "1122");
    }

    #[test]
    fn breakpoint_continue_breakpoint_cycle() {
        let mut stub = stub();
        stub.debugger.halt(StopReason::breakpoint());

        assert_eq!(payload(&transact(&mut stub, b"Z0,0150,1")), "OK");

        // vCont gets no immediate reply, just the ack.
        let out = transact(&mut stub, b"vCont;c");
        assert_eq!(out, "+");
        assert!(!stub.debugger.is_halted());
        assert!(stub.waiting_for_stop.load(Ordering::SeqCst));

        // The emulator reaches the breakpoint...
        stub.debugger.check_breakpoints(0x0150);
        assert!(stub.debugger.is_halted());

        // ...and the next poll pushes the stop reply.
        stub.poll_connection().unwrap();
        assert_eq!(payload(&output(&mut stub)), BREAK_REPLY);

        assert_eq!(payload(&transact(&mut stub, b"z0,0150,1")), "OK");
        stub.debugger.unhalt();
        stub.debugger.check_breakpoints(0x0150);
        assert!(!stub.debugger.is_halted());
    }

    #[test]
    fn single_step_halts_on_next_instruction() {
        let mut stub = stub();
        {
            let mut cpu = stub.debugger.cpu();
            cpu.pc = 0x0150;
        }
        stub.debugger.halt(StopReason::breakpoint());

        let out = transact(&mut stub, b"vCont;s");
        assert_eq!(out, "+");
        assert!(!stub.debugger.is_halted());

        // Still on the stepped instruction: keep going.
        stub.debugger.check_breakpoints(0x0150);
        assert!(!stub.debugger.is_halted());

        // First PC outside the range stops execution.
        stub.debugger.check_breakpoints(0x0153);
        assert!(stub.debugger.is_halted());

        stub.poll_connection().unwrap();
        assert_eq!(payload(&output(&mut stub)), BREAK_REPLY);
    }

    #[test]
    fn interrupt_byte_halts_running_target() {
        let mut stub = stub();
        transact(&mut stub, b"vCont;c");
        assert!(!stub.debugger.is_halted());

        stub.connection.as_mut().unwrap().feed(&[0x03]);
        stub.poll_connection().unwrap();
        assert!(stub.debugger.is_halted());
        assert_eq!(payload(&output(&mut stub)), BREAK_REPLY);
    }

    #[test]
    fn thread_queries_without_multiprocess() {
        let mut stub = stub();
        assert_eq!(payload(&transact(&mut stub, b"qC")), "1");
        assert_eq!(payload(&transact(&mut stub, b"qfThreadInfo")), "m1");
        assert_eq!(payload(&transact(&mut stub, b"qsThreadInfo")), "l");
        // qfThreadInfo restarts the listing.
        assert_eq!(payload(&transact(&mut stub, b"qfThreadInfo")), "m1");
    }

    #[test]
    fn thread_queries_with_multiprocess() {
        let mut stub = stub();
        transact(&mut stub, b"qSupported:multiprocess+");
        assert_eq!(payload(&transact(&mut stub, b"qC")), "p1.1");
        assert_eq!(payload(&transact(&mut stub, b"qfThreadInfo")), "mp1.1");
        assert_eq!(payload(&transact(&mut stub, b"qsThreadInfo")), "l");
    }

    #[test]
    fn small_queries_and_commands() {
        let mut stub = stub();
        assert_eq!(
            payload(&transact(&mut stub, b"qOffsets")),
            "TextSeg=0000000000000000"
        );
        assert_eq!(payload(&transact(&mut stub, b"qTStatus")), "T0");
        assert_eq!(payload(&transact(&mut stub, b"qThreadExtraInfo,1")), "");
        assert_eq!(payload(&transact(&mut stub, b"qBogus")), "");
        assert_eq!(payload(&transact(&mut stub, b"T1")), "OK");
        assert_eq!(payload(&transact(&mut stub, b"D")), "OK");
        assert!(stub.connection.as_ref().unwrap().is_alive());
        assert_eq!(payload(&transact(&mut stub, b"Hg0")), "OK");
        assert_eq!(payload(&transact(&mut stub, b"Hgp1.1")), "OK");
        assert_eq!(payload(&transact(&mut stub, b"H")), "E01");
        assert_eq!(payload(&transact(&mut stub, b"X0,0:")), "");
        assert_eq!(payload(&transact(&mut stub, b"vStopped")), "OK");
        assert_eq!(payload(&transact(&mut stub, b"vCont?")), "vCont;c;C;s");
        assert_eq!(payload(&transact(&mut stub, b"vRun;x")), "");
        assert_eq!(payload(&transact(&mut stub, b"QThreadEvents:1")), "OK");
        assert_eq!(payload(&transact(&mut stub, b"QThreadEvents:9")), "E01");
    }

    #[test]
    fn attach_reports_current_stop_reason() {
        let mut stub = stub();
        stub.debugger.halt(StopReason::breakpoint());
        assert_eq!(payload(&transact(&mut stub, b"vAttach;1")), BREAK_REPLY);
    }

    #[test]
    fn remote_command_help_and_unknown() {
        let mut stub = stub();

        // "help", hex-encoded.
        let reply = payload(&transact(&mut stub, b"qRcmd,68656c70"));
        let mut decoded = Buffer::from_vec(reply.into_bytes());
        assert_eq!(hex::decode_bytes(&mut decoded), b"Available commands:\n");

        // "bogus", hex-encoded.
        let reply = payload(&transact(&mut stub, b"qRcmd,626f677573"));
        let mut decoded = Buffer::from_vec(reply.into_bytes());
        assert_eq!(hex::decode_bytes(&mut decoded), b"Unknown command 'bogus'\n");
    }

    #[test]
    fn xfer_features_read() {
        let mut stub = stub();

        let doc = payload(&transact(
            &mut stub,
            b"qXfer:features:read:target.xml:0,1000",
        ));
        assert!(doc.starts_with("l<?xml"));
        assert!(doc.contains("<architecture>z80</architecture>"));

        let core = payload(&transact(
            &mut stub,
            b"qXfer:features:read:gb-core.xml:0,1000",
        ));
        assert!(core.starts_with('l'));
        assert!(core.contains("org.gnu.gdb.z80.core"));
        assert!(core.contains("regnum=\"6\""));
    }

    #[test]
    fn xfer_reads_chunk_by_offset_and_length() {
        let mut stub = stub();

        let full = payload(&transact(
            &mut stub,
            b"qXfer:features:read:target.xml:0,1000",
        ));
        let total = full.len() - 1;

        let first = payload(&transact(
            &mut stub,
            b"qXfer:features:read:target.xml:0,10",
        ));
        assert!(first.starts_with('m'));
        assert_eq!(first.len(), 0x10 + 1);
        assert_eq!(first[1..], full[1..1 + 0x10]);

        let rest = payload(&transact(
            &mut stub,
            b"qXfer:features:read:target.xml:10,1000",
        ));
        assert!(rest.starts_with('l'));
        assert_eq!(rest.len(), total - 0x10 + 1);

        // Offset at the end of the document: empty final chunk.
        let done = transact(
            &mut stub,
            format!("qXfer:features:read:target.xml:{:x},100", total).as_bytes(),
        );
        assert_eq!(payload(&done), "l");
    }

    #[test]
    fn xfer_error_paths() {
        let mut stub = stub();
        assert_eq!(
            payload(&transact(&mut stub, b"qXfer:features:read:missing.xml:0,100")),
            "E00"
        );
        assert_eq!(
            payload(&transact(&mut stub, b"qXfer:features:write:target.xml:0:00")),
            "E1e"
        );
        assert_eq!(payload(&transact(&mut stub, b"qXfer:bogus:read:x:0,1")), "");
    }

    #[test]
    fn xfer_libraries_read() {
        let mut stub = stub();
        assert_eq!(
            payload(&transact(&mut stub, b"qXfer:libraries:read::0,1000")),
            "l<library-list></library-list>"
        );
    }
}
