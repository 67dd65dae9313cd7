//! A client for one board, holding its connection and run state.
//!
//! ## Overview
//!
//! [`BoardClient`] wraps a [`Transport`] and exposes one method per board command. Each method
//! checks the client's [`ClientState`], sends the request frame and validates the reply. Two
//! transports are provided: [`TcpTransport`] for real boards and
//! [`SimBoard`](crate::sim::SimBoard), which answers in-process.
//!
//! ## Error policy
//!
//! - A NACK is returned as [`ProtocolError::Nack`]; the connection stays usable.
//! - Any other protocol error (wrong command or size, timeout, peer reset) closes the socket
//!   and leaves the client [`ClientState::Disconnected`].
//! - Dropping a connected client sends CLOSE on best-effort.
//!
//! ## Example
//!
//! ```
//! use fpgactrl_backend::client::*;
//! use fpgactrl_backend::sim::SimBoard;
//! use fpgactrl_backend::wire::ConfigFrame;
//!
//! let board = SimBoard::new("main");
//! let mut client = BoardClient::new("main", board.connection(), Timeouts::default());
//! client.open().unwrap();
//! client.reset().unwrap();
//! let applied = client
//!     .configure(&ConfigFrame { clock_hz: 100_000_000, scan_hz: 1_000_000, num_samples: 2, cycles: 1, ..Default::default() })
//!     .unwrap();
//! assert_eq!(applied.num_samples, 2);
//! client.write_stream(&[0u8; 16]).unwrap();
//! assert_eq!(client.state(), ClientState::Armed);
//! client.close().unwrap();
//! assert_eq!(client.state(), ClientState::Disconnected);
//! ```

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fpgacompiler_backend::DEFAULT_PORT;

use crate::error::ProtocolError;
use crate::status::*;
use crate::utils::StreamCounter;
use crate::wire::*;

/// Byte pipe to a board.
pub trait Transport: Send {
    /// Sends all of `bytes`.
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ProtocolError>;
    /// Fills `buf` completely.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ProtocolError>;
    /// Closes the pipe; later calls fail.
    fn shutdown(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        (**self).send(bytes, timeout)
    }
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ProtocolError> {
        (**self).recv(buf, timeout)
    }
    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// Reads one complete frame, validating its header first.
pub fn read_frame<T: Transport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<Frame, ProtocolError> {
    let mut header = [0u8; HEADER_BYTES];
    transport.recv(&mut header, timeout)?;
    let (_, size) = check_header(header)?;
    let mut bytes = vec![0u8; size];
    bytes[..HEADER_BYTES].copy_from_slice(&header);
    transport.recv(&mut bytes[HEADER_BYTES..], timeout)?;
    Frame::decode(&bytes)
}

pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    /// Connects to `endpoint` (`host` or `host:port`, default port 49701).
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self, ProtocolError> {
        let peer = if endpoint.contains(':') {
            endpoint.to_string()
        } else {
            format!("{}:{}", endpoint, DEFAULT_PORT)
        };
        let addrs = peer
            .to_socket_addrs()
            .map_err(|e| ProtocolError::from_io(e, &format!("resolving {}", peer)))?;
        let mut last_err = ProtocolError::NotConnected;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| ProtocolError::from_io(e, "configuring socket"))?;
                    log::debug!("Connected to {}", addr);
                    return Ok(Self { stream, peer });
                }
                Err(e) => last_err = ProtocolError::from_io(e, &format!("connecting to {}", addr)),
            }
        }
        Err(last_err)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

fn nonzero(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        let what = format!("sending to {}", self.peer);
        self.stream
            .set_write_timeout(nonzero(timeout))
            .map_err(|e| ProtocolError::from_io(e, &what))?;
        self.stream
            .write_all(bytes)
            .map_err(|e| ProtocolError::from_io(e, &what))
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ProtocolError> {
        let what = format!("receiving from {}", self.peer);
        self.stream
            .set_read_timeout(nonzero(timeout))
            .map_err(|e| ProtocolError::from_io(e, &what))?;
        self.stream
            .read_exact(buf)
            .map_err(|e| ProtocolError::from_io(e, &what))
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Shutdown of {}: {}", self.peer, e);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Disconnected,
    /// Socket open, OPEN not yet acknowledged.
    Connected,
    Open,
    Configured,
    /// Stream uploaded.
    Armed,
    Running,
}

impl ClientState {
    pub fn is_connected(self) -> bool {
        self != ClientState::Disconnected
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub connect: Duration,
    pub operation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            operation: Duration::from_secs(5),
        }
    }
}

const ANY_CONNECTED: [ClientState; 5] = [
    ClientState::Connected,
    ClientState::Open,
    ClientState::Configured,
    ClientState::Armed,
    ClientState::Running,
];

pub const DEFAULT_CHUNK_BYTES: usize = 1 << 16;

pub struct BoardClient<T: Transport> {
    name: String,
    transport: Option<T>,
    state: ClientState,
    timeouts: Timeouts,
    policy: ErrorPolicy,
    chunk_bytes: usize,
    applied: Option<ConfigFrame>,
    last_status: Option<StatusFrame>,
}

impl BoardClient<TcpTransport> {
    /// Connects with the short timeout. Errors leave nothing open.
    pub fn connect(name: &str, endpoint: &str, timeouts: Timeouts) -> Result<Self, ProtocolError> {
        let transport = TcpTransport::connect(endpoint, timeouts.connect)?;
        log::info!("{}: connected to {}", name, transport.peer());
        Ok(Self::new(name, transport, timeouts))
    }
}

impl<T: Transport> BoardClient<T> {
    /// A client over an already connected transport.
    pub fn new(name: &str, transport: T, timeouts: Timeouts) -> Self {
        Self {
            name: name.to_string(),
            transport: Some(transport),
            state: ClientState::Connected,
            timeouts,
            policy: ErrorPolicy::default(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            applied: None,
            last_status: None,
        }
    }

    /// A client without connection; see [`BoardClient::attach`].
    pub fn disconnected(name: &str, timeouts: Timeouts) -> Self {
        Self {
            name: name.to_string(),
            transport: None,
            state: ClientState::Disconnected,
            timeouts,
            policy: ErrorPolicy::default(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            applied: None,
            last_status: None,
        }
    }

    /// Replaces the connection, e.g. after a protocol error.
    pub fn attach(&mut self, transport: T) {
        self.drop_connection();
        self.transport = Some(transport);
        self.state = ClientState::Connected;
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn state(&self) -> ClientState {
        self.state
    }
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }
    pub fn set_policy(&mut self, policy: ErrorPolicy) {
        self.policy = policy;
    }
    pub fn set_chunk_bytes(&mut self, chunk_bytes: usize) {
        self.chunk_bytes = chunk_bytes.max(1);
    }
    /// Configuration echoed by the board at the last CONFIG.
    pub fn applied_config(&self) -> Option<&ConfigFrame> {
        self.applied.as_ref()
    }
    pub fn last_status(&self) -> Option<&StatusFrame> {
        self.last_status.as_ref()
    }
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    fn require(&self, op: Command, allowed: &[ClientState]) -> Result<(), ProtocolError> {
        if self.state == ClientState::Disconnected {
            return Err(ProtocolError::NotConnected);
        }
        if !allowed.contains(&self.state) {
            return Err(ProtocolError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn drop_connection(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
        self.state = ClientState::Disconnected;
        self.applied = None;
    }

    /// Collapses the connection on fatal errors.
    fn guard<R>(&mut self, result: Result<R, ProtocolError>) -> Result<R, ProtocolError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                log::error!("{}: {}; closing connection", self.name, err);
                self.drop_connection();
            } else {
                log::warn!("{}: {}", self.name, err);
            }
        }
        result
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let timeout = self.timeouts.operation;
        let result = match self.transport.as_mut() {
            Some(transport) => transport.send(bytes, timeout),
            None => Err(ProtocolError::NotConnected),
        };
        self.guard(result)
    }

    fn receive(&mut self, request: Command, expected: Command) -> Result<Frame, ProtocolError> {
        let timeout = self.timeouts.operation;
        let result = match self.transport.as_mut() {
            Some(transport) => read_frame(transport, timeout).and_then(|frame| match frame.command() {
                actual if actual == expected => Ok(frame),
                Command::Nack => Err(ProtocolError::Nack(request)),
                actual => Err(ProtocolError::UnexpectedCommand {
                    request,
                    expected,
                    actual,
                }),
            }),
            None => Err(ProtocolError::NotConnected),
        };
        self.guard(result)
    }

    fn transact(&mut self, request: Frame, expected: Command) -> Result<Frame, ProtocolError> {
        log::trace!("{}: -> {}", self.name, request);
        self.send_bytes(&request.encode())?;
        let reply = self.receive(request.command(), expected)?;
        log::trace!("{}: <- {}", self.name, reply);
        Ok(reply)
    }

    pub fn open(&mut self) -> Result<(), ProtocolError> {
        self.require(Command::Open, &ANY_CONNECTED)?;
        self.transact(Frame::Open, Command::Ack)?;
        if self.state == ClientState::Connected {
            self.state = ClientState::Open;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), ProtocolError> {
        self.require(Command::Reset, &ANY_CONNECTED)?;
        self.transact(Frame::Reset, Command::Ack)?;
        self.state = ClientState::Open;
        self.applied = None;
        Ok(())
    }

    /// Sends CONFIG and returns the configuration the board applied.
    pub fn configure(&mut self, config: &ConfigFrame) -> Result<ConfigFrame, ProtocolError> {
        self.require(
            Command::Config,
            &[ClientState::Open, ClientState::Configured, ClientState::Armed],
        )?;
        let applied = match self.transact(Frame::Config(*config), Command::Config)? {
            Frame::Config(applied) => applied,
            _ => *config,
        };
        if applied != *config {
            log::info!("{}: board adjusted config to {:?}", self.name, applied);
        }
        self.applied = Some(applied);
        self.state = ClientState::Configured;
        Ok(applied)
    }

    /// Two-phase WRITE: announce the byte count, then stream the payload in chunks.
    pub fn write_stream(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.require(
            Command::Write,
            &[ClientState::Configured, ClientState::Armed],
        )?;
        let count = u32::try_from(payload.len()).map_err(|_| ProtocolError::UnexpectedFrameSize {
            command: Command::Write,
            expected: vec![u32::MAX as usize],
            actual: payload.len(),
        })?;
        self.transact(Frame::Write(count), Command::Ack)?;
        for (start, end) in StreamCounter::new(payload.len(), self.chunk_bytes) {
            self.send_bytes(&payload[start..end])?;
        }
        self.receive(Command::Write, Command::Ack)?;
        log::debug!("{}: uploaded {} bytes", self.name, count);
        self.state = ClientState::Armed;
        Ok(())
    }

    /// Starts the run, `cycles == 0` repeats forever.
    pub fn start(&mut self, cycles: u32) -> Result<(), ProtocolError> {
        self.require(Command::Start, &[ClientState::Armed])?;
        self.transact(Frame::Start(cycles), Command::Ack)?;
        self.state = ClientState::Running;
        Ok(())
    }

    /// STOP from any state. The client falls back to Open, so a new run starts again at CONFIG.
    pub fn stop(&mut self) -> Result<(), ProtocolError> {
        self.require(Command::Stop, &ANY_CONNECTED)?;
        self.transact(Frame::Stop, Command::Ack)?;
        if self.state != ClientState::Connected {
            self.state = ClientState::Open;
        }
        Ok(())
    }

    /// STATUS, or STATUS_IRQ when `irq` is set: the board then answers on its next state change.
    pub fn poll_status(&mut self, irq: bool) -> Result<StatusFrame, ProtocolError> {
        self.require(Command::Status, &ANY_CONNECTED)?;
        let reply = if irq {
            self.transact(Frame::StatusIrq, Command::StatusIrqRsp)?
        } else {
            self.transact(Frame::Status, Command::StatusRsp)?
        };
        let status = match reply {
            Frame::StatusRsp(s) | Frame::StatusIrqRsp(s) => s,
            _ => StatusFrame::default(),
        };
        self.last_status = Some(status);
        Ok(status)
    }

    /// Polls the status and interprets it under the client's error policy.
    pub fn summary(&mut self) -> Result<StatusSummary, ProtocolError> {
        let status = self.poll_status(false)?;
        Ok(StatusSummary::new(status.status, self.policy))
    }

    pub fn get_register(&mut self, offset: u32) -> Result<u32, ProtocolError> {
        self.require(Command::GetReg, &ANY_CONNECTED)?;
        match self.transact(Frame::GetReg(RegFrame { offset, value: 0 }), Command::GetReg)? {
            Frame::GetReg(reg) => Ok(reg.value),
            _ => Ok(0),
        }
    }

    /// Writes a register and returns the value the board applied.
    pub fn set_register(&mut self, offset: u32, value: u32) -> Result<u32, ProtocolError> {
        self.require(Command::SetReg, &ANY_CONNECTED)?;
        match self.transact(Frame::SetReg(RegFrame { offset, value }), Command::SetReg)? {
            Frame::SetReg(reg) => Ok(reg.value),
            _ => Ok(value),
        }
    }

    pub fn full_status(&mut self) -> Result<FullStatus, ProtocolError> {
        self.require(Command::StatusFull, &ANY_CONNECTED)?;
        match self.transact(Frame::StatusFull, Command::StatusFullRsp)? {
            Frame::StatusFullRsp(full) => Ok(*full),
            _ => Ok(FullStatus::default()),
        }
    }

    /// CLOSE, then closes the socket. Closing a disconnected client does nothing.
    pub fn close(&mut self) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Ok(());
        }
        let result = self.transact(Frame::Close, Command::Ack);
        self.drop_connection();
        log::debug!("{}: closed", self.name);
        result.map(|_| ())
    }

    /// STOP and CLOSE on best-effort. Safe to call in any state, any number of times.
    pub fn abort(&mut self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.stop() {
            log::warn!("{}: STOP during abort failed: {}", self.name, e);
        }
        if let Err(e) = self.close() {
            log::warn!("{}: CLOSE during abort failed: {}", self.name, e);
        }
    }
}

impl<T: Transport> Drop for BoardClient<T> {
    fn drop(&mut self) {
        if self.transport.is_some() {
            if let Err(e) = self.close() {
                log::debug!("{}: CLOSE on drop failed: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    mod state_machine {
        use std::time::Duration;

        use crate::client::*;
        use crate::error::ProtocolError;
        use crate::sim::SimBoard;

        fn open_client(board: &SimBoard) -> BoardClient<SimBoard> {
            let mut client = BoardClient::new("sim", board.connection(), Timeouts::default());
            client.open().unwrap();
            client
        }

        fn config(num_samples: u32) -> ConfigFrame {
            ConfigFrame {
                clock_hz: 100_000_000,
                scan_hz: 1_000_000,
                num_samples,
                cycles: 1,
                ..Default::default()
            }
        }

        #[test]
        fn order_is_enforced() {
            let board = SimBoard::new("sim");
            let mut client = open_client(&board);
            assert!(matches!(
                client.start(1),
                Err(ProtocolError::InvalidState { op: Command::Start, .. })
            ));
            assert!(matches!(
                client.write_stream(&[0; 8]),
                Err(ProtocolError::InvalidState { .. })
            ));
            // invalid state keeps the connection
            assert_eq!(client.state(), ClientState::Open);

            client.configure(&config(1)).unwrap();
            client.write_stream(&[0; 8]).unwrap();
            assert_eq!(client.state(), ClientState::Armed);
            client.start(1).unwrap();
            assert_eq!(client.state(), ClientState::Running);
            client.stop().unwrap();
            assert_eq!(client.state(), ClientState::Open);
            // a new run needs CONFIG and WRITE again
            assert!(matches!(
                client.start(1),
                Err(ProtocolError::InvalidState { op: Command::Start, .. })
            ));
            client.configure(&config(1)).unwrap();
            client.write_stream(&[0; 8]).unwrap();
            client.start(1).unwrap();
            client.stop().unwrap();
            client.reset().unwrap();
            assert_eq!(client.state(), ClientState::Open);
            assert!(client.applied_config().is_none());
        }

        #[test]
        fn nack_keeps_connection() {
            let board = SimBoard::new("sim").nack_on(Command::Start);
            let mut client = open_client(&board);
            client.configure(&config(1)).unwrap();
            client.write_stream(&[0; 8]).unwrap();
            assert!(matches!(client.start(0), Err(ProtocolError::Nack(Command::Start))));
            assert_eq!(client.state(), ClientState::Armed);
        }

        #[test]
        fn silence_disconnects() {
            let board = SimBoard::new("sim").silent_on(Command::Status);
            let timeouts = Timeouts {
                connect: Duration::from_millis(10),
                operation: Duration::from_millis(10),
            };
            let mut client = BoardClient::new("sim", board.connection(), timeouts);
            client.open().unwrap();
            assert!(matches!(client.poll_status(false), Err(ProtocolError::Timeout(_))));
            assert_eq!(client.state(), ClientState::Disconnected);
            assert!(matches!(client.open(), Err(ProtocolError::NotConnected)));
            // idempotent
            client.abort();
            client.close().unwrap();

            client.attach(board.connection());
            client.open().unwrap();
            assert_eq!(client.state(), ClientState::Open);
        }

        #[test]
        fn chunked_upload() {
            let board = SimBoard::new("sim");
            let mut client = open_client(&board);
            client.set_chunk_bytes(5);
            client.configure(&config(3)).unwrap();
            let payload: Vec<u8> = (0..24).collect();
            client.write_stream(&payload).unwrap();
            assert_eq!(board.uploaded(), payload);
        }

        #[test]
        fn registers() {
            let board = SimBoard::new("sim");
            let mut client = open_client(&board);
            client.configure(&config(1)).unwrap();
            let ctrl = client.set_register(REG_CTRL, CTRL_CLK_EXT).unwrap();
            assert_eq!(ctrl, CTRL_CLK_EXT);
            assert_eq!(client.get_register(REG_CTRL).unwrap(), CTRL_CLK_EXT);
            let status = client.poll_status(true).unwrap();
            assert!(StatusFlags(status.status).ext_clock_locked());
            assert_eq!(client.get_register(REG_NUM_SAMPLES).unwrap(), 1);
        }
    }

    mod chunking {
        use proptest::prelude::*;

        use crate::client::*;
        use crate::sim::SimBoard;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]
            #[test]
            fn any_chunk_size_uploads_the_same_bytes(chunk in 1usize..64, samples in 1u32..40) {
                let board = SimBoard::new("sim");
                let mut client = BoardClient::new("sim", board.connection(), Timeouts::default());
                client.open().unwrap();
                client.set_chunk_bytes(chunk);
                client.configure(&ConfigFrame {
                    clock_hz: 100_000_000,
                    scan_hz: 1_000_000,
                    num_samples: samples,
                    cycles: 1,
                    ..Default::default()
                }).unwrap();
                let payload: Vec<u8> = (0..samples * 8).map(|b| b as u8).collect();
                client.write_stream(&payload).unwrap();
                prop_assert_eq!(board.uploaded(), payload);
                prop_assert_eq!(client.state(), ClientState::Armed);
            }
        }
    }
}
