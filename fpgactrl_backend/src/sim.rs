//! An in-process board answering the wire protocol.
//!
//! [`SimBoard`] implements [`Transport`] on the server side: requests are parsed as they arrive
//! and replies are queued for the next `recv`. The run itself is not executed; the status is
//! derived from the wall-clock time since START, scaled by the scan rate, and from the time
//! column of the uploaded samples.
//!
//! All connections made with [`SimBoard::connection`] share one board state, so a worker may
//! reconnect and a test may inspect what the board received.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::Transport;
use crate::error::ProtocolError;
use crate::status::*;
use crate::wire::*;

pub const SIM_VERSION: u32 = 0x0001_0000;

#[derive(Debug)]
struct BoardState {
    name: String,
    ext_clock_available: bool,
    nack: Vec<Command>,
    silent: Vec<Command>,
    speed: f64,
    config: ConfigFrame,
    opened: bool,
    data: Vec<u8>,
    times: Vec<u32>,
    pending: usize,
    cycles: u32,
    started: Option<Instant>,
    stopped_after: Option<Duration>,
    received: Vec<Command>,
}

impl BoardState {
    fn bytes_per_sample(&self) -> usize {
        if self.config.config & CTRL_BPS96 != 0 {
            12
        } else {
            8
        }
    }

    fn reset(&mut self) {
        self.config = ConfigFrame::default();
        self.data.clear();
        self.times.clear();
        self.pending = 0;
        self.cycles = 0;
        self.started = None;
        self.stopped_after = None;
    }

    fn finish_upload(&mut self) {
        let bps = self.bytes_per_sample();
        self.times = self
            .data
            .chunks_exact(bps)
            .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
            .collect();
        log::debug!("sim {}: {} samples uploaded", self.name, self.times.len());
    }

    fn snapshot(&self) -> StatusFrame {
        let mut status = STATUS_READY;
        if self.config.config & CTRL_CLK_EXT != 0 {
            status |= STATUS_EXT_USED;
            if self.ext_clock_available {
                status |= STATUS_EXT_LOCKED;
            }
        }
        let Some(started) = self.started else {
            return StatusFrame {
                status,
                ..Default::default()
            };
        };
        if status & STATUS_EXT_USED != 0
            && status & STATUS_EXT_LOCKED == 0
            && self.config.config & CTRL_ERR_LOCK_EN != 0
        {
            status |= STATUS_ERR_LOCK;
        }
        let elapsed = self.stopped_after.unwrap_or_else(|| started.elapsed());
        let ticks = (elapsed.as_secs_f64() * self.speed * self.config.scan_hz as f64) as u64;
        let period = self.times.last().copied().unwrap_or(0) as u64 + 1;
        let per_cycle = self.times.len() as u64;
        let cycles = self.cycles as u64;
        if cycles > 0 && ticks >= period * cycles {
            return StatusFrame {
                status: status | STATUS_END | STATUS_IRQ_END,
                board_time: (period - 1) as u32,
                board_samples: (per_cycle * cycles) as u32,
                board_cycles: self.cycles,
            };
        }
        let cycle = ticks / period;
        let tick = ticks % period;
        let done = self.times.partition_point(|&t| t as u64 <= tick) as u64;
        if self.stopped_after.is_none() {
            status |= STATUS_RUN;
        }
        StatusFrame {
            status,
            board_time: tick as u32,
            board_samples: (cycle * per_cycle + done) as u32,
            board_cycles: cycle as u32,
        }
    }

    fn read_register(&self, offset: u32) -> Option<u32> {
        let snapshot = self.snapshot();
        let c = &self.config;
        Some(match offset {
            REG_CTRL => c.config,
            REG_CTRL_IN0 => c.ctrl_in[0],
            REG_CTRL_IN1 => c.ctrl_in[1],
            REG_CTRL_OUT0 => c.ctrl_out[0],
            REG_CTRL_OUT1 => c.ctrl_out[1],
            REG_CLK_DIV => c.clock_hz.checked_div(c.scan_hz).unwrap_or(0),
            REG_STRB_DELAY => c.strb_delay,
            REG_SYNC_DELAY => c.sync_wait,
            REG_SYNC_PHASE => c.sync_phase,
            REG_NUM_SAMPLES => c.num_samples,
            REG_NUM_CYCLES => c.cycles,
            REG_STATUS => snapshot.status,
            REG_BOARD_TIME => snapshot.board_time,
            REG_BOARD_SAMPLES => snapshot.board_samples,
            REG_BOARD_CYCLES => snapshot.board_cycles,
            _ => return None,
        })
    }

    fn write_register(&mut self, offset: u32, value: u32) -> Option<u32> {
        let c = &mut self.config;
        match offset {
            REG_CTRL => c.config = value,
            REG_CTRL_IN0 => c.ctrl_in[0] = value,
            REG_CTRL_IN1 => c.ctrl_in[1] = value,
            REG_CTRL_OUT0 => c.ctrl_out[0] = value,
            REG_CTRL_OUT1 => c.ctrl_out[1] = value,
            REG_STRB_DELAY => c.strb_delay = value,
            REG_SYNC_DELAY => c.sync_wait = value,
            REG_SYNC_PHASE => c.sync_phase = value,
            REG_NUM_SAMPLES => c.num_samples = value,
            REG_NUM_CYCLES => c.cycles = value,
            _ => return None,
        }
        self.read_register(offset)
    }

    fn full_status(&self) -> FullStatus {
        let s = self.snapshot();
        let c = &self.config;
        let words = self.bytes_per_sample() / 4;
        let last_sample = match self.data.len().checked_sub(self.bytes_per_sample()) {
            Some(start) if self.started.is_some() => self.data[start..]
                .chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .collect(),
            _ => vec![0; words],
        };
        FullStatus {
            ctrl: c.config,
            ctrl_in0: c.ctrl_in[0],
            ctrl_in1: c.ctrl_in[1],
            ctrl_out0: c.ctrl_out[0],
            ctrl_out1: c.ctrl_out[1],
            clk_div: c.clock_hz.checked_div(c.scan_hz).unwrap_or(0),
            strb_delay: c.strb_delay,
            sync_delay: c.sync_wait,
            sync_phase: c.sync_phase,
            status: s.status,
            board_time: s.board_time,
            board_time_ext: s.board_time,
            board_samples: s.board_samples,
            board_samples_ext: s.board_samples,
            board_cycles: s.board_cycles,
            version: SIM_VERSION,
            bt_tot: self.data.len() as u32,
            reps_set: self.cycles,
            reps_act: s.board_cycles,
            last_sample,
            ..Default::default()
        }
    }

    /// The reply to one request, `None` to stay silent.
    fn handle(&mut self, request: Frame) -> Option<Frame> {
        let command = request.command();
        self.received.push(command);
        if self.silent.contains(&command) {
            return None;
        }
        if self.nack.contains(&command) {
            return Some(Frame::Nack);
        }
        let reply = match request {
            Frame::Open => {
                self.opened = true;
                Frame::Ack
            }
            Frame::Close => {
                self.opened = false;
                Frame::Ack
            }
            Frame::Reset => {
                self.reset();
                Frame::Ack
            }
            Frame::Config(mut config) => {
                if config.scan_hz == 0 || config.scan_hz > config.clock_hz {
                    config.scan_hz = config.clock_hz.max(1);
                }
                self.config = config;
                Frame::Config(config)
            }
            Frame::Write(count) => {
                let count = count as usize;
                if count == 0 || count % self.bytes_per_sample() != 0 {
                    Frame::Nack
                } else {
                    self.data.clear();
                    self.times.clear();
                    self.pending = count;
                    Frame::Ack
                }
            }
            Frame::Start(cycles) => {
                if self.times.is_empty() {
                    Frame::Nack
                } else {
                    self.cycles = cycles;
                    self.started = Some(Instant::now());
                    self.stopped_after = None;
                    Frame::Ack
                }
            }
            Frame::Stop => {
                if let (Some(started), None) = (self.started, self.stopped_after) {
                    self.stopped_after = Some(started.elapsed());
                }
                Frame::Ack
            }
            Frame::Status => Frame::StatusRsp(self.snapshot()),
            Frame::StatusIrq => Frame::StatusIrqRsp(self.snapshot()),
            Frame::StatusFull => Frame::StatusFullRsp(Box::new(self.full_status())),
            Frame::GetReg(reg) => match self.read_register(reg.offset) {
                Some(value) => Frame::GetReg(RegFrame { value, ..reg }),
                None => Frame::Nack,
            },
            Frame::SetReg(reg) => match self.write_register(reg.offset, reg.value) {
                Some(value) => Frame::SetReg(RegFrame { value, ..reg }),
                None => Frame::Nack,
            },
            _ => Frame::Nack,
        };
        Some(reply)
    }
}

/// A simulated board. Cloning shares the board, use [`SimBoard::connection`] for a fresh socket.
#[derive(Debug)]
pub struct SimBoard {
    board: Arc<Mutex<BoardState>>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    closed: bool,
}

impl SimBoard {
    pub fn new(name: &str) -> Self {
        Self {
            board: Arc::new(Mutex::new(BoardState {
                name: name.to_string(),
                ext_clock_available: true,
                nack: Vec::new(),
                silent: Vec::new(),
                speed: 1.0,
                config: ConfigFrame::default(),
                opened: false,
                data: Vec::new(),
                times: Vec::new(),
                pending: 0,
                cycles: 0,
                started: None,
                stopped_after: None,
                received: Vec::new(),
            })),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            closed: false,
        }
    }

    /// A new connection to the same board.
    pub fn connection(&self) -> SimBoard {
        SimBoard {
            board: Arc::clone(&self.board),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            closed: false,
        }
    }

    /// The external clock never locks.
    pub fn without_ext_clock(self) -> Self {
        self.board.lock().ext_clock_available = false;
        self
    }

    /// Answers `command` with NACK.
    pub fn nack_on(self, command: Command) -> Self {
        self.board.lock().nack.push(command);
        self
    }

    /// Never answers `command`.
    pub fn silent_on(self, command: Command) -> Self {
        self.board.lock().silent.push(command);
        self
    }

    /// Runs `speed` times faster than real time.
    pub fn with_speed(self, speed: f64) -> Self {
        self.board.lock().speed = speed;
        self
    }

    pub fn name(&self) -> String {
        self.board.lock().name.clone()
    }
    /// Every request received so far, over all connections.
    pub fn received(&self) -> Vec<Command> {
        self.board.lock().received.clone()
    }
    pub fn uploaded(&self) -> Vec<u8> {
        self.board.lock().data.clone()
    }
    pub fn config(&self) -> ConfigFrame {
        self.board.lock().config
    }
    pub fn is_open(&self) -> bool {
        self.board.lock().opened
    }
    pub fn status(&self) -> StatusFrame {
        self.board.lock().snapshot()
    }

    /// Answers requests arriving on `stream` until the peer closes it or sends CLOSE.
    pub fn serve(&self, mut stream: TcpStream) -> io::Result<()> {
        let mut conn = self.connection();
        let mut buf = vec![0u8; 1 << 12];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            if conn.send(&buf[..n], Duration::ZERO).is_err() {
                return Ok(());
            }
            let replies: Vec<u8> = conn.outbox.drain(..).collect();
            stream.write_all(&replies)?;
            if conn.closed {
                return Ok(());
            }
        }
    }

    fn process(&mut self) {
        let mut board = self.board.lock();
        loop {
            if board.pending > 0 {
                let n = board.pending.min(self.inbox.len());
                if n == 0 {
                    break;
                }
                board.data.extend(self.inbox.drain(..n));
                board.pending -= n;
                if board.pending == 0 {
                    board.finish_upload();
                    self.outbox.extend(Frame::Ack.encode());
                }
                continue;
            }
            if self.inbox.len() < HEADER_BYTES {
                break;
            }
            let size = match check_header([self.inbox[0], self.inbox[1]]) {
                Ok((_, size)) => size,
                Err(e) => {
                    log::warn!("sim {}: dropping input: {}", board.name, e);
                    self.inbox.clear();
                    self.outbox.extend(Frame::Nack.encode());
                    break;
                }
            };
            if self.inbox.len() < size {
                break;
            }
            let bytes: Vec<u8> = self.inbox.drain(..size).collect();
            match Frame::decode(&bytes) {
                Ok(request) => {
                    let close = request.command() == Command::Close;
                    if let Some(reply) = board.handle(request) {
                        self.outbox.extend(reply.encode());
                    }
                    if close {
                        self.closed = true;
                    }
                }
                Err(e) => {
                    log::warn!("sim {}: {}", board.name, e);
                    self.outbox.extend(Frame::Nack.encode());
                }
            }
        }
    }
}

impl Transport for SimBoard {
    fn send(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::PeerClosed);
        }
        self.inbox.extend_from_slice(bytes);
        self.process();
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), ProtocolError> {
        if self.outbox.len() < buf.len() {
            if self.closed {
                return Err(ProtocolError::PeerClosed);
            }
            return Err(ProtocolError::Timeout(format!(
                "waiting for simulated board {}",
                self.board.lock().name
            )));
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod test {
    mod board {
        use std::time::Duration;

        use crate::client::{read_frame, Transport};
        use crate::sim::*;

        const T: Duration = Duration::from_millis(10);

        fn request(sim: &mut SimBoard, frame: Frame) -> Frame {
            sim.send(&frame.encode(), T).unwrap();
            read_frame(sim, T).unwrap()
        }

        fn samples(times: &[u32]) -> Vec<u8> {
            times
                .iter()
                .flat_map(|t| [t.to_le_bytes(), 0u32.to_le_bytes()].concat())
                .collect()
        }

        #[test]
        fn upload_and_run() {
            let mut sim = SimBoard::new("sim").with_speed(1e6);
            assert_eq!(request(&mut sim, Frame::Open), Frame::Ack);
            let config = ConfigFrame {
                clock_hz: 100_000_000,
                scan_hz: 1_000_000,
                num_samples: 3,
                cycles: 2,
                ..Default::default()
            };
            assert_eq!(request(&mut sim, Frame::Config(config)), Frame::Config(config));
            assert_eq!(request(&mut sim, Frame::Start(1)), Frame::Nack);
            assert_eq!(request(&mut sim, Frame::Write(7)), Frame::Nack);

            let payload = samples(&[0, 4, 9]);
            assert_eq!(request(&mut sim, Frame::Write(payload.len() as u32)), Frame::Ack);
            // the payload may arrive in pieces
            sim.send(&payload[..5], T).unwrap();
            assert!(matches!(read_frame(&mut sim, T), Err(ProtocolError::Timeout(_))));
            sim.send(&payload[5..], T).unwrap();
            assert_eq!(read_frame(&mut sim, T).unwrap(), Frame::Ack);

            assert_eq!(request(&mut sim, Frame::Start(2)), Frame::Ack);
            std::thread::sleep(Duration::from_millis(5));
            let Frame::StatusRsp(status) = request(&mut sim, Frame::Status) else {
                panic!("expected STATUS_RSP");
            };
            assert_ne!(status.status & STATUS_END, 0);
            assert_eq!(status.board_time, 9);
            assert_eq!(status.board_samples, 6);
            assert_eq!(status.board_cycles, 2);
        }

        #[test]
        fn external_clock() {
            let mut sim = SimBoard::new("sim").without_ext_clock();
            let set = RegFrame {
                offset: REG_CTRL,
                value: CTRL_CLK_EXT,
            };
            assert_eq!(request(&mut sim, Frame::SetReg(set)), Frame::SetReg(set));
            let Frame::StatusRsp(status) = request(&mut sim, Frame::Status) else {
                panic!("expected STATUS_RSP");
            };
            assert!(StatusFlags(status.status).ext_clock_used());
            assert!(!StatusFlags(status.status).ext_clock_locked());
            let bad = RegFrame {
                offset: 0x3C,
                value: 1,
            };
            assert_eq!(request(&mut sim, Frame::GetReg(bad)), Frame::Nack);
        }

        #[test]
        fn close_ends_connection() {
            let board = SimBoard::new("sim");
            let mut sim = board.connection();
            assert_eq!(request(&mut sim, Frame::Open), Frame::Ack);
            assert!(board.is_open());
            assert_eq!(request(&mut sim, Frame::Close), Frame::Ack);
            assert!(matches!(sim.send(&Frame::Open.encode(), T), Err(ProtocolError::PeerClosed)));
            assert_eq!(board.received(), vec![Command::Open, Command::Close]);
        }
    }
}
