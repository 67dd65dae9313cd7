//! Frames exchanged with a board over TCP.
//!
//! Every frame starts with a little-endian `u16` header: bits 0..9 hold the total frame length
//! in bytes (header included), bits 10..15 the command id. The payload is a sequence of
//! little-endian `u32` words whose count is fixed per command, see [`Command::frame_sizes`].
//!
//! | frame | bytes | payload |
//! |---|---|---|
//! | ACK, NACK, RESET, OPEN, CLOSE, STOP, STATUS, STATUS_IRQ, STATUS_FULL | 2 | none |
//! | CONFIG (request and echo) | 50 | [`ConfigFrame`] |
//! | WRITE, START | 6 | byte count, cycles |
//! | STATUS_RSP, STATUS_IRQ_RSP | 18 | [`StatusFrame`] |
//! | GET_REG, SET_REG (request and echo) | 10 | [`RegFrame`] |
//! | STATUS_FULL_RSP | 182 or 186 | [`FullStatus`] |

use std::fmt;

use serde::Serialize;

use crate::error::ProtocolError;

pub const HEADER_BYTES: usize = 2;
pub const SIZE_BITS: u32 = 10;
pub const SIZE_MASK: u16 = (1 << SIZE_BITS) - 1;
pub const FULL_STATUS_FIELDS: usize = 43;
/// Largest legal frame.
pub const MAX_FRAME_BYTES: usize = HEADER_BYTES + 4 * (FULL_STATUS_FIELDS + 3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ack = 0x01,
    Nack = 0x02,
    Reset = 0x03,
    Open = 0x04,
    Close = 0x05,
    Config = 0x06,
    Write = 0x07,
    Start = 0x08,
    Stop = 0x09,
    Status = 0x0A,
    StatusIrq = 0x0B,
    StatusFull = 0x0C,
    GetReg = 0x0D,
    SetReg = 0x0E,
    StatusRsp = 0x0F,
    StatusIrqRsp = 0x10,
    StatusFullRsp = 0x11,
}

impl Command {
    pub const ALL: [Command; 17] = [
        Command::Ack,
        Command::Nack,
        Command::Reset,
        Command::Open,
        Command::Close,
        Command::Config,
        Command::Write,
        Command::Start,
        Command::Stop,
        Command::Status,
        Command::StatusIrq,
        Command::StatusFull,
        Command::GetReg,
        Command::SetReg,
        Command::StatusRsp,
        Command::StatusIrqRsp,
        Command::StatusFullRsp,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Command> {
        Command::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// Legal total frame lengths in bytes.
    pub fn frame_sizes(self) -> &'static [usize] {
        match self {
            Command::Config => &[50],
            Command::Write | Command::Start => &[6],
            Command::StatusRsp | Command::StatusIrqRsp => &[18],
            Command::GetReg | Command::SetReg => &[10],
            Command::StatusFullRsp => &[182, 186],
            _ => &[HEADER_BYTES],
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Reset => "RESET",
            Command::Open => "OPEN",
            Command::Close => "CLOSE",
            Command::Config => "CONFIG",
            Command::Write => "WRITE",
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Status => "STATUS",
            Command::StatusIrq => "STATUS_IRQ",
            Command::StatusFull => "STATUS_FULL",
            Command::GetReg => "GET_REG",
            Command::SetReg => "SET_REG",
            Command::StatusRsp => "STATUS_RSP",
            Command::StatusIrqRsp => "STATUS_IRQ_RSP",
            Command::StatusFullRsp => "STATUS_FULL_RSP",
        };
        write!(f, "{}", name)
    }
}

pub fn encode_header(command: Command, size: usize) -> u16 {
    (size as u16 & SIZE_MASK) | ((command.id() as u16) << SIZE_BITS)
}

/// Splits a header into `(command id, total size)`.
pub fn decode_header(bytes: [u8; 2]) -> (u8, usize) {
    let header = u16::from_le_bytes(bytes);
    ((header >> SIZE_BITS) as u8, (header & SIZE_MASK) as usize)
}

/// Validates a received header and returns its command and total size.
pub fn check_header(bytes: [u8; 2]) -> Result<(Command, usize), ProtocolError> {
    let (id, size) = decode_header(bytes);
    let command = Command::from_id(id).ok_or(ProtocolError::UnknownCommand(id))?;
    if !command.frame_sizes().contains(&size) {
        return Err(ProtocolError::UnexpectedFrameSize {
            command,
            expected: command.frame_sizes().to_vec(),
            actual: size,
        });
    }
    Ok((command, size))
}

fn words_of(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// CONFIG payload. The board answers with the values it actually applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConfigFrame {
    pub clock_hz: u32,
    pub scan_hz: u32,
    pub config: u32,
    pub ctrl_in: [u32; 2],
    pub ctrl_out: [u32; 2],
    pub cycles: u32,
    pub num_samples: u32,
    pub strb_delay: u32,
    pub sync_wait: u32,
    pub sync_phase: u32,
}

impl ConfigFrame {
    fn words(&self) -> [u32; 12] {
        [
            self.clock_hz,
            self.scan_hz,
            self.config,
            self.ctrl_in[0],
            self.ctrl_in[1],
            self.ctrl_out[0],
            self.ctrl_out[1],
            self.cycles,
            self.num_samples,
            self.strb_delay,
            self.sync_wait,
            self.sync_phase,
        ]
    }

    fn from_words(w: &[u32]) -> Self {
        Self {
            clock_hz: w[0],
            scan_hz: w[1],
            config: w[2],
            ctrl_in: [w[3], w[4]],
            ctrl_out: [w[5], w[6]],
            cycles: w[7],
            num_samples: w[8],
            strb_delay: w[9],
            sync_wait: w[10],
            sync_phase: w[11],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusFrame {
    pub status: u32,
    pub board_time: u32,
    pub board_samples: u32,
    pub board_cycles: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegFrame {
    pub offset: u32,
    pub value: u32,
}

macro_rules! full_status {
    ($($field: ident),* $(,)?) => {
        /// Register dump returned by STATUS_FULL.
        #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
        pub struct FullStatus {
            $(pub $field: u32,)*
            /// Last sample output: time word plus one word per rack.
            pub last_sample: Vec<u32>,
        }

        impl FullStatus {
            pub const FIELD_NAMES: &'static [&'static str] = &[$(stringify!($field)),*];

            fn fields(&self) -> Vec<u32> {
                vec![$(self.$field),*]
            }

            fn from_fields(words: &[u32], last_sample: Vec<u32>) -> Self {
                let mut words = words.iter().copied();
                Self {
                    $($field: words.next().unwrap_or_default(),)*
                    last_sample,
                }
            }
        }
    };
}

full_status!(
    ctrl, ctrl_in0, ctrl_in1, ctrl_out0, ctrl_out1,
    clk_div, strb_delay, sync_delay, sync_phase, status,
    board_time, board_time_ext, board_samples, board_samples_ext, board_cycles,
    sync_time, version, info, temperature, phase_ext, phase_det, period_in, period_out, period_bus,
    dsc_rx_p, dsc_rx_a, dsc_rx_c, dsc_tx_p, dsc_tx_a, dsc_tx_c,
    err_rx, err_tx, err_fpga, irq_tx, irq_rx, irq_fpga, irq_num,
    tx_bt_tot, rx_bt_tot, bt_tot, reps_set, reps_act, timeout_ms,
);

impl FullStatus {
    /// Bytes per sample of the board that sent this dump.
    pub fn bytes_per_sample(&self) -> usize {
        4 * self.last_sample.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Ack,
    Nack,
    Reset,
    Open,
    Close,
    Stop,
    Status,
    StatusIrq,
    StatusFull,
    Config(ConfigFrame),
    /// Number of payload bytes that follow the ACK.
    Write(u32),
    /// Number of cycles, 0 runs forever.
    Start(u32),
    StatusRsp(StatusFrame),
    StatusIrqRsp(StatusFrame),
    GetReg(RegFrame),
    SetReg(RegFrame),
    StatusFullRsp(Box<FullStatus>),
}

impl Frame {
    pub fn command(&self) -> Command {
        match self {
            Frame::Ack => Command::Ack,
            Frame::Nack => Command::Nack,
            Frame::Reset => Command::Reset,
            Frame::Open => Command::Open,
            Frame::Close => Command::Close,
            Frame::Stop => Command::Stop,
            Frame::Status => Command::Status,
            Frame::StatusIrq => Command::StatusIrq,
            Frame::StatusFull => Command::StatusFull,
            Frame::Config(_) => Command::Config,
            Frame::Write(_) => Command::Write,
            Frame::Start(_) => Command::Start,
            Frame::StatusRsp(_) => Command::StatusRsp,
            Frame::StatusIrqRsp(_) => Command::StatusIrqRsp,
            Frame::GetReg(_) => Command::GetReg,
            Frame::SetReg(_) => Command::SetReg,
            Frame::StatusFullRsp(_) => Command::StatusFullRsp,
        }
    }

    fn payload(&self) -> Vec<u32> {
        match self {
            Frame::Config(cfg) => cfg.words().to_vec(),
            Frame::Write(n) | Frame::Start(n) => vec![*n],
            Frame::StatusRsp(s) | Frame::StatusIrqRsp(s) => {
                vec![s.status, s.board_time, s.board_samples, s.board_cycles]
            }
            Frame::GetReg(r) | Frame::SetReg(r) => vec![r.offset, r.value],
            Frame::StatusFullRsp(full) => {
                let mut words = full.fields();
                words.extend_from_slice(&full.last_sample);
                words
            }
            _ => Vec::new(),
        }
    }

    /// Serialises the frame, header included.
    ///
    /// # Example
    /// ```
    /// use fpgactrl_backend::wire::*;
    ///
    /// assert_eq!(Frame::Ack.encode(), vec![0x02, 0x04]);
    /// assert_eq!(Frame::Start(3).encode(), vec![0x06, 0x20, 3, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let size = HEADER_BYTES + 4 * payload.len();
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&encode_header(self.command(), size).to_le_bytes());
        for word in payload {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Parses one complete frame; `bytes` must be exactly the frame.
    pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
        if bytes.len() < HEADER_BYTES {
            return Err(ProtocolError::PeerClosed);
        }
        let (command, size) = check_header([bytes[0], bytes[1]])?;
        if size != bytes.len() {
            return Err(ProtocolError::UnexpectedFrameSize {
                command,
                expected: vec![size],
                actual: bytes.len(),
            });
        }
        let w = words_of(&bytes[HEADER_BYTES..]);
        let frame = match command {
            Command::Ack => Frame::Ack,
            Command::Nack => Frame::Nack,
            Command::Reset => Frame::Reset,
            Command::Open => Frame::Open,
            Command::Close => Frame::Close,
            Command::Stop => Frame::Stop,
            Command::Status => Frame::Status,
            Command::StatusIrq => Frame::StatusIrq,
            Command::StatusFull => Frame::StatusFull,
            Command::Config => Frame::Config(ConfigFrame::from_words(&w)),
            Command::Write => Frame::Write(w[0]),
            Command::Start => Frame::Start(w[0]),
            Command::StatusRsp | Command::StatusIrqRsp => {
                let status = StatusFrame {
                    status: w[0],
                    board_time: w[1],
                    board_samples: w[2],
                    board_cycles: w[3],
                };
                if command == Command::StatusRsp {
                    Frame::StatusRsp(status)
                } else {
                    Frame::StatusIrqRsp(status)
                }
            }
            Command::GetReg => Frame::GetReg(RegFrame {
                offset: w[0],
                value: w[1],
            }),
            Command::SetReg => Frame::SetReg(RegFrame {
                offset: w[0],
                value: w[1],
            }),
            Command::StatusFullRsp => Frame::StatusFullRsp(Box::new(FullStatus::from_fields(
                &w[..FULL_STATUS_FIELDS],
                w[FULL_STATUS_FIELDS..].to_vec(),
            ))),
        };
        Ok(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Write(n) => write!(f, "WRITE({} bytes)", n),
            Frame::Start(n) => write!(f, "START({} cycles)", n),
            Frame::GetReg(r) | Frame::SetReg(r) => {
                write!(f, "{}({:#04x} = {:#010x})", self.command(), r.offset, r.value)
            }
            _ => write!(f, "{}", self.command()),
        }
    }
}
