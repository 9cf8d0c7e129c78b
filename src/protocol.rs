//! USART bootloader wire format (AN3155).
//!
//! Requests are single command bytes followed by their complement, responses
//! are collected from the serial stream chunk by chunk by a [`Collector`]
//! until complete.

use core::convert::TryFrom;

/// Synchronisation character, sent once after reset so the bootloader can
/// detect the baud rate
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Erase-all sentinel for the ERASE (0x43) command
pub const ERASE_ALL: [u8; 2] = [0xFF, 0x00];

/// Global erase sentinel (plus checksum) for the EXTENDED ERASE (0x44) command
pub const EXTENDED_ERASE_ALL: [u8; 3] = [0xFF, 0xFF, 0x00];

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// Request frame for this command, the code followed by its complement
    pub fn frame(self) -> [u8; 2] {
        let c = self as u8;
        [c, !c]
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        let c = match v {
            0x00 => Command::Get,
            0x01 => Command::GetVersionReadStatus,
            0x02 => Command::GetId,
            0x11 => Command::ReadMemory,
            0x21 => Command::Go,
            0x31 => Command::WriteMemory,
            0x43 => Command::Erase,
            0x44 => Command::ExtendedErase,
            0x63 => Command::WriteProtect,
            0x73 => Command::WriteUnprotect,
            0x82 => Command::ReadoutProtect,
            0x92 => Command::ReadoutUnprotect,
            other => return Err(other),
        };
        Ok(c)
    }
}

/// A received byte or frame did not match the protocol
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Mismatch {
    #[error("{context}: expected 0x{expected:02x} found 0x{found:02x}")]
    Byte {
        context: &'static str,
        expected: u8,
        found: u8,
    },

    #[error("{context}: expected length {expected} found {found}")]
    Length {
        context: &'static str,
        expected: usize,
        found: usize,
    },
}

fn expect_ack(context: &'static str, found: u8) -> Result<(), Mismatch> {
    if found != UART_ACK {
        return Err(Mismatch::Byte {
            context,
            expected: UART_ACK,
            found,
        });
    }
    Ok(())
}

/// Outcome of feeding one chunk of inbound data to a [`Collector`]
#[derive(Debug, PartialEq, Clone)]
pub enum Step<T> {
    /// Not complete, keep waiting
    Pending,
    /// Not complete, write these bytes then keep waiting
    Send(&'static [u8]),
    /// Response complete
    Done(T),
}

/// Response assembly state for one exchange.
///
/// Each inbound chunk is passed to `collect` in arrival order; once it
/// returns `Done` or an error no further chunks are delivered.
pub trait Collector {
    type Output;

    fn collect(&mut self, data: &[u8]) -> Result<Step<Self::Output>, Mismatch>;
}

/// Reply to the synchronisation character, a lone ACK
#[derive(Debug, Default)]
pub struct Handshake;

impl Collector for Handshake {
    type Output = ();

    fn collect(&mut self, data: &[u8]) -> Result<Step<()>, Mismatch> {
        if data.len() != 1 {
            return Err(Mismatch::Length {
                context: "enter bootloader",
                expected: 1,
                found: data.len(),
            });
        }
        expect_ack("enter bootloader", data[0])?;
        Ok(Step::Done(()))
    }
}

/// A single ACK byte, used by the two phases of extended erase
#[derive(Debug)]
pub struct Ack {
    context: &'static str,
}

impl Ack {
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }
}

impl Collector for Ack {
    type Output = ();

    fn collect(&mut self, data: &[u8]) -> Result<Step<()>, Mismatch> {
        match data.first() {
            Some(b) => {
                expect_ack(self.context, *b)?;
                Ok(Step::Done(()))
            }
            None => Ok(Step::Pending),
        }
    }
}

/// Length prefixed response: `[ACK, N, payload.., ACK]`, `N + 4` bytes total
#[derive(Debug, Default)]
pub struct AckFrame {
    buff: Vec<u8>,
    expected: Option<usize>,
}

impl AckFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes accumulated so far
    pub fn buffered(&self) -> &[u8] {
        &self.buff
    }
}

impl Collector for AckFrame {
    type Output = Vec<u8>;

    fn collect(&mut self, data: &[u8]) -> Result<Step<Vec<u8>>, Mismatch> {
        if data.is_empty() {
            return Ok(Step::Pending);
        }
        if self.buff.is_empty() {
            expect_ack("start ack", data[0])?;
        }
        self.buff.extend_from_slice(data);

        if self.expected.is_none() && self.buff.len() > 2 {
            self.expected = Some(self.buff[1] as usize + 4);
        }

        let expected = match self.expected {
            Some(e) => e,
            None => return Ok(Step::Pending),
        };

        if self.buff.len() < expected {
            return Ok(Step::Pending);
        }
        if self.buff.len() > expected {
            return Err(Mismatch::Length {
                context: "response frame",
                expected,
                found: self.buff.len(),
            });
        }

        expect_ack("end ack", self.buff[expected - 1])?;
        Ok(Step::Done(core::mem::take(&mut self.buff)))
    }
}

/// Mass erase via ERASE (0x43).
///
/// A lone start ACK (frame total of two, counting the command itself)
/// completes the erase. Anything longer is answered with the erase-all
/// sentinel and the next ACK terminates the exchange.
#[derive(Debug, Default)]
pub struct MassErase {
    received: usize,
    sentinel_sent: bool,
}

impl MassErase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for MassErase {
    type Output = ();

    fn collect(&mut self, data: &[u8]) -> Result<Step<()>, Mismatch> {
        let first = match data.first() {
            Some(b) => *b,
            None => return Ok(Step::Pending),
        };
        expect_ack("erase ack", first)?;

        if self.sentinel_sent {
            return Ok(Step::Done(()));
        }

        self.received += data.len();
        if self.received + 1 == 2 {
            return Ok(Step::Done(()));
        }

        self.sentinel_sent = true;
        Ok(Step::Send(&ERASE_ALL))
    }
}

/// Fields reported by GET
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub version: u8,
    pub commands: Vec<u8>,
}

/// Parse a completed GET frame: version at offset 2, then command codes up
/// to (excluding) the trailing ACK
pub fn parse_get(frame: &[u8]) -> Result<GetResponse, Mismatch> {
    if frame.len() < 4 {
        return Err(Mismatch::Length {
            context: "get response",
            expected: 4,
            found: frame.len(),
        });
    }
    Ok(GetResponse {
        version: frame[2],
        commands: frame[3..frame.len() - 1].to_vec(),
    })
}

/// Parse a completed GET ID frame, product id big-endian at offsets 2 and 3
pub fn parse_product_id(frame: &[u8]) -> Result<u16, Mismatch> {
    if frame.len() < 5 {
        return Err(Mismatch::Length {
            context: "get id response",
            expected: 5,
            found: frame.len(),
        });
    }
    Ok(u16::from_be_bytes([frame[2], frame[3]]))
}
