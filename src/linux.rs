use std::io::{self, ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use embedded_hal::digital::v2::OutputPin;
use linux_embedded_hal::sysfs_gpio::{self, Direction as SysfsDirection};
use linux_embedded_hal::{Delay, Serial, SysfsPin};
use serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::gpio::{BootPins, Direction, Level, Line};
use crate::transport::Transport;
use crate::{Options, Programmer};

/// Read timeout for the underlying tty, reads return immediately and the
/// poll delay is the only wait
const READ_TIMEOUT_MS: u32 = 0;

/// Serial port transport, opened on entry into the bootloader
pub struct LinuxSerial {
    path: PathBuf,
    baud: usize,
    port: Option<Serial>,
}

impl LinuxSerial {
    pub fn new<P: AsRef<Path>>(path: P, baud: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            baud,
            port: None,
        }
    }

    fn port(&mut self) -> io::Result<&mut Serial> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(IoErrorKind::NotConnected, "serial port not open"))
    }
}

impl Transport for LinuxSerial {
    type Error = io::Error;

    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        debug!("Opening {} at {} baud", self.path.display(), self.baud);

        // Open port
        let mut port = Serial::open(&self.path)?;

        // Apply settings, 8E1 is fixed by the bootloader
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(self.baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(Duration::from_millis(READ_TIMEOUT_MS as u64))?;

        self.port = Some(port);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.0.write_all(data)?;
        port.0.flush()
    }

    fn read(&mut self, buff: &mut [u8]) -> nb::Result<usize, io::Error> {
        let port = self.port().map_err(nb::Error::Other)?;

        match port.0.read(buff) {
            Ok(n) => Ok(n),
            Err(e) => match e.kind() {
                IoErrorKind::WouldBlock | IoErrorKind::TimedOut | IoErrorKind::Interrupted => {
                    Err(nb::Error::WouldBlock)
                }
                _ => Err(nb::Error::Other(e)),
            },
        }
    }

    fn read_wait_ms(&self) -> u32 {
        READ_TIMEOUT_MS
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
        Ok(())
    }
}

/// Reset and BOOT0 lines on sysfs GPIOs.
///
/// sysfs rejects values written to inputs, so levels set while a line is an
/// input are applied when it is switched back to an output.
pub struct SysfsPins {
    reset: SysfsPin,
    boot0: SysfsPin,
    levels: [Level; 2],
    outputs: [bool; 2],
}

fn index(line: Line) -> usize {
    match line {
        Line::Reset => 0,
        Line::Boot0 => 1,
    }
}

impl SysfsPins {
    /// Export the reset and BOOT0 pins by sysfs number
    pub fn new(reset: u64, boot0: u64) -> Result<Self, sysfs_gpio::Error> {
        let reset = SysfsPin::new(reset);
        reset.0.export()?;

        let boot0 = SysfsPin::new(boot0);
        boot0.0.export()?;

        Ok(Self {
            reset,
            boot0,
            levels: [Level::High, Level::Low],
            outputs: [false, false],
        })
    }

    fn pin(&mut self, line: Line) -> &mut SysfsPin {
        match line {
            Line::Reset => &mut self.reset,
            Line::Boot0 => &mut self.boot0,
        }
    }
}

impl BootPins for SysfsPins {
    type Error = sysfs_gpio::Error;

    fn set_level(&mut self, line: Line, level: Level) -> Result<(), sysfs_gpio::Error> {
        let i = index(line);
        self.levels[i] = level;

        if !self.outputs[i] {
            return Ok(());
        }

        let pin = self.pin(line);
        match level {
            Level::Low => pin.set_low(),
            Level::High => pin.set_high(),
        }
    }

    fn set_direction(
        &mut self,
        line: Line,
        direction: Direction,
    ) -> Result<(), sysfs_gpio::Error> {
        let i = index(line);
        let d = match (direction, self.levels[i]) {
            (Direction::Input, _) => SysfsDirection::In,
            (Direction::Output, Level::Low) => SysfsDirection::Low,
            (Direction::Output, Level::High) => SysfsDirection::High,
        };

        self.pin(line).0.set_direction(d)?;
        self.outputs[i] = direction == Direction::Output;

        Ok(())
    }
}

pub type LinuxProgrammer = Programmer<LinuxSerial, SysfsPins, Delay>;

impl Programmer<LinuxSerial, SysfsPins, Delay> {
    /// Create a new linux serial port and sysfs GPIO programmer instance,
    /// the serial port is opened when entering the bootloader
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        reset_pin: u64,
        boot0_pin: u64,
        options: Options,
    ) -> Result<Self, sysfs_gpio::Error> {
        let pins = SysfsPins::new(reset_pin, boot0_pin)?;

        // Return instance
        Ok(Self::new(LinuxSerial::new(port, baud), pins, Delay {}, options))
    }
}
