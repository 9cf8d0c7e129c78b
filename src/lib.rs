//! STM32 USART Bootloader.
//!
//! Base on AN3155. Drives the target reset and BOOT0 lines to enter the
//! system memory bootloader, queries the bootloader and chip, and erases
//! flash before restoring normal boot.

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod gpio;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod mock;

use gpio::{BootPins, Sequencer};
use protocol::{
    parse_get, parse_product_id, Ack, AckFrame, Command, GetResponse, Handshake, MassErase,
    Mismatch, EXTENDED_ERASE_ALL, UART_DISC,
};
use transport::{Framed, Transport};

/// Session state, advanced by each stage of the system memory sequence
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    EnteringBootloader,
    QueryingCapabilities,
    QueryingIdentity,
    Erasing,
    Programming,
    RestoringMainFlash,
    Closed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error<TransportError, PinError> {
    #[error("serial transport error: {0:?}")]
    Transport(TransportError),

    #[error("gpio error: {0:?}")]
    Pin(PinError),

    #[error("timeout waiting for {context} response ({timeout_ms} ms)")]
    Timeout {
        context: &'static str,
        timeout_ms: u32,
    },

    #[error(transparent)]
    Mismatch(Mismatch),

    #[error("command {0:?} not available, run GET first")]
    Unavailable(Command),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for a mass erase to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to hold reset with BOOT0 selected before release
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub settle_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub boot_delay_ms: u32,

    /// Erase with EXTENDED ERASE (0x44) instead of ERASE (0x43)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub extended_erase: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            erase_timeout_ms: 30_000,
            poll_delay_ms: 1,
            settle_delay_ms: 10,
            boot_delay_ms: 500,
            extended_erase: false,
        }
    }
}

/// Target details collected while in the bootloader
#[derive(Clone, PartialEq, Debug)]
pub struct TargetInfo {
    pub bootloader_version: u8,
    pub product_id: u16,
    /// Command codes supported by the bootloader, in reported order
    pub commands: Vec<u8>,
}

pub struct Programmer<T, G, D> {
    state: State,
    options: Options,
    link: Framed<T, D>,
    seq: Sequencer<G>,
    version: Option<u8>,
    commands: Vec<u8>,
    product_id: Option<u16>,
}

impl<T, G, D> Programmer<T, G, D>
where
    T: Transport,
    G: BootPins,
    D: DelayMs<u32>,
{
    /// Create a new programmer instance
    pub fn new(transport: T, pins: G, delay: D, options: Options) -> Self {
        let link = Framed::new(transport, delay, options.poll_delay_ms);

        Self {
            state: State::Idle,
            options,
            link,
            seq: Sequencer::new(pins),
            version: None,
            commands: vec![],
            product_id: None,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Commands reported by the last GET
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    pub fn bootloader_version(&self) -> Option<u8> {
        self.version
    }

    pub fn product_id(&self) -> Option<u16> {
        self.product_id
    }

    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    /// Configure the lines so the target runs from main flash
    pub fn init(&mut self) -> Result<(), Error<T::Error, G::Error>> {
        self.seq.drive_boot0().map_err(Error::Pin)?;
        self.seq.select_main_flash().map_err(Error::Pin)?;
        self.seq.deassert_reset().map_err(Error::Pin)?;
        self.state = State::Idle;
        Ok(())
    }

    /// Open the transport, reset into system memory and synchronise with
    /// the bootloader
    pub fn enter_bootloader(&mut self) -> Result<(), Error<T::Error, G::Error>> {
        self.state = State::EnteringBootloader;
        self.version = None;
        self.commands.clear();
        self.product_id = None;

        debug!("Opening transport");
        self.link.transport_mut().open().map_err(Error::Transport)?;

        debug!("Resetting device into system memory");
        self.seq.assert_reset().map_err(Error::Pin)?;
        self.seq.select_system_memory().map_err(Error::Pin)?;
        self.link.delay_ms(self.options.settle_delay_ms);
        self.seq.deassert_reset().map_err(Error::Pin)?;
        self.link.delay_ms(self.options.boot_delay_ms);

        debug!("Sending discovery character");
        self.link.await_response(
            "enter bootloader",
            &[UART_DISC],
            Handshake,
            self.options.response_timeout_ms,
        )?;

        info!("Bootloader connected");
        Ok(())
    }

    /// Fetch the bootloader version and supported commands
    pub fn get(&mut self) -> Result<GetResponse, Error<T::Error, G::Error>> {
        self.state = State::QueryingCapabilities;

        let frame = self.link.await_response(
            "get",
            &Command::Get.frame(),
            AckFrame::new(),
            self.options.response_timeout_ms,
        )?;
        let r = parse_get(&frame).map_err(Error::Mismatch)?;

        info!(
            "Bootloader version: 0x{:02x} commands: {:02x?}",
            r.version, r.commands
        );

        self.version = Some(r.version);
        self.commands = r.commands.clone();

        Ok(r)
    }

    /// Fetch the product ID
    pub fn get_id(&mut self) -> Result<u16, Error<T::Error, G::Error>> {
        self.require(Command::GetId)?;
        self.state = State::QueryingIdentity;

        let frame = self.link.await_response(
            "get id",
            &Command::GetId.frame(),
            AckFrame::new(),
            self.options.response_timeout_ms,
        )?;
        let pid = parse_product_id(&frame).map_err(Error::Mismatch)?;

        info!("Product ID: 0x{:04x}", pid);
        self.product_id = Some(pid);

        Ok(pid)
    }

    /// Mass erase flash using ERASE
    pub fn erase_all(&mut self) -> Result<(), Error<T::Error, G::Error>> {
        self.require(Command::Erase)?;
        self.state = State::Erasing;

        self.link.await_response(
            "erase",
            &Command::Erase.frame(),
            MassErase::new(),
            self.options.erase_timeout_ms,
        )?;

        info!("Flash erased");
        Ok(())
    }

    /// Mass erase flash using EXTENDED ERASE
    pub fn extended_erase_all(&mut self) -> Result<(), Error<T::Error, G::Error>> {
        self.require(Command::ExtendedErase)?;
        self.state = State::Erasing;

        self.link.await_response(
            "extended erase",
            &Command::ExtendedErase.frame(),
            Ack::new("extended erase"),
            self.options.response_timeout_ms,
        )?;
        self.link.await_response(
            "extended erase all",
            &EXTENDED_ERASE_ALL,
            Ack::new("extended erase all"),
            self.options.erase_timeout_ms,
        )?;

        info!("Flash erased");
        Ok(())
    }

    /// Return the target to main flash and close the transport
    pub fn restore_main_flash(&mut self) -> Result<(), Error<T::Error, G::Error>> {
        self.state = State::RestoringMainFlash;

        debug!("Restoring main flash boot");
        self.seq.assert_reset().map_err(Error::Pin)?;
        self.seq.select_main_flash().map_err(Error::Pin)?;
        self.link.transport_mut().close().map_err(Error::Transport)?;
        self.seq.deassert_reset().map_err(Error::Pin)?;

        self.state = State::Closed;
        Ok(())
    }

    /// Enter the bootloader, identify and erase the target, then restore
    /// main flash boot
    pub fn enter_and_erase(&mut self) -> Result<TargetInfo, Error<T::Error, G::Error>> {
        self.run_system_memory(true, |_, info| Ok(info))
    }

    /// Enter the bootloader and identify the target without erasing
    pub fn identify(&mut self) -> Result<TargetInfo, Error<T::Error, G::Error>> {
        self.run_system_memory(false, |_, info| Ok(info))
    }

    /// Erase and program `image`.
    ///
    /// Writing is not supported yet, the programming stage only reports the
    /// image size once the target has been erased.
    // TODO: WRITE MEMORY (0x31) in 256 byte blocks then GO (0x21)
    pub fn flash(&mut self, image: &[u8]) -> Result<(), Error<T::Error, G::Error>> {
        self.run_system_memory(true, |p, _| {
            p.state = State::Programming;
            info!("Programming {} bytes", image.len());
            Ok(())
        })
    }

    /// Run the system memory sequence and `stage`, then always restore
    /// main flash boot. Teardown errors take precedence.
    fn run_system_memory<R, F>(
        &mut self,
        erase: bool,
        stage: F,
    ) -> Result<R, Error<T::Error, G::Error>>
    where
        F: FnOnce(&mut Self, TargetInfo) -> Result<R, Error<T::Error, G::Error>>,
    {
        let res = match self.system_memory(erase) {
            Ok(info) => stage(self, info),
            Err(e) => Err(e),
        };

        if let Err(e) = &res {
            error!("Bootloader sequence failed: {}", e);
        }

        if let Err(e) = self.restore_main_flash() {
            error!("Restoring main flash failed: {}", e);
            return Err(e);
        }

        res
    }

    fn system_memory(&mut self, erase: bool) -> Result<TargetInfo, Error<T::Error, G::Error>> {
        self.enter_bootloader()?;
        let r = self.get()?;
        let product_id = self.get_id()?;

        if erase {
            if self.options.extended_erase {
                self.extended_erase_all()?;
            } else {
                self.erase_all()?;
            }
        }

        Ok(TargetInfo {
            bootloader_version: r.version,
            product_id,
            commands: r.commands,
        })
    }

    fn require(&self, command: Command) -> Result<(), Error<T::Error, G::Error>> {
        if !self.commands.contains(&(command as u8)) {
            warn!("Command {:?} not available", command);
            return Err(Error::Unavailable(command));
        }
        Ok(())
    }
}
