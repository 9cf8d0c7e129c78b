//! Reset and BOOT0 line control.

use embedded_hal::digital::v2::OutputPin;

/// Logical lines used to select the boot source
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Line {
    /// Target NRST
    Reset,
    /// Target BOOT0
    Boot0,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Direction {
    Input,
    Output,
}

/// Pin controller driving the reset and boot-select lines
pub trait BootPins {
    type Error: core::fmt::Debug;

    fn set_level(&mut self, line: Line, level: Level) -> Result<(), Self::Error>;

    fn set_direction(&mut self, line: Line, direction: Direction) -> Result<(), Self::Error>;
}

/// BOOT0 level selecting user flash
pub const BOOT0_MAIN_FLASH: Level = Level::Low;
/// BOOT0 level selecting the system memory bootloader
pub const BOOT0_SYSTEM_MEMORY: Level = Level::High;

/// Boot-mode sequencing over a [`BootPins`] controller
pub struct Sequencer<G> {
    pins: G,
}

impl<G: BootPins> Sequencer<G> {
    pub fn new(pins: G) -> Self {
        Self { pins }
    }

    pub fn select_main_flash(&mut self) -> Result<(), G::Error> {
        trace!("BOOT0 -> main flash");
        self.pins.set_level(Line::Boot0, BOOT0_MAIN_FLASH)
    }

    pub fn select_system_memory(&mut self) -> Result<(), G::Error> {
        trace!("BOOT0 -> system memory");
        self.pins.set_level(Line::Boot0, BOOT0_SYSTEM_MEMORY)
    }

    /// Hold the target in reset, releasing the line to the open-drain
    /// reset network
    pub fn assert_reset(&mut self) -> Result<(), G::Error> {
        trace!("NRST asserted");
        self.pins.set_level(Line::Reset, Level::Low)?;
        self.pins.set_direction(Line::Reset, Direction::Input)
    }

    /// Release the target from reset
    pub fn deassert_reset(&mut self) -> Result<(), G::Error> {
        trace!("NRST released");
        self.pins.set_level(Line::Reset, Level::High)?;
        self.pins.set_direction(Line::Reset, Direction::Output)
    }

    /// Boot-select line as an output, for controllers that start as inputs
    pub fn drive_boot0(&mut self) -> Result<(), G::Error> {
        self.pins.set_direction(Line::Boot0, Direction::Output)
    }

    pub fn pins_mut(&mut self) -> &mut G {
        &mut self.pins
    }
}

/// Two push-pull [`OutputPin`]s as boot lines.
///
/// Direction changes are ignored, so reset is driven low rather than
/// released while asserted.
pub struct OutputPins<R, B> {
    pub reset: R,
    pub boot0: B,
}

impl<R, B, E> BootPins for OutputPins<R, B>
where
    R: OutputPin<Error = E>,
    B: OutputPin<Error = E>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn set_level(&mut self, line: Line, level: Level) -> Result<(), E> {
        match (line, level) {
            (Line::Reset, Level::Low) => self.reset.set_low(),
            (Line::Reset, Level::High) => self.reset.set_high(),
            (Line::Boot0, Level::Low) => self.boot0.set_low(),
            (Line::Boot0, Level::High) => self.boot0.set_high(),
        }
    }

    fn set_direction(&mut self, _line: Line, _direction: Direction) -> Result<(), E> {
        Ok(())
    }
}
