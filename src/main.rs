#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::TryFrom;

use anyhow::Context;
use indicatif::ProgressBar;

use stm32_usart_boot::protocol::Command;
use stm32_usart_boot::{Options, Programmer, TargetInfo};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    operation: Operation,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "9600")]
    baud: usize,

    /// sysfs GPIO number of the target reset line
    #[structopt(long)]
    reset_pin: u64,

    /// sysfs GPIO number of the target BOOT0 line
    #[structopt(long)]
    boot0_pin: u64,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Read bootloader and chip information
    Info,
    /// Mass erase the device flash
    Erase,
    /// Erase and program a binary image
    Flash {
        /// Binary image to program
        file: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Configuring GPIOs");

    let mut p = Programmer::linux(&o.port, o.baud, o.reset_pin, o.boot0_pin, o.options.clone())
        .context("Error configuring GPIOs")?;

    p.init().context("Error initialising boot lines")?;

    match &o.operation {
        Operation::Info => {
            let info = p.identify().context("Error reading device info")?;
            print_info(&info);
        }
        Operation::Erase => {
            let info = with_spinner("Erasing", || p.enter_and_erase())
                .context("Error erasing device")?;
            print_info(&info);
        }
        Operation::Flash { file } => {
            let image = std::fs::read(file).with_context(|| format!("Error reading {}", file))?;
            info!("Loaded {} ({})", file, bytefmt::format(image.len() as u64));

            with_spinner("Flashing", || p.flash(&image)).context("Error flashing device")?;
        }
    }

    Ok(())
}

fn with_spinner<R>(message: &str, f: impl FnOnce() -> R) -> R {
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(message);
    spinner.enable_steady_tick(100);

    let r = f();

    spinner.finish_and_clear();
    r
}

fn print_info(info: &TargetInfo) {
    info!(
        "Bootloader version: {}.{}",
        info.bootloader_version >> 4,
        info.bootloader_version & 0x0f
    );
    info!("Product ID: 0x{:04x}", info.product_id);
    info!("Commands: {}", hex::encode(&info.commands));

    for c in &info.commands {
        match Command::try_from(*c) {
            Ok(cmd) => debug!("  0x{:02x} {:?}", c, cmd),
            Err(v) => debug!("  0x{:02x} unknown", v),
        }
    }
}
