use anyhow::Result;
use clap::Parser;
use simplelog::LevelFilter;

use usbisp::programmer::{Programmer, Session};
use usbisp::{Flashing, PartDb};

#[derive(clap::Parser)]
#[command(
    name = "usbisp",
    about = "Command-line AVR in-system programmer for USB ISP 3.0 and MCU Pro devices",
    version
)]
struct Cli {
    /// Programmer model to open
    #[arg(short = 'c', long, global = true, value_enum, default_value = "usbisp3")]
    programmer: ProgrammerKind,

    /// Target part name
    #[arg(short, long, global = true, default_value = "atmega328p")]
    part: String,

    /// Turns on more verbose output, repeatable
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProgrammerKind {
    Usbisp3,
    Mcupro,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Get info about the connected programmer and part
    Info {},
    /// Perform a chip erase
    Erase {},
    /// Write a firmware file to flash and verify it
    Flash {
        /// Path of the firmware file (bin, hex, ihex or elf)
        path: String,
        /// Skip the chip erase before writing
        #[arg(long)]
        no_erase: bool,
    },
    /// Compare flash content against a firmware file
    Verify {
        path: String,
    },
    /// Read out a memory region
    Read {
        /// Memory region name (flash, eeprom, signature, fuses, lock)
        #[arg(default_value = "flash")]
        memory: String,
        /// Write the content to a file instead of hexdumping it
        path: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let part = PartDb::find(&cli.part)?;
    let programmer: Box<dyn Programmer> = match cli.programmer {
        ProgrammerKind::Usbisp3 => Box::new(Session::open_usbisp3()?),
        ProgrammerKind::Mcupro => Box::new(Session::open_mcupro()?),
    };

    let mut flashing = Flashing::open(programmer, part)?;
    let result = run(&mut flashing, cli.command);
    flashing.release();
    result
}

fn run(flashing: &mut Flashing, command: Commands) -> Result<()> {
    match command {
        Commands::Info {} => {
            flashing.dump_info()?;
        }
        Commands::Erase {} => {
            flashing.erase()?;
        }
        Commands::Flash { path, no_erase } => {
            let binary = usbisp::format::read_firmware_from_file(&path)?;
            log::info!("Firmware size: {}", binary.len());
            if !no_erase {
                flashing.erase()?;
            }
            flashing.flash(&binary)?;
            flashing.verify(&binary)?;
        }
        Commands::Verify { path } => {
            let binary = usbisp::format::read_firmware_from_file(&path)?;
            log::info!("Firmware size: {}", binary.len());
            flashing.verify(&binary)?;
        }
        Commands::Read { memory, path } => {
            let data = flashing.read_memory(&memory)?;
            match path {
                Some(path) => {
                    usbisp::format::write_firmware_to_file(&path, &data)?;
                    log::info!("Read {} bytes of {} into {}", data.len(), memory, path);
                }
                None => {
                    let mut dump = Vec::new();
                    hxdmp::hexdump(&data, &mut dump)?;
                    println!("{}", String::from_utf8_lossy(&dump));
                }
            }
        }
    }
    Ok(())
}
