use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::PathBuf;

use clap::ArgAction::{Set, SetTrue};
use clap::{Args, Parser, Subcommand};
use tracing::{event, span, Level};
use tracing_subscriber::prelude::*;

use base::prelude::*;
use hp2100::da::{default_address, DiscConfiguration, InterfaceReport};
use hp2100::disclib::{DiscImage, DriveModel, Status2, StatusCode, SECTOR_WORDS};
use hp2100::{CardConfiguration, ConfigurationError, DiscInterface, DriverError, HostDriver};

/// Exercise a simulated HP 12821A disc interface and the Amigo disc
/// drive attached to it.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Disc image file (created if it does not exist).
    #[clap(action = Set)]
    image: PathBuf,

    /// Select code (in octal) of the interface card.
    #[clap(action = Set, long, default_value = "14", value_parser = parse_select_code)]
    select_code: SelectCode,

    /// Drive unit (0 to 3) to which the image is attached.
    #[clap(action = Set, long, default_value_t = 0)]
    unit: usize,

    /// HP-IB address of the drive (defaults to the unit number).
    #[clap(action = Set, long, value_parser = parse_bus_address)]
    address: Option<BusAddress>,

    /// Drive model: 7906, 7920 or 7925.
    #[clap(action = Set, long, default_value = "7920")]
    model: DriveModel,

    /// Set the drive's write-protect switch.
    #[clap(action = SetTrue, long)]
    protect: bool,

    /// Set the drive's format switch.
    #[clap(action = SetTrue, long)]
    format: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Copy)]
struct DiscAddress {
    #[clap(action = Set, long, short = 'c')]
    cylinder: u16,
    #[clap(action = Set, long, short = 'H', default_value_t = 0)]
    head: u8,
    #[clap(action = Set, long, short = 's', default_value_t = 0)]
    sector: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the drive's Amigo identification.
    Identify,
    /// Print the drive's Request Status words.
    Status,
    /// Move the heads.
    Seek(DiscAddress),
    /// Read a sector and print it in octal, or save it to a file.
    Read {
        #[clap(flatten)]
        address: DiscAddress,
        /// File to which the sector is written (as little-endian words).
        #[clap(action = Set, long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Write a sector from a file of little-endian words.  A short
    /// file leaves the rest of the sector zero.
    Write {
        #[clap(flatten)]
        address: DiscAddress,
        #[clap(action = Set, long, short = 'i')]
        input: PathBuf,
    },
    /// Show the state of the interface card and the drives.
    Show {
        #[clap(action = SetTrue, long)]
        json: bool,
    },
}

fn parse_select_code(s: &str) -> Result<SelectCode, String> {
    let n = u8::from_str_radix(s, 8).map_err(|e| format!("{s} is not an octal number: {e}"))?;
    SelectCode::try_from(n).map_err(|e| format!("select code {s}: {e}"))
}

fn parse_bus_address(s: &str) -> Result<BusAddress, String> {
    let n: u8 = s.parse().map_err(|e| format!("{s} is not a number: {e}"))?;
    BusAddress::try_from(n).map_err(|e| format!("bus address {s}: {e}"))
}

#[derive(Debug)]
enum Fail {
    /// We were not able to set up logging.
    InitialisationFailure(String),
    /// The drive could not be configured as requested.
    Configuration(ConfigurationError),
    /// A file could not be read or written.
    HostFile(PathBuf, io::Error),
    /// The simulated system failed.
    Driver(DriverError),
    Output(String),
}

impl Display for Fail {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Fail::InitialisationFailure(msg) | Fail::Output(msg) => f.write_str(msg.as_str()),
            Fail::Configuration(e) => write!(f, "configuration error: {e}"),
            Fail::HostFile(path, e) => write!(f, "{}: {e}", path.display()),
            Fail::Driver(e) => e.fmt(f),
        }
    }
}

impl Error for Fail {}

impl From<DriverError> for Fail {
    fn from(e: DriverError) -> Fail {
        Fail::Driver(e)
    }
}

impl From<ConfigurationError> for Fail {
    fn from(e: ConfigurationError) -> Fail {
        Fail::Configuration(e)
    }
}

fn print_sector(words: &[u16]) {
    for (row, chunk) in words.chunks(8).enumerate() {
        let line: Vec<String> = chunk.iter().map(|w| format!("{w:06o}")).collect();
        println!("{:04o}: {}", row * 8, line.join(" "));
    }
}

fn print_report(report: &InterfaceReport) {
    let card = &report.card;
    println!(
        "DI {}: control {:06o} status {:06o} input {:06o} fifo {} srq {} flag {}",
        report.configuration.select_code,
        card.control_word.bits(),
        card.status_word.bits(),
        card.input_data,
        card.fifo_count,
        card.srq,
        card.flags.flag,
    );
    for unit in &report.units {
        match &unit.image {
            None => println!("unit {}: not attached", unit.unit),
            Some(image) => println!(
                "unit {}: HP {} at address {} on {}; heads {}; {} ({}); DSJ {}; status {}; at {}/{}/{}",
                unit.unit,
                unit.configuration.model,
                unit.configuration.address,
                image,
                if unit.heads_loaded { "loaded" } else { "unloaded" },
                unit.state,
                unit.command,
                unit.dsj,
                unit.status,
                unit.cylinder,
                unit.head,
                unit.sector,
            ),
        }
    }
}

/// Works out the configuration of the unit the image is attached to.
fn unit_configuration(cli: &Cli) -> Result<DiscConfiguration, Fail> {
    let address = match cli.address {
        Some(address) => address,
        None => default_address(cli.unit).ok_or(ConfigurationError::NoSuchUnit(cli.unit))?,
    };
    Ok(DiscConfiguration {
        address,
        model: cli.model,
        protect: cli.protect,
        format: cli.format,
    })
}

fn run_command(driver: &mut HostDriver, command: &Command) -> Result<(), Fail> {
    match command {
        Command::Identify => {
            println!("{:#06x}", driver.identify()?);
        }
        Command::Status => {
            let [first, second] = driver.request_status()?;
            let code = (first >> 8) as u8;
            match StatusCode::try_from(code) {
                Ok(status) => println!("status: {status}"),
                Err(n) => println!("status: unknown ({n:o})"),
            }
            println!("unit: {}", first & 0xFF);
            println!("status-2: {:06o} {:?}", second, Status2::from_bits_truncate(second));
        }
        Command::Seek(a) => {
            driver.seek(a.cylinder, a.head, a.sector)?;
        }
        Command::Read { address: a, output } => {
            let words = driver.read_sector(a.cylinder, a.head, a.sector)?;
            match output {
                None => print_sector(&words),
                Some(path) => {
                    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
                    fs::write(path, bytes).map_err(|e| Fail::HostFile(path.clone(), e))?;
                }
            }
        }
        Command::Write { address: a, input } => {
            let bytes = fs::read(input).map_err(|e| Fail::HostFile(input.clone(), e))?;
            let words: Vec<u16> = bytes
                .chunks(2)
                .take(SECTOR_WORDS)
                .map(|pair| u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
                .collect();
            driver.write_sector(a.cylinder, a.head, a.sector, &words)?;
        }
        Command::Show { json } => {
            let report = driver.report()?;
            if *json {
                let text = serde_json::to_string_pretty(&report)
                    .map_err(|e| Fail::Output(format!("failed to format the report: {e}")))?;
                println!("{text}");
            } else {
                print_report(&report);
            }
        }
    }
    Ok(())
}

fn run_cli() -> Result<(), Fail> {
    let cli = Cli::parse();

    // See
    // https://docs.rs/tracing-subscriber/0.2.19/tracing_subscriber/fmt/index.html#filtering-events-with-environment-variables
    // for instructions on how to select which trace messages get
    // printed.
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let filter_layer = match tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
    {
        Err(e) => {
            return Err(Fail::InitialisationFailure(format!(
                "failed to initialise tracing filter (perhaps there is a problem with environment variables): {e}"
            )));
        }
        Ok(layer) => layer,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let config = unit_configuration(&cli)?;
    let mut iface = DiscInterface::new(CardConfiguration::new(cli.select_code));
    iface.configure(cli.unit, &config)?;
    let image = DiscImage::open(&cli.image).map_err(|e| Fail::HostFile(cli.image.clone(), e))?;
    iface.attach(cli.unit, image)?;

    let span = span!(Level::ERROR, "session", image=?cli.image, unit=cli.unit);
    let _enter = span.enter();
    let mut driver = HostDriver::new(cli.select_code, iface, config.address);
    driver.preset()?;
    let result = run_command(&mut driver, &cli.command);
    match &result {
        Err(e) => event!(Level::ERROR, "{:?} failed: {}", cli.command, e),
        Ok(()) => event!(
            Level::INFO,
            "{:?} finished at simulated time {:?}",
            cli.command,
            driver.now()
        ),
    }
    result
}

fn main() {
    match run_cli() {
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
        Ok(()) => {
            std::process::exit(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn test_address_defaults_to_unit_number() {
        let cli = parse(&["hpdisc", "disc.img", "--unit", "1", "identify"]);
        let config = unit_configuration(&cli).expect("unit 1 exists");
        assert_eq!(config.address, bus_address!(1));

        let mut iface = DiscInterface::new(CardConfiguration::new(cli.select_code));
        iface
            .configure(cli.unit, &config)
            .expect("unit 1 should keep its own address");
    }

    #[test]
    fn test_explicit_address_and_octal_select_code() {
        let cli = parse(&[
            "hpdisc",
            "disc.img",
            "--select-code",
            "27",
            "--address",
            "6",
            "seek",
            "-c",
            "3",
        ]);
        assert_eq!(cli.select_code, select_code!(0o27));
        let config = unit_configuration(&cli).expect("unit 0 exists");
        assert_eq!(config.address, bus_address!(6));
    }

    #[test]
    fn test_unit_out_of_range() {
        let cli = parse(&["hpdisc", "disc.img", "--unit", "4", "status"]);
        assert!(matches!(
            unit_configuration(&cli),
            Err(Fail::Configuration(ConfigurationError::NoSuchUnit(4)))
        ));
    }
}
