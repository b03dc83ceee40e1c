//! ubxflash CLI - Command-line tool for updating u-blox GNSS receivers.
//!
//! ## Features
//!
//! - Flash firmware images to u-blox 5 to 9 receivers
//! - Run images from RAM on u-blox 9
//! - Erase flash or write only the FIS
//! - Serial, USB CDC and serial-over-TCP ports
//! - Environment variable and configuration file support

use clap::Parser;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use ubxflash::UpdateOptions;
use ubxflash::port::is_bus_bridge_name;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Exit code for malformed arguments.
const EXIT_USAGE: u8 = 1;

/// Exit code for a failed update.
const EXIT_FAILURE: u8 = 2;

#[cfg(windows)]
const DEFAULT_PORT: &str = "COM1";
#[cfg(not(windows))]
const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// ubxflash - Firmware update tool for u-blox GNSS receivers.
///
/// Environment variables:
///   UBXFLASH_PORT   - Default port
///   UBXFLASH_BAUD   - Default baud rates (CUR[:SAFE[:UPD]])
#[derive(Parser, Debug)]
#[command(name = "ubxflash")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "Examples:\n  \
    ubxflash -p /dev/ttyACM0 -b 9600:9600:115200 -F flash.fis firmware.bin\n  \
    ubxflash -p 192.168.1.20:4001 -E 1")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Port: serial device, COMx, or host:port for serial-over-TCP.
    #[arg(short, long, env = "UBXFLASH_PORT")]
    port: Option<String>,

    /// Baud rates: current, safeboot and update [default: 9600:9600:115200].
    #[arg(
        short,
        long,
        env = "UBXFLASH_BAUD",
        value_name = "CUR[:SAFE[:UPD]]",
        value_parser = parse_baud
    )]
    baud: Option<BaudRates>,

    /// Flash organization table for receivers before u-blox 7.
    #[arg(short = 'f', long = "flash-def", value_name = "FILE")]
    flash_def: Option<PathBuf>,

    /// Flash information structure (FIS) file.
    #[arg(short = 'F', long, value_name = "FILE")]
    fis: Option<PathBuf>,

    /// Enter safeboot before updating [default: 1].
    #[arg(short = 's', long, value_name = "0|1", value_parser = parse_switch)]
    safeboot: Option<bool>,

    /// Reboot the receiver when done [default: 1].
    #[arg(short = 'R', long, value_name = "0|1", value_parser = parse_switch)]
    reset: Option<bool>,

    /// Detect the receiver's baud rate [default: 0].
    #[arg(short = 'a', long, value_name = "0|1", value_parser = parse_switch)]
    autobaud: Option<bool>,

    /// Erase the whole flash [default: 1].
    #[arg(short = 'e', long = "erase-all", value_name = "0|1", value_parser = parse_switch)]
    erase_all: Option<bool>,

    /// Only erase the flash, no image needed [default: 0].
    #[arg(short = 'E', long = "erase-only", value_name = "0|1", value_parser = parse_switch)]
    erase_only: Option<bool>,

    /// Send the training sequence [default: 1].
    #[arg(short = 't', long, value_name = "0|1", value_parser = parse_switch)]
    training: Option<bool>,

    /// Erase the whole chip with one command [default: 0].
    #[arg(short = 'C', long = "chip-erase", value_name = "0|1", value_parser = parse_switch)]
    chip_erase: Option<bool>,

    /// Only write the FIS.
    #[arg(long = "fis-only")]
    fis_only: bool,

    /// Do not merge the FIS into the image.
    #[arg(long = "no-fis")]
    no_fis: bool,

    /// Run the image from RAM (u-blox 9 only).
    #[arg(long = "up-ram")]
    up_ram: bool,

    /// Enter the loader by invalidating the flash image over USB.
    #[arg(long = "usb-alt")]
    usb_alt: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Firmware image.
    image: Option<PathBuf>,
}

/// Baud rates of the three phases of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BaudRates {
    /// Rate the receiver runs at now.
    pub current: u32,
    /// Rate of the safeboot loader.
    pub safe: u32,
    /// Rate used for the transfer.
    pub update: u32,
}

impl Default for BaudRates {
    fn default() -> Self {
        Self {
            current: 9600,
            safe: 9600,
            update: 115_200,
        }
    }
}

/// Parse `CUR[:SAFE[:UPD]]`. A missing SAFE repeats CUR, a missing UPD repeats SAFE.
fn parse_baud(s: &str) -> Result<BaudRates, String> {
    let rates = s
        .split(':')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .ok()
                .filter(|&rate| rate > 0)
                .ok_or_else(|| format!("Invalid baud rate: '{part}'"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    match rates.as_slice() {
        [current] => Ok(BaudRates {
            current: *current,
            safe: *current,
            update: *current,
        }),
        [current, safe] => Ok(BaudRates {
            current: *current,
            safe: *safe,
            update: *safe,
        }),
        [current, safe, update] => Ok(BaudRates {
            current: *current,
            safe: *safe,
            update: *update,
        }),
        _ => Err(format!(
            "Invalid format: '{s}'. Expected CUR[:SAFE[:UPD]] (e.g., '9600:9600:115200')"
        )),
    }
}

/// Parse an on/off switch value.
fn parse_switch(s: &str) -> Result<bool, String> {
    match s
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(format!("Invalid switch value: '{s}' (expected 0 or 1)")),
    }
}

/// Effective settings after merging arguments, environment and config files.
#[derive(Debug)]
pub(crate) struct Settings {
    /// Port name.
    pub port: String,
    /// Baud rates.
    pub baud: BaudRates,
    /// Firmware image path.
    pub image: Option<PathBuf>,
    /// Flash organization table path.
    pub flash_definition: Option<PathBuf>,
    /// FIS path.
    pub fis: Option<PathBuf>,
    /// Library options.
    pub options: UpdateOptions,
}

impl Settings {
    fn resolve(cli: &Cli, config: &Config) -> Result<Self, String> {
        let connection = &config.connection;
        let update = &config.update;

        let port = cli
            .port
            .clone()
            .or_else(|| connection.port.clone())
            .unwrap_or_else(|| DEFAULT_PORT.to_string());

        let baud = cli
            .baud
            .unwrap_or_else(|| {
                let defaults = BaudRates::default();
                BaudRates {
                    current: connection.baud.unwrap_or(defaults.current),
                    safe: connection.safe_baud.unwrap_or(defaults.safe),
                    update: connection.update_baud.unwrap_or(defaults.update),
                }
            });

        let defaults = UpdateOptions::default();
        let mut options = UpdateOptions {
            safe_baud: baud.safe,
            update_baud: baud.update,
            safeboot: cli.safeboot.or(update.safeboot).unwrap_or(defaults.safeboot),
            reset: cli.reset.or(update.reset).unwrap_or(defaults.reset),
            autobaud: cli.autobaud.or(update.autobaud).unwrap_or(defaults.autobaud),
            training: cli.training.or(update.training).unwrap_or(defaults.training),
            erase_all: cli.erase_all.or(update.erase_all).unwrap_or(defaults.erase_all),
            chip_erase: cli.chip_erase.or(update.chip_erase).unwrap_or(defaults.chip_erase),
            erase_only: cli.erase_only.unwrap_or(defaults.erase_only),
            fis_only: cli.fis_only,
            no_fis: cli.no_fis,
            update_ram: cli.up_ram,
            usb_alt: cli.usb_alt,
            ..defaults
        };

        // I2C and SPI bridges must not see the training sequence
        if is_bus_bridge_name(&port) {
            options.training = false;
        }

        if cli.image.is_none() && !options.without_image() {
            return Err("No firmware image given".to_string());
        }

        Ok(Self {
            port,
            baud,
            image: cli.image.clone(),
            flash_definition: cli
                .flash_def
                .clone()
                .or_else(|| update.flash_definition.clone()),
            fis: cli
                .fis
                .clone()
                .or_else(|| update.fis.clone()),
            options,
        })
    }

    /// Reject input files that do not exist, before anything is loaded.
    fn check_inputs(&self) -> Result<(), String> {
        let inputs = [
            ("Firmware image", &self.image),
            ("Flash table", &self.flash_definition),
            ("FIS", &self.fis),
        ];
        for (what, path) in inputs {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(format!("{what} not found: {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout and are not errors
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        },
    };

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "ubxflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    ubxflash::set_interrupt_checker(was_interrupted);

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let settings = match Settings::resolve(&cli, &config)
        .and_then(|settings| settings.check_inputs().map(|()| settings))
    {
        Ok(settings) => settings,
        Err(msg) => {
            eprintln!("{} {msg}", style("Error:").red().bold());
            eprintln!("\nFor more information, try '--help'.");
            return ExitCode::from(EXIT_USAGE);
        },
    };

    match commands::update::cmd_update(&settings, cli.quiet) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(EXIT_FAILURE)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ubxflash").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_baud_single() {
        assert_eq!(
            parse_baud("38400"),
            Ok(BaudRates {
                current: 38400,
                safe: 38400,
                update: 38400,
            })
        );
    }

    #[test]
    fn test_parse_baud_two_values() {
        assert_eq!(
            parse_baud("9600:115200"),
            Ok(BaudRates {
                current: 9600,
                safe: 115200,
                update: 115200,
            })
        );
    }

    #[test]
    fn test_parse_baud_three_values() {
        assert_eq!(
            parse_baud("9600:9600:921600"),
            Ok(BaudRates {
                current: 9600,
                safe: 9600,
                update: 921600,
            })
        );
    }

    #[test]
    fn test_parse_baud_invalid() {
        assert!(parse_baud("").is_err());
        assert!(parse_baud("fast").is_err());
        assert!(parse_baud("0").is_err());
        assert!(parse_baud("9600:").is_err());
        assert!(parse_baud("1:2:3:4").is_err());
    }

    #[test]
    fn test_parse_switch() {
        assert_eq!(parse_switch("1"), Ok(true));
        assert_eq!(parse_switch("TRUE"), Ok(true));
        assert_eq!(parse_switch("0"), Ok(false));
        assert_eq!(parse_switch("false"), Ok(false));
        assert!(parse_switch("2").is_err());
    }

    #[test]
    fn test_cli_parse_switches() {
        let cli = parse(&["-s", "0", "-R", "false", "-C", "1", "--no-fis", "fw.bin"]);
        assert_eq!(cli.safeboot, Some(false));
        assert_eq!(cli.reset, Some(false));
        assert_eq!(cli.chip_erase, Some(true));
        assert!(cli.no_fis);
        assert_eq!(cli.image, Some(PathBuf::from("fw.bin")));
    }

    #[test]
    fn test_cli_rejects_bad_switch() {
        assert!(Cli::try_parse_from(["ubxflash", "-s", "maybe", "fw.bin"]).is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let cli = parse(&["-p", "/dev/ttyUSB3", "fw.bin"]);
        let settings = Settings::resolve(&cli, &Config::default()).unwrap();
        assert_eq!(settings.port, "/dev/ttyUSB3");
        assert_eq!(settings.baud, BaudRates::default());
        assert!(settings.options.safeboot);
        assert!(settings.options.reset);
        assert!(settings.options.training);
        assert!(settings.options.erase_all);
        assert!(!settings.options.autobaud);
        assert!(!settings.options.chip_erase);
        assert_eq!(settings.options.safe_baud, 9600);
        assert_eq!(settings.options.update_baud, 115200);
    }

    #[test]
    fn test_settings_cli_overrides_config() {
        let mut config = Config::default();
        config.connection.port = Some("COM7".to_string());
        config.connection.update_baud = Some(460800);
        config.update.safeboot = Some(false);
        config.update.reset = Some(false);
        config.update.fis = Some(PathBuf::from("flash.fis"));

        let cli = parse(&["-R", "1", "fw.bin"]);
        let settings = Settings::resolve(&cli, &config).unwrap();
        assert_eq!(settings.port, "COM7");
        assert_eq!(settings.baud.update, 460800);
        assert!(!settings.options.safeboot);
        assert!(settings.options.reset);
        assert_eq!(settings.fis, Some(PathBuf::from("flash.fis")));

        let cli = parse(&["-b", "115200", "fw.bin"]);
        let settings = Settings::resolve(&cli, &config).unwrap();
        assert_eq!(settings.baud.update, 115200);
    }

    #[test]
    fn test_settings_require_image() {
        let cli = parse(&["-p", "/dev/ttyACM0"]);
        assert!(Settings::resolve(&cli, &Config::default()).is_err());

        let cli = parse(&["-p", "/dev/ttyACM0", "-E", "1"]);
        assert!(Settings::resolve(&cli, &Config::default()).is_ok());

        let cli = parse(&["-p", "/dev/ttyACM0", "--fis-only"]);
        assert!(Settings::resolve(&cli, &Config::default()).is_ok());
    }

    #[test]
    fn test_settings_check_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fw.bin");
        std::fs::write(&image, [0u8; 16]).unwrap();

        let cli = parse(&["-p", "/dev/ttyACM0", image.to_str().unwrap()]);
        let settings = Settings::resolve(&cli, &Config::default()).unwrap();
        assert!(settings.check_inputs().is_ok());

        let missing = dir.path().join("missing.bin");
        let cli = parse(&["-p", "/dev/ttyACM0", missing.to_str().unwrap()]);
        let settings = Settings::resolve(&cli, &Config::default()).unwrap();
        let err = settings.check_inputs().unwrap_err();
        assert!(err.contains("Firmware image not found"));

        let cli = parse(&["-p", "/dev/ttyACM0", "-F", missing.to_str().unwrap(), "-E", "1"]);
        let settings = Settings::resolve(&cli, &Config::default()).unwrap();
        assert!(settings.check_inputs().unwrap_err().contains("FIS not found"));
    }

    #[test]
    fn test_settings_bus_bridge_disables_training() {
        let cli = parse(&["-p", "SPI0", "-t", "1", "fw.bin"]);
        let settings = Settings::resolve(&cli, &Config::default()).unwrap();
        assert!(!settings.options.training);
    }
}
