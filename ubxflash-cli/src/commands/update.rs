//! Update command implementation.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use ubxflash::receiver::generation_name;
use ubxflash::{FirmwareImage, Fis, FlashTable, Progress, SerialConfig, Updater, open_port};

use crate::{Settings, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        bail!("Interrupted");
    }
    Ok(())
}

fn on_off(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Print the effective settings.
fn print_summary(settings: &Settings) {
    let opts = &settings.options;
    let label = |name: &str| style(format!("{name:<14}")).dim();

    eprintln!("{}", style("Setup").bold());
    eprintln!("  {} {}", label("Port"), settings.port);
    eprintln!(
        "  {} {} (safeboot {}, update {})",
        label("Baud rate"),
        settings.baud.current,
        settings.baud.safe,
        settings.baud.update
    );
    let path_or_none = |p: Option<&std::path::PathBuf>| {
        p.map_or_else(|| "-".to_string(), |p| p.display().to_string())
    };
    eprintln!("  {} {}", label("Image"), path_or_none(settings.image.as_ref()));
    eprintln!("  {} {}", label("Flash table"), path_or_none(settings.flash_definition.as_ref()));
    eprintln!("  {} {}", label("FIS"), path_or_none(settings.fis.as_ref()));
    eprintln!("  {} {}", label("Safeboot"), on_off(opts.safeboot));
    eprintln!("  {} {}", label("Reset"), on_off(opts.reset));
    eprintln!("  {} {}", label("Autobaud"), on_off(opts.autobaud));
    eprintln!("  {} {}", label("Training"), on_off(opts.training));
    eprintln!("  {} {}", label("Erase all"), on_off(opts.erase_all));
    eprintln!("  {} {}", label("Erase only"), on_off(opts.erase_only));
    eprintln!("  {} {}", label("Chip erase"), on_off(opts.chip_erase));
    eprintln!("  {} {}", label("Merge FIS"), on_off(!opts.no_fis));
    eprintln!("  {} {}", label("FIS only"), on_off(opts.fis_only));
    eprintln!("  {} {}", label("RAM update"), on_off(opts.update_ram));
    eprintln!("  {} {}", label("USB alt mode"), on_off(opts.usb_alt));
    eprintln!();
}

/// Update command implementation.
pub(crate) fn cmd_update(settings: &Settings, quiet: bool) -> Result<()> {
    if !quiet {
        print_summary(settings);
    }

    // Load the inputs before touching the receiver
    let image = settings
        .image
        .as_ref()
        .map(|path| {
            FirmwareImage::from_file(path)
                .with_context(|| format!("Failed to load firmware image {}", path.display()))
        })
        .transpose()?;
    if let (Some(image), false) = (&image, quiet) {
        eprintln!(
            "{} Image: {} bytes for {}{}",
            style("ℹ").blue(),
            image.len(),
            generation_name(image.generation()),
            image
                .version()
                .map(|v| format!(", version '{v}'"))
                .unwrap_or_default()
        );
    }

    let fis = settings
        .fis
        .as_ref()
        .map(|path| Fis::from_file(path).with_context(|| format!("Failed to load FIS {}", path.display())))
        .transpose()?;

    let flash_table = match &settings.flash_definition {
        Some(path) => FlashTable::from_file(path)
            .with_context(|| format!("Failed to load flash table {}", path.display()))?,
        None => FlashTable::builtin().context("Built-in flash table is invalid")?,
    };

    // Open the port
    let port = open_port(&SerialConfig::new(&settings.port, settings.baud.current))
        .with_context(|| format!("Failed to open port {}", settings.port))?;
    if !quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            settings.port,
            settings.baud.current
        );
    }
    ensure_not_interrupted()?;

    let mut updater = Updater::new(port, settings.options.clone()).with_flash_table(flash_table);
    if let Some(image) = image {
        updater = updater.with_image(image);
    }
    if let Some(fis) = fis {
        updater = updater.with_fis(fis);
    }

    // Create progress bar
    let pb = if quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let result = updater.run(&mut |progress: Progress| {
        let phase = if progress.sectors_erased < progress.sector_count {
            "Erasing"
        } else {
            "Writing"
        };
        pb.set_message(phase);
        pb.set_position(progress.percent());
    });

    let receiver = match result {
        Ok(receiver) => {
            pb.finish_with_message("Complete");
            receiver
        },
        Err(err) => {
            pb.abandon();
            if was_interrupted() {
                return Err(err).context("Update interrupted");
            }
            return Err(err).context("Firmware update failed");
        },
    };

    if !quiet {
        let rom = receiver
            .rom_version
            .map_or_else(|| "unknown ROM".to_string(), |rom| rom.to_string());
        eprintln!(
            "{} {} {} on {} (software '{}')",
            style("ℹ").blue(),
            generation_name(receiver.generation),
            rom,
            receiver.port,
            receiver
                .version
                .software
        );
        eprintln!("\n{} Firmware update completed", style("🎉").green().bold());
    }

    Ok(())
}
