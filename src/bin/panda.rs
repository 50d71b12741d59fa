//! `panda flash` and `panda recover`: build the firmware, then push it to every selected device.
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use panda::dfu::PandaDfu;
use panda::panda::{Panda, PandaConfig};

const DFU_TIMEOUT: Duration = Duration::from_secs(30);

/// Flash and recover comma.ai pandas.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Flash the application image to the selected pandas.
    Flash(Target),
    /// Reflash the bootstub through the ST bootloader, then the application.
    Recover(Target),
}

#[derive(Args, Debug)]
struct Target {
    /// Serials of the pandas to process. All connected pandas when empty.
    serials: Vec<String>,
    /// Process all connected pandas, even if serials are given.
    #[arg(long)]
    all: bool,
    /// Root of the firmware tree, where scons is run.
    #[arg(long, default_value = ".")]
    board_dir: PathBuf,
    /// Use the images already in the output directory.
    #[arg(long)]
    skip_build: bool,
}

impl Target {
    fn firmware_dir(&self) -> PathBuf {
        self.board_dir.join("board").join("obj")
    }

    fn serials(&self) -> Result<Vec<String>> {
        if self.all || self.serials.is_empty() {
            Ok(Panda::list().context("Failed to list pandas")?)
        } else {
            Ok(self.serials.clone())
        }
    }

    fn config(&self, serial: &str) -> PandaConfig {
        PandaConfig {
            firmware_dir: self.firmware_dir(),
            ..PandaConfig::with_serial(serial)
        }
    }
}

fn build(board_dir: &Path) -> Result<()> {
    let jobs = std::thread::available_parallelism().map_or(1, |n| n.get());
    info!("building firmware in {}", board_dir.display());

    let status = Command::new("scons")
        .arg("-C")
        .arg(board_dir)
        .arg(format!("-j{}", jobs))
        .status()
        .context("Failed to run scons")?;

    if !status.success() {
        bail!("firmware build failed: {}", status);
    }
    Ok(())
}

fn flash(target: &Target) -> Result<usize> {
    let mut flashed = 0;
    for serial in target.serials()? {
        info!("flashing {}", serial);
        let result = Panda::with_config(target.config(&serial))
            .and_then(|mut panda| panda.flash(None, true));

        match result {
            Ok(()) => flashed += 1,
            Err(e) => error!("failed to flash {}: {}", serial, e),
        }
    }
    Ok(flashed)
}

fn recover(target: &Target) -> Result<usize> {
    let mut recovered = 0;
    for serial in target.serials()? {
        info!("recovering {}", serial);
        let result = Panda::with_config(target.config(&serial))
            .and_then(|mut panda| panda.recover(DFU_TIMEOUT, true));

        match result {
            Ok(true) => recovered += 1,
            Ok(false) => error!("{} did not enter DFU mode", serial),
            Err(e) => error!("failed to recover {}: {}", serial, e),
        }
    }

    // Devices that were already stuck in DFU mode
    for dfu_serial in PandaDfu::list().context("Failed to list DFU devices")? {
        info!("recovering DFU device {}", dfu_serial);
        let result = PandaDfu::new(Some(&dfu_serial))
            .and_then(|mut dfu| dfu.recover(&target.firmware_dir()));

        match result {
            Ok(()) => recovered += 1,
            Err(e) => error!("failed to recover DFU device {}: {}", dfu_serial, e),
        }
    }

    Ok(recovered)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    panda::logging::init();

    let (target, run): (&Target, fn(&Target) -> Result<usize>) = match &cli.command {
        Cmd::Flash(target) => (target, flash),
        Cmd::Recover(target) => (target, recover),
    };

    if !target.skip_build {
        build(&target.board_dir)?;
    }

    let count = run(target)?;
    if count == 0 {
        bail!("no pandas processed");
    }
    info!("done, {} device(s) processed", count);
    Ok(())
}
