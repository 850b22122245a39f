use anyhow::Result;
use clap::Parser;
use nxt_samba::deploy::{self, DeployMode};
use nxt_samba::firmware::FirmwareImage;
use nxt_samba::link::{SAMBA_PID, SAMBA_VID, SambaBrick, brick_present};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "nxt-samba", version, about)]
enum Opt {
    /// Load a firmware image into RAM and run it (gone at power-off)
    Fwexec {
        /// The firmware .bin file
        file: PathBuf,
    },

    /// Program a firmware image into flash and run it
    Fwflash {
        /// The firmware .bin file
        file: PathBuf,
    },

    /// Decode and print a firmware file's trailer without touching a device
    Fwinfo {
        /// The firmware .bin file
        file: PathBuf,
    },

    /// Report whether a brick in SAM-BA mode is attached
    List,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("NXT_SAMBA_LOG", "info")
            .write_style("NXT_SAMBA_LOG_STYLE"),
    )
    .init();

    match Opt::parse() {
        Opt::Fwexec { file } => run_deploy(&file, DeployMode::Exec)?,
        Opt::Fwflash { file } => run_deploy(&file, DeployMode::Flash)?,
        Opt::Fwinfo { file } => info(&file)?,
        Opt::List => list()?,
    };

    Ok(())
}

fn run_deploy(file: &Path, mode: DeployMode) -> Result<()> {
    let raw = std::fs::read(file)?;
    deploy::deploy(&raw, mode, SambaBrick::open)?;
    println!("Firmware started.");
    Ok(())
}

fn info(file: &Path) -> Result<()> {
    let raw = std::fs::read(file)?;
    let image = FirmwareImage::parse(&raw)?;

    let mode = if image.samba_flag {
        DeployMode::Exec
    } else {
        DeployMode::Flash
    };

    println!("Payload size: {} bytes", image.payload.len());
    println!("RAM size: {} bytes", image.ram_size);
    println!("ROM size: {} bytes", image.rom_size);
    println!("Write address: {:#010x}", image.write_addr);
    println!("Load address: {:#010x}", image.load_addr);
    println!("Deployment mode: {mode}");
    Ok(())
}

fn list() -> Result<()> {
    if brick_present()? {
        println!("{SAMBA_VID:04x}:{SAMBA_PID:04x} NXT brick in SAM-BA mode");
    } else {
        println!("No brick in SAM-BA mode found.");
    }
    Ok(())
}
