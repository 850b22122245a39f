use crate::firmware::{FirmwareImage, TrailerError};
use crate::flash::{self, FLASH_BASE, FlashError};
use crate::link::{LinkError, SambaLink};
use log::{info, warn};
use std::fmt::Display;
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// How long to wait for a brick to appear on the bus.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

// The boot ROM needs a moment between the last transfer and a cold jump.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Exec payloads must fit in the RAM region above the monitor's workspace.
pub const EXEC_SIZE_LIMIT: usize = 56 * 1024;
/// Flash payloads must fit in on-chip flash.
pub const FLASH_SIZE_LIMIT: usize = 256 * 1024;

/// The two ways a firmware image can be deployed. Any given image is
/// eligible for exactly one of them, declared by its trailer's SAM-BA flag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeployMode {
    /// Load into RAM and run; gone at the next power cycle.
    Exec,
    /// Program into flash; permanent.
    Flash,
}

impl DeployMode {
    pub fn size_limit(self) -> usize {
        match self {
            DeployMode::Exec => EXEC_SIZE_LIMIT,
            DeployMode::Flash => FLASH_SIZE_LIMIT,
        }
    }
}

impl Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeployMode::Exec => write!(f, "exec"),
            DeployMode::Flash => write!(f, "flash"),
        }
    }
}

/// Everything that can go wrong during a deployment, in the order the steps
/// run. The first three are detected from the input alone, before any device
/// contact.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeployError {
    #[error("invalid firmware image")]
    InvalidHeader(#[from] TrailerError),

    #[error("firmware image is built for {eligible} deployment, but {requested} was requested")]
    ModeMismatch {
        requested: DeployMode,
        eligible: DeployMode,
    },

    #[error("firmware too large for {mode} deployment: maximum {limit} bytes, actual {actual} bytes")]
    ImageTooLarge {
        mode: DeployMode,
        limit: usize,
        actual: usize,
    },

    #[error("no brick found in SAM-BA mode within {} seconds", DISCOVERY_TIMEOUT.as_secs())]
    DeviceNotFound(#[source] LinkError),

    #[error("failed to upload firmware to RAM")]
    TransferFailure(#[source] LinkError),

    #[error("failed to program firmware into flash")]
    FlashFailure(#[source] FlashError),

    #[error("failed to start the firmware")]
    JumpFailure(#[source] LinkError),
}

/// Deploy a raw firmware file to the brick.
///
/// Validates the image and the requested mode, then acquires a link through
/// `connect`, transfers the payload (directly to RAM for [DeployMode::Exec],
/// through the flash programmer for [DeployMode::Flash]), and jumps to the
/// entry point. The link is closed on every path once it was opened; a close
/// failure is logged rather than allowed to mask the real outcome.
///
/// Validation failures never touch the device. Device failures are not
/// retried, and a failure mid-flash can leave the brick non-bootable until
/// it is reflashed.
pub fn deploy<L, C>(raw: &[u8], mode: DeployMode, connect: C) -> Result<(), DeployError>
where
    L: SambaLink,
    C: FnOnce(Duration) -> Result<L, LinkError>,
{
    let image = FirmwareImage::parse(raw)?;

    let eligible = if image.samba_flag {
        DeployMode::Exec
    } else {
        DeployMode::Flash
    };
    if mode != eligible {
        return Err(DeployError::ModeMismatch {
            requested: mode,
            eligible,
        });
    }

    // The trailer's own size fields are not trusted for this.
    let limit = mode.size_limit();
    if image.payload.len() > limit {
        return Err(DeployError::ImageTooLarge {
            mode,
            limit,
            actual: image.payload.len(),
        });
    }

    info!("Looking for the NXT in SAM-BA mode...");
    let mut link = connect(DISCOVERY_TIMEOUT).map_err(DeployError::DeviceNotFound)?;

    let result = transfer_and_start(&mut link, &image, mode);

    if let Err(e) = link.close() {
        warn!("Failed to close link: {e}");
    }

    result
}

fn transfer_and_start<L: SambaLink>(
    link: &mut L,
    image: &FirmwareImage,
    mode: DeployMode,
) -> Result<(), DeployError> {
    let entry = match mode {
        DeployMode::Exec => {
            info!(
                "Uploading {} bytes to {:#010x}...",
                image.payload.len(),
                image.write_addr
            );
            link.write_buffer(image.write_addr, image.payload)
                .map_err(DeployError::TransferFailure)?;
            image.load_addr
        }
        DeployMode::Flash => {
            info!("Programming {} bytes into flash...", image.payload.len());
            flash::program(link, image.payload).map_err(DeployError::FlashFailure)?;
            FLASH_BASE
        }
    };

    sleep(SETTLE_DELAY);

    info!("Jumping to {entry:#010x}...");
    link.jump(entry).map_err(DeployError::JumpFailure)?;
    Ok(())
}
