use log::{debug, info, trace};
use rusb::{DeviceHandle, GlobalContext};
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Atmel's USB vendor ID.
pub const SAMBA_VID: u16 = 0x03eb;
/// Product ID of the SAM-BA boot monitor on AT91SAM7 parts (the NXT's CPU).
pub const SAMBA_PID: u16 = 0x6124;

// The monitor enumerates as a CDC ACM device; the bulk pipes live on the
// data interface.
const DATA_INTERFACE: u8 = 1;
const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x82;

const IO_TIMEOUT: Duration = Duration::from_secs(1);
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// Operations the SAM-BA monitor offers once a brick is attached.
///
/// Deployment code is written against this trait rather than [SambaBrick] so
/// it never needs hardware to run.
pub trait SambaLink {
    /// Write `data` to the brick's address space starting at `addr`.
    fn write_buffer(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError>;

    /// Write a single 32-bit word at `addr`.
    fn write_word(&mut self, addr: u32, word: u32) -> Result<(), LinkError>;

    /// Read a single 32-bit word at `addr`.
    fn read_word(&mut self, addr: u32) -> Result<u32, LinkError>;

    /// Start executing at `addr`. The monitor does not respond afterwards.
    fn jump(&mut self, addr: u32) -> Result<(), LinkError>;

    /// Release the link. The brick stays in SAM-BA mode unless a jump was
    /// issued.
    fn close(&mut self) -> Result<(), LinkError>;
}

/// All errors that can happen while talking to the SAM-BA monitor.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("no brick in SAM-BA mode found; is it plugged in and in reset mode?")]
    NotFound,

    #[error("USB transaction error while {action}")]
    UsbError {
        source: rusb::Error,
        action: &'static str,
    },

    #[error("short bulk transfer while {action}: {actual} of {expected} bytes")]
    ShortTransfer {
        action: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unexpected response to mode handshake: {0:02x?}")]
    BadHandshake(Vec<u8>),
}

/// Scan the bus once for a brick in SAM-BA mode, without opening it.
pub fn brick_present() -> rusb::Result<bool> {
    for device in rusb::devices()?.iter() {
        let desc = device.device_descriptor()?;
        if desc.vendor_id() == SAMBA_VID && desc.product_id() == SAMBA_PID {
            return Ok(true);
        }
    }
    Ok(false)
}

/// An NXT brick attached over USB with its boot ROM in SAM-BA mode.
///
/// Commands are the monitor's ASCII syntax over the bulk OUT endpoint:
/// `S<addr>,<len>#` followed by raw bytes sends a buffer, `W<addr>,<val>#`
/// writes a word, `w<addr>,#` reads one back, and `G<addr>#` jumps. Replies
/// (where any exist) come back on the bulk IN endpoint.
pub struct SambaBrick {
    handle: DeviceHandle<GlobalContext>,
}

impl SambaBrick {
    /// Poll the bus for a brick in SAM-BA mode until one appears or `timeout`
    /// elapses, then switch its monitor to non-interactive mode.
    pub fn open(timeout: Duration) -> Result<Self, LinkError> {
        let deadline = Instant::now() + timeout;

        let handle = loop {
            match Self::try_open() {
                Ok(Some(handle)) => break handle,
                Ok(None) => {}
                Err(e) => debug!("Probe failed, will retry: {e}"),
            }

            if Instant::now() + DISCOVERY_POLL > deadline {
                return Err(LinkError::NotFound);
            }
            sleep(DISCOVERY_POLL);
        };

        let mut brick = SambaBrick { handle };
        brick.handshake()?;
        info!("Brick found in SAM-BA mode");
        Ok(brick)
    }

    /// One discovery pass. `Ok(None)` means no matching device this time
    /// around; errors here are transient (enumeration races with the device
    /// resetting) and worth retrying.
    fn try_open() -> rusb::Result<Option<DeviceHandle<GlobalContext>>> {
        for device in rusb::devices()?.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() != SAMBA_VID || desc.product_id() != SAMBA_PID {
                continue;
            }

            trace!(
                "Matched {:04x}:{:04x} at bus {} addr {}",
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address()
            );

            let mut handle = device.open()?;
            // The CDC ACM class driver usually owns the monitor's interface.
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(DATA_INTERFACE)?;
            return Ok(Some(handle));
        }

        Ok(None)
    }

    /// Put the monitor in non-interactive mode (`N#`) so replies are terse
    /// binary instead of a human-oriented prompt. The monitor acknowledges
    /// with `\n\r`.
    fn handshake(&mut self) -> Result<(), LinkError> {
        self.send(b"N#", "switching to non-interactive mode")?;

        let mut ack = [0u8; 2];
        self.receive(&mut ack, "reading mode handshake")?;
        if &ack != b"\n\r" {
            return Err(LinkError::BadHandshake(ack.to_vec()));
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8], action: &'static str) -> Result<(), LinkError> {
        let sent = self
            .handle
            .write_bulk(EP_OUT, data, IO_TIMEOUT)
            .map_err(|e| LinkError::UsbError { source: e, action })?;

        if sent != data.len() {
            return Err(LinkError::ShortTransfer {
                action,
                expected: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], action: &'static str) -> Result<(), LinkError> {
        let received = self
            .handle
            .read_bulk(EP_IN, buf, IO_TIMEOUT)
            .map_err(|e| LinkError::UsbError { source: e, action })?;

        if received != buf.len() {
            return Err(LinkError::ShortTransfer {
                action,
                expected: buf.len(),
                actual: received,
            });
        }
        Ok(())
    }
}

impl SambaLink for SambaBrick {
    fn write_buffer(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        trace!("S {addr:#010x} ({} bytes)", data.len());
        let cmd = format!("S{addr:08X},{:08X}#", data.len());
        self.send(cmd.as_bytes(), "announcing buffer write")?;
        self.send(data, "sending buffer contents")
    }

    fn write_word(&mut self, addr: u32, word: u32) -> Result<(), LinkError> {
        trace!("W {addr:#010x} = {word:#010x}");
        let cmd = format!("W{addr:08X},{word:08X}#");
        self.send(cmd.as_bytes(), "writing word")
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, LinkError> {
        let cmd = format!("w{addr:08X},#");
        self.send(cmd.as_bytes(), "requesting word read")?;

        let mut reply = [0u8; 4];
        self.receive(&mut reply, "reading word")?;
        let word = u32::from_le_bytes(reply);
        trace!("w {addr:#010x} -> {word:#010x}");
        Ok(word)
    }

    fn jump(&mut self, addr: u32) -> Result<(), LinkError> {
        trace!("G {addr:#010x}");
        let cmd = format!("G{addr:08X}#");
        self.send(cmd.as_bytes(), "jumping to address")
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.handle
            .release_interface(DATA_INTERFACE)
            .map_err(|e| LinkError::UsbError {
                source: e,
                action: "releasing interface",
            })
    }
}
