/// Decode and validate NXT firmware files and the trailer they carry.
pub mod firmware;

/// Talk to the SAM-BA boot monitor of a USB-attached brick.
pub mod link;

/// Program a payload into on-chip flash through an open link.
pub mod flash;

/// Drive a full deployment from raw firmware bytes to a running brick.
pub mod deploy;

#[cfg(test)]
mod testutil;
