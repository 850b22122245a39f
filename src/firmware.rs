use byteorder::{ByteOrder, LE, WriteBytesExt};
use std::io::Write;
use thiserror::Error;

/// Length of the trailer appended to the firmware payload.
pub const TRAILER_LEN: usize = 21;

/// Sentinel that identifies a valid trailer.
pub const TRAILER_MAGIC: u32 = 0xDEADBEEF;

/// A firmware file decoded into its header fields and payload.
///
/// NXT firmware files carry their metadata in a fixed-layout trailer at the
/// very end of the file: five 32-bit little-endian words (magic, RAM size,
/// ROM size, write address, load address) followed by a one-byte SAM-BA
/// flag. Everything before the trailer is the payload that gets transferred
/// to the brick. The payload is borrowed from the input buffer, not copied.
#[derive(Debug, PartialEq)]
pub struct FirmwareImage<'a> {
    /// RAM footprint reported by the image. Informational only; size
    /// enforcement uses the actual payload length.
    pub ram_size: u32,
    /// ROM footprint reported by the image. Informational only.
    pub rom_size: u32,
    /// Where the payload is written for a RAM (exec) deployment.
    pub write_addr: u32,
    /// Where execution starts after a RAM deployment.
    pub load_addr: u32,
    /// True if the image is built to run directly from RAM under SAM-BA;
    /// false if it is built to be programmed into flash. Never both.
    pub samba_flag: bool,
    pub payload: &'a [u8],
}

/// Parse errors for a firmware trailer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrailerError {
    #[error("file is shorter than the firmware trailer: expected at least {TRAILER_LEN} bytes, got {actual}")]
    FileTooShort { actual: usize },

    #[error(
        "bad magic: expected {TRAILER_MAGIC:#010x}, got {actual:#010x}; are you sure this is an NXT firmware file?"
    )]
    BadMagic { actual: u32 },
}

impl<'a> FirmwareImage<'a> {
    /// Decode a raw firmware file. Fails if the buffer cannot hold a trailer
    /// or the magic does not match; mode and size checks are the deployer's
    /// job, since they depend on what the caller is trying to do.
    pub fn parse(raw: &'a [u8]) -> Result<Self, TrailerError> {
        let Some(payload_len) = raw.len().checked_sub(TRAILER_LEN) else {
            return Err(TrailerError::FileTooShort { actual: raw.len() });
        };

        let trailer = &raw[payload_len..];

        let magic = LE::read_u32(&trailer[0..4]);
        if magic != TRAILER_MAGIC {
            return Err(TrailerError::BadMagic { actual: magic });
        }

        Ok(FirmwareImage {
            ram_size: LE::read_u32(&trailer[4..8]),
            rom_size: LE::read_u32(&trailer[8..12]),
            write_addr: LE::read_u32(&trailer[12..16]),
            load_addr: LE::read_u32(&trailer[16..20]),
            samba_flag: trailer[20] != 0,
            payload: &raw[..payload_len],
        })
    }

    /// Append this image's trailer to `out`, after writing the payload. The
    /// inverse of [parse]; used by firmware build tooling.
    pub fn append_trailer(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(self.payload)?;
        out.write_u32::<LE>(TRAILER_MAGIC)?;
        out.write_u32::<LE>(self.ram_size)?;
        out.write_u32::<LE>(self.rom_size)?;
        out.write_u32::<LE>(self.write_addr)?;
        out.write_u32::<LE>(self.load_addr)?;
        out.write_u8(self.samba_flag as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(image: &FirmwareImage) -> Vec<u8> {
        let mut raw = vec![];
        image.append_trailer(&mut raw).unwrap();
        raw
    }

    #[test]
    fn short_buffers_are_rejected() {
        for len in 0..TRAILER_LEN {
            let raw = vec![0xffu8; len];
            assert!(matches!(
                FirmwareImage::parse(&raw),
                Err(TrailerError::FileTooShort { actual }) if actual == len
            ));
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut raw = encode(&FirmwareImage {
            ram_size: 0,
            rom_size: 0,
            write_addr: 0,
            load_addr: 0,
            samba_flag: true,
            payload: b"payload bytes",
        });
        let magic_at = raw.len() - TRAILER_LEN;
        raw[magic_at] ^= 0x01;

        assert!(matches!(
            FirmwareImage::parse(&raw),
            Err(TrailerError::BadMagic { actual: 0xDEADBEEE })
        ));
    }

    #[test]
    fn round_trip_preserves_fields_and_payload() {
        let image = FirmwareImage {
            ram_size: 0x0000_e000,
            rom_size: 0x0004_0000,
            write_addr: 0x0020_2000,
            load_addr: 0x0020_2000,
            samba_flag: true,
            payload: &[0xde, 0xc0, 0xad, 0x0b, 0x00],
        };

        let raw = encode(&image);
        assert_eq!(FirmwareImage::parse(&raw).unwrap(), image);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let image = FirmwareImage {
            ram_size: 0,
            rom_size: 0,
            write_addr: 0x0020_2000,
            load_addr: 0x0020_2000,
            samba_flag: false,
            payload: &[],
        };

        let raw = encode(&image);
        assert_eq!(raw.len(), TRAILER_LEN);
        assert_eq!(FirmwareImage::parse(&raw).unwrap().payload, &[] as &[u8]);
    }

    #[test]
    fn any_nonzero_flag_byte_is_true() {
        let base = FirmwareImage {
            ram_size: 0,
            rom_size: 0,
            write_addr: 0,
            load_addr: 0,
            samba_flag: false,
            payload: b"x",
        };

        for flag in [0x00u8, 0x01, 0x02, 0x80, 0xff] {
            let mut raw = encode(&base);
            *raw.last_mut().unwrap() = flag;
            let parsed = FirmwareImage::parse(&raw).unwrap();
            assert_eq!(parsed.samba_flag, flag != 0, "flag byte {flag:#04x}");
        }
    }
}
