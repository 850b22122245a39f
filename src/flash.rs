use crate::link::{LinkError, SambaLink};
use log::trace;
use thiserror::Error;

/// Base address of on-chip flash in the AT91SAM7's memory map.
pub const FLASH_BASE: u32 = 0x0010_0000;
/// Flash page size; the EFC programs exactly one page per command.
pub const PAGE_SIZE: usize = 256;

// Embedded Flash Controller registers.
const MC_FMR: u32 = 0xFFFF_FF60;
const MC_FCR: u32 = 0xFFFF_FF64;
const MC_FSR: u32 = 0xFFFF_FF68;

// MC_FMR: 1 wait state, microsecond cycle count for a 48 MHz master clock.
const FMR_SETUP: u32 = (0x48 << 16) | (1 << 8);

// MC_FCR: commands take effect only with the key in the top byte.
const FCR_KEY: u32 = 0x5A << 24;
const CMD_WRITE_PAGE: u32 = 0x01;

// MC_FSR bits.
const FSR_FRDY: u32 = 1 << 0;
const FSR_LOCKE: u32 = 1 << 2;
const FSR_PROGE: u32 = 1 << 3;

const READY_POLL_LIMIT: u32 = 100;

/// Failure modes of the flash programming sequence.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlashError {
    #[error("link failure while programming flash")]
    Link(#[from] LinkError),

    #[error("flash controller still busy after programming page {page}")]
    NotReady { page: u32 },

    #[error("flash controller reported a lock error on page {page}; unlock the region first")]
    Locked { page: u32 },

    #[error("flash controller reported a programming error on page {page}")]
    ProgramFailed { page: u32 },
}

/// Program `payload` into on-chip flash starting at [FLASH_BASE].
///
/// Each 256-byte page is staged through the memory-mapped write latch at its
/// final flash address, then committed with a write-page command to the EFC.
/// Erase happens implicitly as part of the command on this part. The last
/// page is padded with `0xff` (the erased state) when the payload does not
/// end on a page boundary.
///
/// A failure partway through leaves the device with a half-programmed image;
/// there is no rollback, and the caller must reflash to recover.
pub fn program(link: &mut impl SambaLink, payload: &[u8]) -> Result<(), FlashError> {
    link.write_word(MC_FMR, FMR_SETUP)?;

    for (index, chunk) in payload.chunks(PAGE_SIZE).enumerate() {
        let page = index as u32;
        let addr = FLASH_BASE + page * PAGE_SIZE as u32;

        if chunk.len() == PAGE_SIZE {
            link.write_buffer(addr, chunk)?;
        } else {
            let mut padded = [0xffu8; PAGE_SIZE];
            padded[..chunk.len()].copy_from_slice(chunk);
            link.write_buffer(addr, &padded)?;
        }

        link.write_word(MC_FCR, FCR_KEY | (page << 8) | CMD_WRITE_PAGE)?;
        wait_ready(link, page)?;

        trace!("Programmed page {page} at {addr:#010x}");
    }

    Ok(())
}

/// Poll MC_FSR until the controller is ready again, surfacing any error bits
/// it raised for the page just committed.
fn wait_ready(link: &mut impl SambaLink, page: u32) -> Result<(), FlashError> {
    for _ in 0..READY_POLL_LIMIT {
        let status = link.read_word(MC_FSR)?;

        if status & FSR_LOCKE != 0 {
            return Err(FlashError::Locked { page });
        }
        if status & FSR_PROGE != 0 {
            return Err(FlashError::ProgramFailed { page });
        }
        if status & FSR_FRDY != 0 {
            return Ok(());
        }
    }

    Err(FlashError::NotReady { page })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeLink, Op};

    #[test]
    fn pages_land_at_sequential_flash_addresses() {
        let (mut link, log) = FakeLink::new();
        link.read_word_result = FSR_FRDY;

        let payload: Vec<u8> = (0..PAGE_SIZE + 4).map(|i| i as u8).collect();
        program(&mut link, &payload).unwrap();

        let mut tail_page = payload[PAGE_SIZE..].to_vec();
        tail_page.resize(PAGE_SIZE, 0xff);

        assert_eq!(
            log.borrow().as_slice(),
            &[
                Op::WriteWord(MC_FMR, FMR_SETUP),
                Op::WriteBuffer(FLASH_BASE, payload[..PAGE_SIZE].to_vec()),
                Op::WriteWord(MC_FCR, FCR_KEY | CMD_WRITE_PAGE),
                Op::ReadWord(MC_FSR),
                Op::WriteBuffer(FLASH_BASE + PAGE_SIZE as u32, tail_page),
                Op::WriteWord(MC_FCR, FCR_KEY | (1 << 8) | CMD_WRITE_PAGE),
                Op::ReadWord(MC_FSR),
            ]
        );
    }

    #[test]
    fn lock_error_names_the_page() {
        let (mut link, _log) = FakeLink::new();
        link.read_word_result = FSR_FRDY | FSR_LOCKE;

        let result = program(&mut link, &[0u8; 1]);
        assert!(matches!(result, Err(FlashError::Locked { page: 0 })));
    }

    #[test]
    fn busy_controller_times_out() {
        let (mut link, _log) = FakeLink::new();
        link.read_word_result = 0;

        let result = program(&mut link, &[0u8; 1]);
        assert!(matches!(result, Err(FlashError::NotReady { page: 0 })));
    }
}
