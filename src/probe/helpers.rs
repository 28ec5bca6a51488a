use super::core::{CapacityClass, SdError, OCR_CCS, OCR_VOLTAGE_MASK, SD_SECTOR_SIZE};

/// Bus argument for a logical sector: byte offset on standard-capacity
/// cards, the block index itself on SDHC/SDXC.
pub(super) fn sector_address<E>(
    capacity: CapacityClass,
    sector: u32,
) -> Result<u32, SdError<E>> {
    match capacity {
        CapacityClass::High => Ok(sector),
        CapacityClass::Standard => sector
            .checked_mul(SD_SECTOR_SIZE as u32)
            .ok_or(SdError::InvalidRange),
    }
}

pub(super) fn frame_command(cmd: u8, arg: u32) -> [u8; 6] {
    let mut frame = [0u8; 6];
    frame[0] = 0x40 | (cmd & 0x3F);
    frame[1..5].copy_from_slice(&arg.to_be_bytes());
    frame[5] = crate::crc::crc7(&frame[..5]);
    frame
}

pub(super) fn ocr_supports_voltage(ocr: &[u8; 4]) -> bool {
    (ocr[1] & OCR_VOLTAGE_MASK) != 0
}

pub(super) fn ocr_capacity(ocr: &[u8; 4]) -> CapacityClass {
    if (ocr[0] & OCR_CCS) != 0 {
        CapacityClass::High
    } else {
        CapacityClass::Standard
    }
}
