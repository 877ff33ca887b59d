//! CRC32-stamped, paged EEPROM framing.
//!
//! The concrete 24C02 device sits behind `EepromDevice`; this module owns
//! only the header layout, CRC verification, and page-bounded write
//! chunking. A device that has never been written (or was written by
//! something else) reads back as "empty" rather than as an error, so the
//! caller falls through to its defaults.

use crate::config::{EEPROM_MAGIC, EEPROM_MAX_PAYLOAD, EEPROM_PAGE_SIZE};
use crate::error::{Error, Result};

const HEADER_SIZE: usize = 8; // magic:u16 + size:u16 + crc32:u32

/// The raw byte-addressable device. A real implementation serializes
/// access through the I2C HAL it shares with the INA226.
pub trait EepromDevice {
    fn total_size(&self) -> usize;
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()>;
    /// Writes a single page-aligned, page-sized (or shorter, for the
    /// final partial page) chunk. Callers are responsible for inserting
    /// the inter-page delay; this call itself is synchronous.
    fn write_page(&self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Reads and validates the header+payload. Returns `Ok(None)` for an
/// empty/clean device (bad magic or oversized length); the caller uses
/// its defaults.
pub fn read_payload(device: &dyn EepromDevice) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_SIZE];
    device.read(0, &mut header)?;
    let magic = u16::from_le_bytes([header[0], header[1]]);
    let size = u16::from_le_bytes([header[2], header[3]]);
    let crc_expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if magic != EEPROM_MAGIC || size as usize > EEPROM_MAX_PAYLOAD {
        return Ok(None);
    }

    let mut payload = vec![0u8; size as usize];
    device.read(HEADER_SIZE, &mut payload)?;
    let crc_actual = crc32fast::hash(&payload);
    if crc_actual != crc_expected {
        return Err(Error::EepromCrcMismatch { expected: crc_expected, actual: crc_actual });
    }
    Ok(Some(payload))
}

/// Writes a header+payload, chunked at `EEPROM_PAGE_SIZE`-byte page
/// boundaries. Returns the number of page writes issued, so callers can
/// budget the inter-page delay (`EEPROM_PAGE_WRITE_DELAY_MS` per page).
pub fn write_payload(device: &dyn EepromDevice, payload: &[u8]) -> Result<usize> {
    if payload.len() > EEPROM_MAX_PAYLOAD {
        return Err(Error::EepromPayloadTooLarge { len: payload.len() });
    }
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&EEPROM_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);

    let mut pages_written = 0;
    for (i, chunk) in frame.chunks(EEPROM_PAGE_SIZE).enumerate() {
        device.write_page(i * EEPROM_PAGE_SIZE, chunk)?;
        pages_written += 1;
    }
    Ok(pages_written)
}
