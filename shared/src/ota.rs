//! Over-the-air firmware updates: request payload, image streaming and boot slot selection.
//!
//! Flash layout follows the ESP-IDF two slot scheme (see `node/partitions.csv`). The
//! bootloader reads the two `otadata` sectors, takes the valid entry with the highest
//! sequence number and boots slot `(seq - 1) % 2`.

use crc_all::Crc;
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use serde::Deserialize;

use crate::http::HttpError;
use crate::Error;

pub const SECTOR_SIZE: usize = 4096;

/// First byte of every ESP application image.
pub const IMAGE_MAGIC: u8 = 0xe9;

const SLOT_COUNT: u32 = 2;
const ENTRY_LEN: usize = 32;
const UNSET: u32 = u32::MAX;

/// Payload of the `update_firmware` action.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtaRequest<'a> {
    pub url: &'a str,
    pub version: &'a str,
    #[serde(rename = "content-length")]
    pub content_length: u32,
}

impl<'a> OtaRequest<'a> {
    pub fn parse(payload: &'a str) -> Result<Self, Error> {
        let (request, _) = serde_json_core::from_str::<OtaRequest<'a>>(payload)?;
        Ok(request)
    }

    pub fn validate(&self, layout: &PartitionLayout) -> Result<(), OtaError> {
        if self.content_length == 0 {
            return Err(OtaError::EmptyImage);
        }
        if self.content_length > layout.slot_size {
            return Err(OtaError::ImageTooLarge);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaError {
    EmptyImage,
    ImageTooLarge,
    /// Image does not start with the ESP image magic
    InvalidImage,
    /// Download ended before the announced length
    Incomplete { expected: u32, received: u32 },
    Http(HttpError),
    Flash(FlashError),
    Network,
}

impl OtaError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::EmptyImage => "Firmware image is empty",
            Self::ImageTooLarge => "Firmware image does not fit the update partition",
            Self::InvalidImage => "Not an application image",
            Self::Incomplete { .. } => "Firmware download incomplete",
            Self::Http(HttpError::UnsupportedScheme) => "Only http downloads are supported",
            Self::Http(_) => "Firmware download failed",
            Self::Flash(_) => "Flash write failed",
            Self::Network => "Network error during download",
        }
    }
}

impl From<HttpError> for OtaError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl core::fmt::Display for OtaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Incomplete { expected, received } => {
                write!(f, "received {} of {} bytes", received, expected)
            }
            Self::Http(e) => write!(f, "{}", e),
            _ => f.write_str(self.message()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    NotAligned,
    OutOfBounds,
    Other,
}

fn flash_error<E: NorFlashError>(e: E) -> OtaError {
    OtaError::Flash(match e.kind() {
        NorFlashErrorKind::NotAligned => FlashError::NotAligned,
        NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
        _ => FlashError::Other,
    })
}

/// Offsets of the partitions involved in an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionLayout {
    pub otadata: u32,
    pub slots: [u32; 2],
    pub slot_size: u32,
}

impl PartitionLayout {
    pub const fn slot_offset(&self, slot: Slot) -> u32 {
        self.slots[slot as usize]
    }
}

impl Default for PartitionLayout {
    fn default() -> Self {
        Self {
            otadata: 0xd000,
            slots: [0x10000, 0x110000],
            slot_size: 0x100000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Slot {
    Ota0 = 0,
    Ota1 = 1,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Self::Ota0 => Self::Ota1,
            Self::Ota1 => Self::Ota0,
        }
    }

    fn from_seq(seq: u32) -> Self {
        if (seq - 1) % SLOT_COUNT == 0 {
            Self::Ota0
        } else {
            Self::Ota1
        }
    }
}

/// Download progress, reported once per `step` percent.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Progress {
    total: u32,
    done: u32,
    step: u8,
    reported: u8,
}

impl Progress {
    pub fn new(total: u32, step: u8) -> Self {
        Self {
            total,
            done: 0,
            step: step.max(1),
            reported: 0,
        }
    }

    pub fn done(&self) -> u32 {
        self.done
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.done.min(self.total) as u64 * 100 / self.total as u64) as u8
    }

    /// Records `bytes` more and returns the percentage if a new step was reached.
    pub fn advance(&mut self, bytes: usize) -> Option<u8> {
        self.done = self.done.saturating_add(bytes as u32);
        let percent = self.percent();
        let step = percent - percent % self.step;
        if step > self.reported {
            self.reported = step;
            Some(percent)
        } else {
            None
        }
    }
}

/// Streams an image into a slot, one erased sector at a time.
pub struct ImageWriter<F> {
    flash: F,
    base: u32,
    sector: [u8; SECTOR_SIZE],
    filled: usize,
    flushed: u32,
    progress: Progress,
}

impl<F: NorFlash> ImageWriter<F> {
    pub fn new(flash: F, layout: &PartitionLayout, slot: Slot, size: u32) -> Result<Self, OtaError> {
        if size == 0 {
            return Err(OtaError::EmptyImage);
        }
        if size > layout.slot_size {
            return Err(OtaError::ImageTooLarge);
        }
        Ok(Self {
            flash,
            base: layout.slot_offset(slot),
            sector: [0xff; SECTOR_SIZE],
            filled: 0,
            flushed: 0,
            progress: Progress::new(size, 10),
        })
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Appends a chunk of the image, returns the progress percentage when a step is reached.
    pub fn write(&mut self, mut data: &[u8]) -> Result<Option<u8>, OtaError> {
        if self.progress.done() == 0 && data.first().is_some_and(|b| *b != IMAGE_MAGIC) {
            return Err(OtaError::InvalidImage);
        }
        if self.progress.done() as usize + data.len() > self.progress.total as usize {
            return Err(OtaError::ImageTooLarge);
        }

        let report = self.progress.advance(data.len());
        while !data.is_empty() {
            let take = data.len().min(SECTOR_SIZE - self.filled);
            self.sector[self.filled..self.filled + take].copy_from_slice(&data[..take]);
            self.filled += take;
            data = &data[take..];

            if self.filled == SECTOR_SIZE {
                self.flush()?;
            }
        }
        Ok(report)
    }

    /// Writes the last partial sector and hands the flash back.
    pub fn finish(mut self) -> Result<F, OtaError> {
        let expected = self.progress.total;
        let received = self.progress.done();
        if received != expected {
            return Err(OtaError::Incomplete { expected, received });
        }
        if self.filled > 0 {
            self.sector[self.filled..].fill(0xff);
            self.flush()?;
        }
        Ok(self.flash)
    }

    fn flush(&mut self) -> Result<(), OtaError> {
        let offset = self.base + self.flushed;
        self.flash
            .erase(offset, offset + SECTOR_SIZE as u32)
            .map_err(flash_error)?;
        self.flash.write(offset, &self.sector).map_err(flash_error)?;
        self.flushed += SECTOR_SIZE as u32;
        self.filled = 0;
        self.sector.fill(0xff);
        Ok(())
    }
}

/// One of the two `otadata` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SelectEntry {
    pub seq: u32,
    pub state: u32,
    pub crc: u32,
}

impl SelectEntry {
    pub fn new(seq: u32) -> Self {
        Self {
            seq,
            state: UNSET,
            crc: seq_crc(seq),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.seq != UNSET && self.seq != 0 && self.crc == seq_crc(self.seq)
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_LEN] {
        let mut raw = [0xff; ENTRY_LEN];
        raw[..4].copy_from_slice(&self.seq.to_le_bytes());
        raw[24..28].copy_from_slice(&self.state.to_le_bytes());
        raw[28..32].copy_from_slice(&self.crc.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8; ENTRY_LEN]) -> Self {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Self {
            seq: word(0),
            state: word(24),
            crc: word(28),
        }
    }
}

/// CRC-32 of the sequence number, as computed by the ROM `crc32_le(UINT32_MAX, ..)`.
fn seq_crc(seq: u32) -> u32 {
    let mut crc = Crc::<u32>::new(0x04c1_1db7, 32, 0x0000_0000, 0xffff_ffff, true);
    crc.init();
    crc.update(&seq.to_le_bytes());
    crc.finish()
}

/// Contents of the `otadata` partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Otadata {
    pub entries: [SelectEntry; 2],
}

impl Otadata {
    pub fn read<F: NorFlash>(flash: &mut F, layout: &PartitionLayout) -> Result<Self, OtaError> {
        let mut entries = [SelectEntry::new(UNSET); 2];
        for (sector, entry) in entries.iter_mut().enumerate() {
            let mut raw = [0u8; ENTRY_LEN];
            flash
                .read(layout.otadata + (sector * SECTOR_SIZE) as u32, &mut raw)
                .map_err(flash_error)?;
            *entry = SelectEntry::from_bytes(&raw);
        }
        Ok(Self { entries })
    }

    /// Index of the sector holding the highest valid sequence number.
    fn current(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
            .max_by_key(|(_, entry)| entry.seq)
            .map(|(index, _)| index)
    }

    /// Slot the bootloader starts, the first slot when nothing was ever selected.
    pub fn boot_slot(&self) -> Slot {
        self.current()
            .map(|index| Slot::from_seq(self.entries[index].seq))
            .unwrap_or(Slot::Ota0)
    }

    /// Slot an update has to be written to.
    pub fn target_slot(&self) -> Slot {
        self.boot_slot().other()
    }

    /// Marks `slot` as the one to boot and returns the sector index that was written.
    pub fn activate<F: NorFlash>(
        &mut self,
        flash: &mut F,
        layout: &PartitionLayout,
        slot: Slot,
    ) -> Result<usize, OtaError> {
        let (sector, mut seq) = match self.current() {
            Some(index) => (1 - index, self.entries[index].seq + 1),
            None => (0, 1),
        };
        while Slot::from_seq(seq) != slot {
            seq += 1;
        }

        let entry = SelectEntry::new(seq);
        let offset = layout.otadata + (sector * SECTOR_SIZE) as u32;
        flash
            .erase(offset, offset + SECTOR_SIZE as u32)
            .map_err(flash_error)?;
        flash.write(offset, &entry.to_bytes()).map_err(flash_error)?;
        self.entries[sector] = entry;
        Ok(sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_storage::nor_flash::ErrorType;

    /// Flash model checking erase-before-write.
    struct RamFlash {
        data: Vec<u8>,
    }

    impl RamFlash {
        fn new(size: usize) -> Self {
            Self {
                data: vec![0xff; size],
            }
        }
    }

    impl ErrorType for RamFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for RamFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.data.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            bytes.copy_from_slice(&self.data[start..end]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for RamFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR_SIZE;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from as usize % SECTOR_SIZE != 0 || to as usize % SECTOR_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            if to as usize > self.data.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            self.data[from as usize..to as usize].fill(0xff);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.data.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            for (cell, byte) in self.data[start..end].iter_mut().zip(bytes) {
                assert_eq!(*cell, 0xff, "write to unerased flash at {:#x}", offset);
                *cell = *byte;
            }
            Ok(())
        }
    }

    fn small_layout() -> PartitionLayout {
        PartitionLayout {
            otadata: 0,
            slots: [2 * SECTOR_SIZE as u32, 6 * SECTOR_SIZE as u32],
            slot_size: 4 * SECTOR_SIZE as u32,
        }
    }

    fn image(len: usize) -> Vec<u8> {
        let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        image[0] = IMAGE_MAGIC;
        image
    }

    #[test]
    fn parse_request() {
        let request = OtaRequest::parse(
            r#"{"url":"http://10.42.0.1/fw.bin","version":"1.2.0","content-length":524288}"#,
        )
        .unwrap();

        assert_eq!(request.url, "http://10.42.0.1/fw.bin");
        assert_eq!(request.version, "1.2.0");
        assert_eq!(request.content_length, 524288);
        assert_eq!(request.validate(&PartitionLayout::default()), Ok(()));
    }

    #[test]
    fn validate_request() {
        let mut request = OtaRequest {
            url: "http://host/fw.bin",
            version: "1.0.0",
            content_length: 0,
        };
        let layout = PartitionLayout::default();
        assert_eq!(request.validate(&layout), Err(OtaError::EmptyImage));

        request.content_length = layout.slot_size + 1;
        assert_eq!(request.validate(&layout), Err(OtaError::ImageTooLarge));
    }

    #[test]
    fn progress_steps() {
        let mut progress = Progress::new(1000, 10);
        assert_eq!(progress.advance(50), None);
        assert_eq!(progress.advance(60), Some(11));
        assert_eq!(progress.advance(5), None);
        assert_eq!(progress.advance(400), Some(51));
        assert_eq!(progress.advance(485), Some(100));
        assert_eq!(progress.advance(0), None);
    }

    #[test]
    fn sequence_crc_matches_bootloader() {
        assert_eq!(seq_crc(1), 0x4743_989a);
        assert_eq!(seq_crc(2), 0x55f6_3774);
    }

    #[test]
    fn entry_layout() {
        let entry = SelectEntry::new(1);
        let raw = entry.to_bytes();

        assert_eq!(&raw[..4], &[1, 0, 0, 0]);
        assert!(raw[4..28].iter().all(|b| *b == 0xff));
        assert_eq!(&raw[28..], &[0x9a, 0x98, 0x43, 0x47]);
        assert_eq!(SelectEntry::from_bytes(&raw), entry);
        assert!(entry.is_valid());
        assert!(!SelectEntry::from_bytes(&[0xff; ENTRY_LEN]).is_valid());
    }

    #[test]
    fn stream_image_into_slot() {
        let layout = small_layout();
        let image = image(SECTOR_SIZE + 1000);
        let flash = RamFlash::new(10 * SECTOR_SIZE);

        let mut writer =
            ImageWriter::new(flash, &layout, Slot::Ota1, image.len() as u32).unwrap();
        let mut reports = Vec::new();
        for chunk in image.chunks(700) {
            if let Some(percent) = writer.write(chunk).unwrap() {
                reports.push(percent);
            }
        }
        assert_eq!(writer.progress().percent(), 100);
        let flash = writer.finish().unwrap();

        let base = layout.slots[1] as usize;
        assert_eq!(&flash.data[base..base + image.len()], &image[..]);
        assert!(flash.data[base + image.len()..base + 2 * SECTOR_SIZE]
            .iter()
            .all(|b| *b == 0xff));
        assert_eq!(reports.last(), Some(&100));
        assert!(reports.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reject_foreign_image() {
        let flash = RamFlash::new(10 * SECTOR_SIZE);
        let mut writer = ImageWriter::new(flash, &small_layout(), Slot::Ota0, 16).unwrap();
        assert_eq!(writer.write(b"<html>"), Err(OtaError::InvalidImage));
    }

    #[test]
    fn incomplete_and_oversized_images() {
        let layout = small_layout();
        let mut writer = ImageWriter::new(RamFlash::new(10 * SECTOR_SIZE), &layout, Slot::Ota0, 8).unwrap();
        writer.write(&image(4)).unwrap();
        assert_eq!(writer.write(&[0u8; 5]), Err(OtaError::ImageTooLarge));
        assert!(matches!(
            writer.finish(),
            Err(OtaError::Incomplete { expected: 8, received: 4 })
        ));

        assert!(matches!(
            ImageWriter::new(RamFlash::new(16), &layout, Slot::Ota0, layout.slot_size + 1),
            Err(OtaError::ImageTooLarge)
        ));
    }

    #[test]
    fn fresh_device_boots_first_slot() {
        let layout = small_layout();
        let mut flash = RamFlash::new(10 * SECTOR_SIZE);
        let mut otadata = Otadata::read(&mut flash, &layout).unwrap();

        assert_eq!(otadata.boot_slot(), Slot::Ota0);
        assert_eq!(otadata.target_slot(), Slot::Ota1);

        let sector = otadata.activate(&mut flash, &layout, Slot::Ota1).unwrap();
        assert_eq!(sector, 0);
        assert_eq!(otadata.entries[0].seq, 2);

        let reread = Otadata::read(&mut flash, &layout).unwrap();
        assert_eq!(reread, otadata);
        assert_eq!(reread.boot_slot(), Slot::Ota1);
    }

    #[test]
    fn activation_alternates_sectors() {
        let layout = small_layout();
        let mut flash = RamFlash::new(10 * SECTOR_SIZE);
        let mut otadata = Otadata::read(&mut flash, &layout).unwrap();

        otadata.activate(&mut flash, &layout, Slot::Ota1).unwrap();
        let sector = otadata.activate(&mut flash, &layout, Slot::Ota0).unwrap();
        assert_eq!(sector, 1);
        assert_eq!(otadata.entries[1].seq, 3);
        assert_eq!(otadata.boot_slot(), Slot::Ota0);

        let sector = otadata.activate(&mut flash, &layout, Slot::Ota1).unwrap();
        assert_eq!(sector, 0);
        assert_eq!(otadata.entries[0].seq, 4);
        assert_eq!(Otadata::read(&mut flash, &layout).unwrap().boot_slot(), Slot::Ota1);
    }

    #[test]
    fn corrupted_entry_is_ignored() {
        let layout = small_layout();
        let mut flash = RamFlash::new(10 * SECTOR_SIZE);
        let mut corrupted = SelectEntry::new(7);
        corrupted.crc ^= 1;
        flash.write(0, &corrupted.to_bytes()).unwrap();
        flash
            .write(SECTOR_SIZE as u32, &SelectEntry::new(2).to_bytes())
            .unwrap();

        let otadata = Otadata::read(&mut flash, &layout).unwrap();
        assert_eq!(otadata.boot_slot(), Slot::Ota1);
        assert_eq!(otadata.target_slot(), Slot::Ota0);
    }
}
