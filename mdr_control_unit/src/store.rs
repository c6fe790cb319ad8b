//! Calibration persistence.
//!
//! `CalibrationStore` speaks whole 64-byte blobs through the
//! `CalibrationMemory` collaborator and performs read-modify-write for
//! every logical update, so unrelated fields survive each save. Validity
//! is decided by `CalibrationRecord::decode`; a failed or absent read is
//! treated as an all-zero record, never as an error to the caller.
//!
//! `PagedMemory` adapts a byte-addressable page transport (EEPROM-style)
//! to the blob interface with two fixed-address 32-byte transfers — each
//! within a single storage page. There is no atomicity across the two
//! transfers; power loss between them corrupts the record (accepted risk).

use mdr_common::hal::{CalibrationMemory, HalError, HalResult};
use mdr_common::record::{CalibrationRecord, RECORD_LEN};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::warn;

/// First 32-byte transfer address.
pub const BLOB_ADDR_LO: u16 = 0x0400;
/// Second 32-byte transfer address.
pub const BLOB_ADDR_HI: u16 = 0x0420;
/// Transfer size; matches the storage page size.
pub const PAGE_LEN: usize = 32;

/// Byte-addressable page transport beneath `PagedMemory`.
pub trait PageTransport: Send {
    fn read_page(&mut self, addr: u16, buf: &mut [u8]) -> HalResult<()>;
    fn write_page(&mut self, addr: u16, data: &[u8]) -> HalResult<()>;
}

/// Blob interface over a paged transport: the 64-byte record is moved as
/// two page-sized transfers at fixed addresses.
pub struct PagedMemory<T: PageTransport> {
    transport: T,
}

impl<T: PageTransport> PagedMemory<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: PageTransport> CalibrationMemory for PagedMemory<T> {
    fn read_blob(&mut self) -> HalResult<[u8; RECORD_LEN]> {
        let mut blob = [0u8; RECORD_LEN];
        self.transport.read_page(BLOB_ADDR_LO, &mut blob[..PAGE_LEN])?;
        self.transport.read_page(BLOB_ADDR_HI, &mut blob[PAGE_LEN..])?;
        Ok(blob)
    }

    fn write_blob(&mut self, blob: &[u8; RECORD_LEN]) -> HalResult<()> {
        self.transport.write_page(BLOB_ADDR_LO, &blob[..PAGE_LEN])?;
        self.transport.write_page(BLOB_ADDR_HI, &blob[PAGE_LEN..])?;
        Ok(())
    }
}

/// File-backed EEPROM image. Unwritten bytes read as 0xFF, like erased
/// EEPROM.
pub struct FileMemory {
    path: PathBuf,
}

impl FileMemory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn open(&self, write: bool) -> std::io::Result<std::fs::File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }

    fn ensure_len(&self, file: &mut std::fs::File, len: u64) -> std::io::Result<()> {
        let current = file.metadata()?.len();
        if current < len {
            file.seek(SeekFrom::Start(current))?;
            let fill = vec![0xFFu8; (len - current) as usize];
            file.write_all(&fill)?;
        }
        Ok(())
    }
}

impl PageTransport for FileMemory {
    fn read_page(&mut self, addr: u16, buf: &mut [u8]) -> HalResult<()> {
        let mut file = self
            .open(true)
            .map_err(|e| HalError::ReadFailed(e.to_string()))?;
        self.ensure_len(&mut file, addr as u64 + buf.len() as u64)
            .map_err(|e| HalError::ReadFailed(e.to_string()))?;
        file.seek(SeekFrom::Start(addr as u64))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| HalError::ReadFailed(e.to_string()))
    }

    fn write_page(&mut self, addr: u16, data: &[u8]) -> HalResult<()> {
        let mut file = self
            .open(true)
            .map_err(|e| HalError::WriteFailed(e.to_string()))?;
        self.ensure_len(&mut file, addr as u64)
            .map_err(|e| HalError::WriteFailed(e.to_string()))?;
        file.seek(SeekFrom::Start(addr as u64))
            .and_then(|_| file.write_all(data))
            .map_err(|e| HalError::WriteFailed(e.to_string()))
    }
}

/// Read-modify-write store over any blob memory.
pub struct CalibrationStore {
    memory: Box<dyn CalibrationMemory>,
}

impl CalibrationStore {
    pub fn new(memory: Box<dyn CalibrationMemory>) -> Self {
        Self { memory }
    }

    /// Load the persisted record; `None` means absent or invalid.
    pub fn load(&mut self) -> Option<CalibrationRecord> {
        match self.memory.read_blob() {
            Ok(blob) => CalibrationRecord::decode(&blob),
            Err(e) => {
                warn!("calibration read failed, treating as absent: {e}");
                None
            }
        }
    }

    /// Current record, or all-zero on first use / read failure.
    fn current(&mut self) -> CalibrationRecord {
        self.load().unwrap_or_default()
    }

    fn rewrite(&mut self, record: CalibrationRecord) -> HalResult<()> {
        self.memory.write_blob(&record.encode())
    }

    /// Persist both RTD offsets (paired write).
    pub fn save_rtd_calibration(&mut self, offsets: [f32; 2]) -> HalResult<()> {
        let mut record = self.current();
        record.rtd_offset = offsets;
        self.rewrite(record)
    }

    /// Persist both RTD setpoints (paired write).
    pub fn save_rtd_setpoints(&mut self, setpoints: [f32; 2]) -> HalResult<()> {
        let mut record = self.current();
        record.rtd_setpoint = setpoints;
        self.rewrite(record)
    }

    /// Persist the torque-channel zero and coefficient.
    pub fn save_mdr_calibration(&mut self, adc_zero: f32, k_t: f32) -> HalResult<()> {
        let mut record = self.current();
        record.mdr_adc_zero = adc_zero;
        record.mdr_k_t = k_t;
        self.rewrite(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory transport tracking transfer addresses.
    #[derive(Clone, Default)]
    struct MemTransport {
        image: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
        bytes: Arc<Mutex<std::collections::HashMap<u16, u8>>>,
    }

    impl PageTransport for MemTransport {
        fn read_page(&mut self, addr: u16, buf: &mut [u8]) -> HalResult<()> {
            let bytes = self.bytes.lock().unwrap();
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *bytes.get(&(addr + i as u16)).unwrap_or(&0xFF);
            }
            Ok(())
        }

        fn write_page(&mut self, addr: u16, data: &[u8]) -> HalResult<()> {
            self.image.lock().unwrap().push((addr, data.to_vec()));
            let mut bytes = self.bytes.lock().unwrap();
            for (i, b) in data.iter().enumerate() {
                bytes.insert(addr + i as u16, *b);
            }
            Ok(())
        }
    }

    fn store(transport: MemTransport) -> CalibrationStore {
        CalibrationStore::new(Box::new(PagedMemory::new(transport)))
    }

    #[test]
    fn fresh_memory_reads_absent() {
        let mut s = store(MemTransport::default());
        assert!(s.load().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut s = store(MemTransport::default());
        s.save_mdr_calibration(84213.0, 0.00125).unwrap();
        let rec = s.load().unwrap();
        assert_eq!(rec.mdr_adc_zero.to_bits(), 84213.0f32.to_bits());
        assert_eq!(rec.mdr_k_t.to_bits(), 0.00125f32.to_bits());
        assert_eq!(rec.rtd_offset, [0.0, 0.0]);
    }

    #[test]
    fn updates_patch_only_their_fields() {
        let mut s = store(MemTransport::default());
        s.save_mdr_calibration(1000.0, 0.5).unwrap();
        s.save_rtd_setpoints([170.0, 175.0]).unwrap();
        s.save_rtd_calibration([1.5, -2.0]).unwrap();
        let rec = s.load().unwrap();
        assert_eq!(rec.mdr_adc_zero, 1000.0);
        assert_eq!(rec.mdr_k_t, 0.5);
        assert_eq!(rec.rtd_setpoint, [170.0, 175.0]);
        assert_eq!(rec.rtd_offset, [1.5, -2.0]);
    }

    #[test]
    fn writes_use_two_fixed_page_transfers() {
        let transport = MemTransport::default();
        let mut s = store(transport.clone());
        s.save_mdr_calibration(1.0, 2.0).unwrap();
        let image = transport.image.lock().unwrap();
        let addrs: Vec<u16> = image.iter().map(|(a, _)| *a).collect();
        assert_eq!(addrs, vec![BLOB_ADDR_LO, BLOB_ADDR_HI]);
        assert!(image.iter().all(|(_, d)| d.len() == PAGE_LEN));
    }

    #[test]
    fn file_memory_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eeprom.bin");
        {
            let mut s = store_file(path.clone());
            s.save_rtd_setpoints([160.0, 161.0]).unwrap();
        }
        let mut s = store_file(path);
        assert_eq!(s.load().unwrap().rtd_setpoint, [160.0, 161.0]);
    }

    fn store_file(path: PathBuf) -> CalibrationStore {
        CalibrationStore::new(Box::new(PagedMemory::new(FileMemory::new(path))))
    }
}
