//! WAL manager implementation.
//!
//! Records are appended and fsynced one at a time. After each append the
//! file header is rewritten with the running checksum of every record, so a
//! crash can tear at most the last record, or leave the header one record
//! behind. Both cases are repaired on open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::record::WalRecord;
use crate::error::{DbError, DbResult};

const SEED: u32 = 13331;

/// Bytes taken by the running checksum at the start of the file.
const LEN_HEADER: u64 = 4;

const OF_SIZE: usize = 0;
const OF_CHECKSUM: usize = OF_SIZE + 4;
const OF_DATA: usize = OF_CHECKSUM + 4;

/// Fold `data` into `checksum`.
fn calc_checksum(checksum: u32, data: &[u8]) -> u32 {
    data.iter().fold(checksum, |acc, &b| {
        acc.wrapping_mul(SEED).wrapping_add(b as u32)
    })
}

struct WalFile {
    file: File,
    /// Cursor for [`WalManager::next`].
    position: u64,
    file_size: u64,
    /// Checksum of every record currently in the file.
    x_checksum: u32,
}

impl WalFile {
    /// Read the whole record at the cursor, or `None` at a torn or
    /// corrupt record.
    fn next_raw(&mut self) -> DbResult<Option<Vec<u8>>> {
        if self.position + OF_DATA as u64 > self.file_size {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(self.position))?;
        let mut head = [0u8; OF_DATA];
        self.file.read_exact(&mut head)?;
        let size = BigEndian::read_u32(&head[OF_SIZE..OF_CHECKSUM]) as u64;
        let checksum = BigEndian::read_u32(&head[OF_CHECKSUM..OF_DATA]);

        if self.position + OF_DATA as u64 + size > self.file_size {
            return Ok(None);
        }

        let mut record = vec![0u8; OF_DATA + size as usize];
        record[..OF_DATA].copy_from_slice(&head);
        self.file.read_exact(&mut record[OF_DATA..])?;
        if calc_checksum(0, &record[OF_DATA..]) != checksum {
            return Ok(None);
        }

        self.position += record.len() as u64;
        Ok(Some(record))
    }

    fn write_header(&mut self) -> DbResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_u32::<BigEndian>(self.x_checksum)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Append-only redo/undo log.
pub struct WalManager {
    inner: Mutex<WalFile>,
}

impl WalManager {
    pub fn create(path: &Path) -> DbResult<Self> {
        if path.exists() {
            return Err(DbError::FileExists(path.to_path_buf()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_u32::<BigEndian>(0)?;
        file.sync_all()?;

        debug!("Created log file {:?}", path);
        Ok(Self {
            inner: Mutex::new(WalFile {
                file,
                position: LEN_HEADER,
                file_size: LEN_HEADER,
                x_checksum: 0,
            }),
        })
    }

    /// Open a log, validate it against its header checksum and cut off any
    /// torn tail.
    pub fn open(path: &Path) -> DbResult<Self> {
        if !path.exists() {
            return Err(DbError::FileNotFound(path.to_path_buf()));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < LEN_HEADER {
            return Err(DbError::corrupted(
                "log",
                format!("file is {} bytes, shorter than its header", file_size),
            ));
        }

        file.seek(SeekFrom::Start(0))?;
        let header = file.read_u32::<BigEndian>()?;

        let mut wal = WalFile {
            file,
            position: LEN_HEADER,
            file_size,
            x_checksum: 0,
        };

        let mut checksum = 0;
        let mut previous = 0;
        let mut records = 0usize;
        while let Some(record) = wal.next_raw()? {
            previous = checksum;
            checksum = calc_checksum(checksum, &record);
            records += 1;
        }

        if header != checksum {
            // The header write after the last append may not have landed.
            if records > 0 && header == previous {
                warn!("Log header lags its last record, repairing");
            } else {
                return Err(DbError::corrupted(
                    "log",
                    format!(
                        "header checksum {:#x} does not match records ({:#x})",
                        header, checksum
                    ),
                ));
            }
        }

        let valid_end = wal.position;
        if valid_end < file_size {
            warn!(
                "Truncating {} bytes of torn log tail",
                file_size - valid_end
            );
            wal.file.set_len(valid_end)?;
            wal.file_size = valid_end;
        }
        wal.x_checksum = checksum;
        wal.write_header()?;
        wal.position = LEN_HEADER;

        debug!("Opened log with {} records", records);
        Ok(Self {
            inner: Mutex::new(wal),
        })
    }

    /// Append one payload and make it durable.
    pub fn log(&self, data: &[u8]) -> DbResult<()> {
        let mut record = BytesMut::with_capacity(OF_DATA + data.len());
        record.put_u32(data.len() as u32);
        record.put_u32(calc_checksum(0, data));
        record.put_slice(data);

        let mut wal = self.inner.lock();
        let end = wal.file_size;
        wal.file.seek(SeekFrom::Start(end))?;
        wal.file.write_all(&record)?;
        wal.file.sync_data()?;
        wal.file_size += record.len() as u64;

        wal.x_checksum = calc_checksum(wal.x_checksum, &record);
        wal.write_header()
    }

    pub fn write_record(&self, record: &WalRecord) -> DbResult<()> {
        self.log(&record.serialize()?)
    }

    /// Move the cursor back to the first record.
    pub fn rewind(&self) {
        self.inner.lock().position = LEN_HEADER;
    }

    /// Payload of the next record, or `None` at the end of the log.
    pub fn next(&self) -> DbResult<Option<Vec<u8>>> {
        let record = self.inner.lock().next_raw()?;
        Ok(record.map(|mut r| r.split_off(OF_DATA)))
    }

    pub fn next_record(&self) -> DbResult<Option<WalRecord>> {
        match self.next()? {
            Some(data) => Ok(Some(WalRecord::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn close(&self) -> DbResult<()> {
        let wal = self.inner.lock();
        wal.file.sync_all()?;
        info!("Closed log at {} bytes", wal.file_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageId;
    use crate::transaction::TransactionId;
    use tempfile::tempdir;

    fn collect(wal: &WalManager) -> DbResult<Vec<Vec<u8>>> {
        wal.rewind();
        let mut all = Vec::new();
        while let Some(data) = wal.next()? {
            all.push(data);
        }
        Ok(all)
    }

    #[test]
    fn test_checksum_fold() {
        assert_eq!(calc_checksum(0, &[]), 0);
        assert_eq!(calc_checksum(0, &[1]), 1);
        assert_eq!(calc_checksum(0, &[1, 2]), 13333);
        assert_eq!(calc_checksum(calc_checksum(0, &[1]), &[2]), 13333);
    }

    #[test]
    fn test_log_and_iterate() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.log");
        let wal = WalManager::create(&path)?;

        wal.log(b"first")?;
        wal.log(b"second")?;
        wal.log(b"")?;

        assert_eq!(
            collect(&wal)?,
            vec![b"first".to_vec(), b"second".to_vec(), vec![]]
        );
        // Iteration is repeatable.
        assert_eq!(collect(&wal)?.len(), 3);
        wal.close()?;

        let reopened = WalManager::open(&path)?;
        assert_eq!(collect(&reopened)?.len(), 3);
        reopened.log(b"third")?;
        assert_eq!(collect(&reopened)?.last().unwrap(), b"third");
        Ok(())
    }

    #[test]
    fn test_records_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WalManager::create(&dir.path().join("t.log"))?;
        let record = WalRecord::update(TransactionId::new(1), PageId(2), 2, vec![1, 2], vec![3, 4]);
        wal.write_record(&record)?;

        wal.rewind();
        assert_eq!(wal.next_record()?, Some(record));
        assert_eq!(wal.next_record()?, None);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.log");
        {
            let wal = WalManager::create(&path)?;
            wal.log(b"kept")?;
        }
        let len_before = std::fs::metadata(&path)?.len();

        // A record header promising more bytes than were written.
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0, 0, 0, 100, 0, 0, 0, 0, 1, 2, 3])?;
        drop(file);

        let wal = WalManager::open(&path)?;
        assert_eq!(collect(&wal)?, vec![b"kept".to_vec()]);
        assert_eq!(std::fs::metadata(&path)?.len(), len_before);
        Ok(())
    }

    #[test]
    fn test_bad_record_checksum_ends_the_log() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.log");
        {
            let wal = WalManager::create(&path)?;
            wal.log(b"good")?;
            wal.log(b"flipped")?;
        }

        // Flip the last payload byte. The header covers both records, so it
        // matches neither the surviving prefix nor the one before it.
        let mut bytes = std::fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes)?;

        let wal = WalManager::open(&path);
        assert!(matches!(wal, Err(DbError::Corrupted { .. })));
        Ok(())
    }

    #[test]
    fn test_header_lagging_one_record_is_repaired() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.log");
        let header_after_first;
        {
            let wal = WalManager::create(&path)?;
            wal.log(b"one")?;
            header_after_first = std::fs::read(&path)?[..4].to_vec();
            wal.log(b"two")?;
        }

        let mut bytes = std::fs::read(&path)?;
        bytes[..4].copy_from_slice(&header_after_first);
        std::fs::write(&path, &bytes)?;

        let wal = WalManager::open(&path)?;
        assert_eq!(collect(&wal)?, vec![b"one".to_vec(), b"two".to_vec()]);
        drop(wal);

        // The repaired header now validates on its own.
        let wal = WalManager::open(&path)?;
        assert_eq!(collect(&wal)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_wrong_header_is_corruption() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.log");
        {
            let wal = WalManager::create(&path)?;
            wal.log(b"one")?;
            wal.log(b"two")?;
        }

        let mut bytes = std::fs::read(&path)?;
        bytes[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        std::fs::write(&path, &bytes)?;

        assert!(matches!(
            WalManager::open(&path),
            Err(DbError::Corrupted { .. })
        ));
        Ok(())
    }
}
