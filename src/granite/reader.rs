//! Sequential WAL reader used by recovery
//!
//! Frames are read strictly in file order and must carry strictly increasing
//! LSNs. A checksum mismatch, an undecodable body or an LSN that goes
//! backwards is corruption and stops the scan with an error. An incomplete
//! final frame (a crash in the middle of a write) is not an error: the scan
//! ends cleanly before it and [`WalReader::torn_tail`] reports it.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::codec::{decode_body, decode_header, FRAME_HEADER_LEN};
use super::log::LogRecord;
use super::types::Lsn;
use crate::error::{GraniteError, Result};

/// Everything read from a log in one pass
#[derive(Debug, Default)]
pub struct WalScan {
    /// (byte offset, record) in file order
    pub records: Vec<(u64, LogRecord)>,
    /// Length of the intact prefix of the file
    pub valid_len: u64,
    /// Whether an incomplete frame followed the intact prefix
    pub torn_tail: bool,
}

pub struct WalReader {
    reader: BufReader<File>,
    /// Offset of the next frame to read
    offset: u64,
    last_lsn: Lsn,
    torn_tail: bool,
    finished: bool,
}

impl WalReader {
    /// Open a log file for reading from the beginning
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
            last_lsn: 0,
            torn_tail: false,
            finished: false,
        })
    }

    /// Reposition at a frame boundary. LSN ordering checks restart there.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        self.last_lsn = 0;
        self.torn_tail = false;
        self.finished = false;
        Ok(())
    }

    /// Offset just past the last complete frame read
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    pub fn torn_tail(&self) -> bool {
        self.torn_tail
    }

    /// Read the record whose frame starts at `offset`
    pub fn read_at(&mut self, offset: u64) -> Result<Option<LogRecord>> {
        self.seek(offset)?;
        Ok(self.next_record()?.map(|(_, record)| record))
    }

    /// Read the next record, or `None` at the end of the intact log
    pub fn next_record(&mut self) -> Result<Option<(u64, LogRecord)>> {
        if self.finished {
            return Ok(None);
        }
        let frame_offset = self.offset;

        let mut header = [0u8; FRAME_HEADER_LEN];
        let got = read_full(&mut self.reader, &mut header)?;
        if got == 0 {
            self.finished = true;
            return Ok(None);
        }
        if got < FRAME_HEADER_LEN {
            return Ok(self.stop_at_torn_tail(frame_offset, got));
        }

        let (len, crc) = decode_header(frame_offset, &header)?;
        let mut body = vec![0u8; len];
        let got = read_full(&mut self.reader, &mut body)?;
        if got < len {
            return Ok(self.stop_at_torn_tail(frame_offset, FRAME_HEADER_LEN + got));
        }

        let record = decode_body(frame_offset, crc, &body)?;
        if record.lsn <= self.last_lsn {
            return Err(GraniteError::LsnOutOfOrder {
                offset: frame_offset,
                previous: self.last_lsn,
                found: record.lsn,
            });
        }

        self.last_lsn = record.lsn;
        self.offset = frame_offset + (FRAME_HEADER_LEN + len) as u64;
        Ok(Some((frame_offset, record)))
    }

    fn stop_at_torn_tail(&mut self, offset: u64, bytes: usize) -> Option<(u64, LogRecord)> {
        log::warn!("Incomplete WAL frame at byte {} ({} bytes), ignoring tail", offset, bytes);
        self.torn_tail = true;
        self.finished = true;
        None
    }

    /// Read every remaining record
    pub fn read_to_end(mut self) -> Result<WalScan> {
        let mut records = Vec::new();
        while let Some(entry) = self.next_record()? {
            records.push(entry);
        }
        Ok(WalScan {
            records,
            valid_len: self.valid_len(),
            torn_tail: self.torn_tail,
        })
    }
}

impl Iterator for WalReader {
    type Item = Result<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Like `read_exact`, but reports how much was read instead of failing at EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::granite::codec::encode_frame;
    use crate::granite::log::LogOperation;
    use std::io::Write;

    fn record(lsn: Lsn, op: LogOperation) -> LogRecord {
        LogRecord {
            lsn,
            txn_id: 1,
            op,
            timestamp: 12345,
        }
    }

    fn write_log(path: &Path, records: &[LogRecord]) -> Vec<u64> {
        let mut file = File::create(path).unwrap();
        let mut offsets = Vec::new();
        let mut offset = 0;
        for r in records {
            let frame = encode_frame(r).unwrap();
            offsets.push(offset);
            offset += frame.len() as u64;
            file.write_all(&frame).unwrap();
        }
        offsets
    }

    #[test]
    fn test_empty_log() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        File::create(&path).unwrap();

        let scan = WalReader::open(&path).unwrap().read_to_end().unwrap();
        assert!(scan.records.is_empty());
        assert_eq!(scan.valid_len, 0);
        assert!(!scan.torn_tail);
    }

    #[test]
    fn test_reads_records_with_offsets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        let records = vec![
            record(1, LogOperation::Begin),
            record(2, LogOperation::Commit),
        ];
        let offsets = write_log(&path, &records);

        let scan = WalReader::open(&path).unwrap().read_to_end().unwrap();
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.records[0], (offsets[0], records[0].clone()));
        assert_eq!(scan.records[1], (offsets[1], records[1].clone()));
        assert_eq!(scan.valid_len, std::fs::metadata(&path).unwrap().len());

        let mut reader = WalReader::open(&path).unwrap();
        assert_eq!(reader.read_at(offsets[1]).unwrap(), Some(records[1].clone()));
    }

    #[test]
    fn test_torn_tail_is_not_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        write_log(&path, &[record(1, LogOperation::Begin)]);
        let intact = std::fs::metadata(&path).unwrap().len();

        let partial = encode_frame(&record(2, LogOperation::Commit)).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() - 3]).unwrap();

        let scan = WalReader::open(&path).unwrap().read_to_end().unwrap();
        assert_eq!(scan.records.len(), 1);
        assert!(scan.torn_tail);
        assert_eq!(scan.valid_len, intact);

        let mut reader = WalReader::open(&path).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(!reader.torn_tail());
        assert!(reader.next_record().unwrap().is_none());
        assert!(reader.torn_tail());
        assert_eq!(reader.valid_len(), intact);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        write_log(
            &path,
            &[record(1, LogOperation::Begin), record(2, LogOperation::Commit)],
        );

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, GraniteError::Corruption { .. }));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_lsn_going_backwards_is_corruption() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        write_log(
            &path,
            &[record(5, LogOperation::Begin), record(5, LogOperation::Commit)],
        );

        let err = WalReader::open(&path).unwrap().read_to_end().unwrap_err();
        assert!(matches!(err, GraniteError::LsnOutOfOrder { previous: 5, found: 5, .. }));
    }
}
