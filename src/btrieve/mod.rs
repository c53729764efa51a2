//! The Btrieve ISAM engine guest modules use for persistence. One
//! `BtrieveProcessor` owns one file: its metadata, key definitions, record
//! set, and the single cursor (`position` + stored query) the legacy API
//! exposes. Host-API shims drive it via `perform` with the legacy operation
//! code word, or through the typed methods directly.

pub mod dat;
pub mod key;
pub mod mirror;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use key::{compare_key_values, BtrieveKey, KeyAttributes, KeyDataType, KeyDefinition};

#[derive(Debug, Error)]
pub enum BtrieveError {
    #[error("btrieve file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("malformed btrieve file: {0}")]
    MalformedFile(String),
    #[error("record length mismatch: expected {expected}, got {actual}")]
    MalformedRecord { expected: u16, actual: usize },
    #[error("no record at offset {0}")]
    RecordNotFound(u32),
    #[error("invalid key number {0}")]
    InvalidKeyNumber(u16),
    #[error("unsupported operation code {0}")]
    UnsupportedOperation(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("mirror serialization: {0}")]
    Mirror(#[from] serde_json::Error),
}

/// Legacy operation codes as passed through the BTRV entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum BtrieveOperation {
    Open = 0,
    Close = 1,
    Insert = 2,
    Update = 3,
    Delete = 4,
    GetEqual = 5,
    GetNext = 6,
    GetPrevious = 7,
    GetGreater = 8,
    GetGreaterOrEqual = 9,
    GetLess = 10,
    GetLessOrEqual = 11,
    GetFirst = 12,
    GetLast = 13,
    Create = 14,
    Stat = 15,
    StepNext = 24,
    StepFirst = 33,
    StepLast = 34,
    StepPrevious = 35,
}

/// Deserialized state of one ISAM file. Records are keyed by their stable
/// offset identifier (dense, assigned at insert, starting at 1); the map
/// order is the step-operation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BtrieveFile {
    pub record_length: u16,
    pub physical_record_length: u16,
    pub page_length: u16,
    pub page_count: u16,
    pub log_key_present: bool,
    pub keys: BTreeMap<u16, BtrieveKey>,
    pub records: BTreeMap<u32, Vec<u8>>,
}

impl BtrieveFile {
    pub fn key_count(&self) -> u16 {
        self.keys.len() as u16
    }

    fn lowest_offset(&self) -> u32 {
        self.records.keys().next().copied().unwrap_or(0)
    }

    fn next_offset(&self) -> u32 {
        self.records.keys().next_back().map_or(1, |&o| o + 1)
    }
}

/// The single stored query a processor keeps between a keyed lookup and its
/// continuations.
#[derive(Debug, Clone)]
struct PreviousQuery {
    key_number: u16,
    key_length: u16,
    data_type: KeyDataType,
    key: Vec<u8>,
}

pub struct BtrieveProcessor {
    file: BtrieveFile,
    dat_path: PathBuf,
    emu_path: PathBuf,
    position: u32,
    previous_query: Option<PreviousQuery>,
    /// The legacy engine filtered relational scans to offsets beyond the
    /// cursor; disable to scan the whole file instead.
    scan_from_position: bool,
}

impl BtrieveProcessor {
    /// Open `file_name` inside `dir`, preferring the structured `.EMU`
    /// mirror, then the legacy `.DAT`, then a pristine `.VIR` copied into
    /// place.
    pub fn open(dir: &Path, file_name: &str) -> Result<Self, BtrieveError> {
        let dat_path = dir.join(file_name);
        let emu_path = dat_path.with_extension("EMU");
        let vir_path = dat_path.with_extension("VIR");

        let file = if emu_path.is_file() {
            debug!("loading {} from mirror {}", file_name, emu_path.display());
            mirror::load(&emu_path)?
        } else {
            if !dat_path.is_file() {
                if vir_path.is_file() {
                    warn!(
                        "{} missing, restoring from virgin copy {}",
                        file_name,
                        vir_path.display()
                    );
                    std::fs::copy(&vir_path, &dat_path)?;
                } else {
                    return Err(BtrieveError::FileNotFound(dat_path));
                }
            }
            let parsed = dat::parse(&std::fs::read(&dat_path)?)?;
            mirror::save(&parsed, &emu_path)?;
            parsed
        };

        let position = file.lowest_offset();
        Ok(Self {
            file,
            dat_path,
            emu_path,
            position,
            previous_query: None,
            scan_from_position: true,
        })
    }

    pub fn file(&self) -> &BtrieveFile {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.dat_path
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn record_length(&self) -> u16 {
        self.file.record_length
    }

    pub fn record_count(&self) -> usize {
        self.file.records.len()
    }

    /// Record under the cursor, if the cursor references a live offset.
    pub fn current_record(&self) -> Option<&[u8]> {
        self.file.records.get(&self.position).map(Vec::as_slice)
    }

    /// Compatibility switch for the relational-scan cursor filter.
    pub fn set_scan_from_position(&mut self, enabled: bool) {
        self.scan_from_position = enabled;
    }

    /// Dispatch by legacy operation code. Returns the legacy truthiness:
    /// true on success, false on empty/not-found.
    pub fn perform(&mut self, code: u16, key_number: u16, key: &[u8]) -> Result<bool, BtrieveError> {
        let op = BtrieveOperation::from_u16(code)
            .ok_or(BtrieveError::UnsupportedOperation(code))?;
        debug!("btrieve {op:?} key#{key_number} on {}", self.dat_path.display());
        match op {
            BtrieveOperation::StepFirst => Ok(self.step_first()),
            BtrieveOperation::StepNext => Ok(self.step_next()),
            BtrieveOperation::StepPrevious => Ok(self.step_previous()),
            BtrieveOperation::StepLast => Ok(self.step_last()),
            BtrieveOperation::GetEqual => self.get_equal(key_number, key),
            BtrieveOperation::GetNext => self.get_key_next(),
            BtrieveOperation::GetFirst => self.get_key_first(key_number),
            BtrieveOperation::GetLast => self.get_key_last(key_number),
            BtrieveOperation::GetGreater => self.get_greater(key_number, key),
            BtrieveOperation::GetGreaterOrEqual => self.get_greater_or_equal(key_number, key),
            BtrieveOperation::GetLess => self.get_less(key_number, key),
            BtrieveOperation::GetLessOrEqual => self.get_less_or_equal(key_number, key),
            BtrieveOperation::Delete => self.delete(),
            _ => Err(BtrieveError::UnsupportedOperation(code)),
        }
    }

    // --- Step operations: pure offset-order cursor movement. ---

    pub fn step_first(&mut self) -> bool {
        match self.file.records.keys().next() {
            Some(&offset) => {
                self.position = offset;
                true
            }
            None => false,
        }
    }

    pub fn step_next(&mut self) -> bool {
        match self
            .file
            .records
            .range((Excluded(self.position), Unbounded))
            .next()
        {
            Some((&offset, _)) => {
                self.position = offset;
                true
            }
            None => false,
        }
    }

    pub fn step_previous(&mut self) -> bool {
        match self
            .file
            .records
            .range((Unbounded, Excluded(self.position)))
            .next_back()
        {
            Some((&offset, _)) => {
                self.position = offset;
                true
            }
            None => false,
        }
    }

    pub fn step_last(&mut self) -> bool {
        match self.file.records.keys().next_back() {
            Some(&offset) => {
                self.position = offset;
                true
            }
            None => false,
        }
    }

    // --- Keyed queries. ---

    fn key(&self, key_number: u16) -> Result<&BtrieveKey, BtrieveError> {
        self.file
            .keys
            .get(&key_number)
            .ok_or(BtrieveError::InvalidKeyNumber(key_number))
    }

    /// Build and store a fresh query. A caller key wider than the declared
    /// key widens the comparison slice; modules whose struct key outgrew
    /// the ISAM definition rely on this.
    fn build_query(&self, key_number: u16, caller_key: &[u8]) -> Result<PreviousQuery, BtrieveError> {
        let key = self.key(key_number)?;
        let mut key_length = key.total_length();
        if caller_key.len() as u16 > key_length {
            warn!(
                "query key of {} bytes widens declared key {} ({} bytes)",
                caller_key.len(),
                key_number,
                key_length
            );
            key_length = caller_key.len() as u16;
        }
        let mut value = caller_key.to_vec();
        value.resize(key_length as usize, 0);
        Ok(PreviousQuery {
            key_number,
            key_length,
            data_type: key.data_type(),
            key: value,
        })
    }

    /// First record (ascending offset) whose key slice equals the caller's
    /// key becomes the cursor.
    pub fn get_equal(&mut self, key_number: u16, caller_key: &[u8]) -> Result<bool, BtrieveError> {
        let query = self.build_query(key_number, caller_key)?;
        let found = self.scan_equal(&query);
        self.previous_query = Some(query);
        Ok(found)
    }

    fn scan_equal(&mut self, query: &PreviousQuery) -> bool {
        let key = &self.file.keys[&query.key_number];
        for (&offset, record) in &self.file.records {
            if key.extract(record, query.key_length) == query.key {
                self.position = offset;
                return true;
            }
        }
        false
    }

    /// Record with the minimum key value under the key's ordering.
    pub fn get_key_first(&mut self, key_number: u16) -> Result<bool, BtrieveError> {
        self.get_key_extreme(key_number, Ordering::Less)
    }

    /// Record with the maximum key value under the key's ordering.
    pub fn get_key_last(&mut self, key_number: u16) -> Result<bool, BtrieveError> {
        self.get_key_extreme(key_number, Ordering::Greater)
    }

    fn get_key_extreme(&mut self, key_number: u16, wanted: Ordering) -> Result<bool, BtrieveError> {
        let key = self.key(key_number)?;
        let key_length = key.total_length();
        let data_type = key.data_type();

        let mut best: Option<(u32, Vec<u8>)> = None;
        for (&offset, record) in &self.file.records {
            let value = key.extract(record, key_length);
            let better = match &best {
                None => true,
                Some((_, current)) => compare_key_values(data_type, &value, current) == wanted,
            };
            if better {
                best = Some((offset, value));
            }
        }

        match best {
            Some((offset, value)) => {
                self.position = offset;
                self.previous_query = Some(PreviousQuery {
                    key_number,
                    key_length,
                    data_type,
                    key: value,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Continuation of the stored query. String keys seek the next offset
    /// with the same key; numeric keys increment the stored key modulo its
    /// width and re-run the equality scan.
    pub fn get_key_next(&mut self) -> Result<bool, BtrieveError> {
        let Some(mut query) = self.previous_query.take() else {
            return Ok(false);
        };

        let found = if query.data_type.is_string() {
            let key = &self.file.keys[&query.key_number];
            let mut hit = None;
            for (&offset, record) in self.file.records.range((Excluded(self.position), Unbounded)) {
                if key.extract(record, query.key_length) == query.key {
                    hit = Some(offset);
                    break;
                }
            }
            match hit {
                Some(offset) => {
                    self.position = offset;
                    true
                }
                None => false,
            }
        } else {
            increment_le(&mut query.key);
            self.scan_equal(&query)
        };

        self.previous_query = Some(query);
        Ok(found)
    }

    pub fn get_greater(&mut self, key_number: u16, caller_key: &[u8]) -> Result<bool, BtrieveError> {
        self.get_relational(key_number, caller_key, |o| o == Ordering::Greater)
    }

    pub fn get_greater_or_equal(
        &mut self,
        key_number: u16,
        caller_key: &[u8],
    ) -> Result<bool, BtrieveError> {
        self.get_relational(key_number, caller_key, |o| o != Ordering::Less)
    }

    pub fn get_less(&mut self, key_number: u16, caller_key: &[u8]) -> Result<bool, BtrieveError> {
        self.get_relational(key_number, caller_key, |o| o == Ordering::Less)
    }

    pub fn get_less_or_equal(
        &mut self,
        key_number: u16,
        caller_key: &[u8],
    ) -> Result<bool, BtrieveError> {
        self.get_relational(key_number, caller_key, |o| o != Ordering::Greater)
    }

    /// Relational scan in ascending offset order. With the compatibility
    /// filter on (the default), only offsets strictly beyond the cursor are
    /// considered, matching the legacy engine even for the less-than forms.
    fn get_relational(
        &mut self,
        key_number: u16,
        caller_key: &[u8],
        accept: fn(Ordering) -> bool,
    ) -> Result<bool, BtrieveError> {
        let query = self.build_query(key_number, caller_key)?;
        let key = &self.file.keys[&query.key_number];
        let floor = if self.scan_from_position { self.position } else { 0 };

        let mut hit = None;
        for (&offset, record) in self.file.records.range((Excluded(floor), Unbounded)) {
            let value = key.extract(record, query.key_length);
            if accept(compare_key_values(query.data_type, &value, &query.key)) {
                hit = Some(offset);
                break;
            }
        }
        self.previous_query = Some(query);
        match hit {
            Some(offset) => {
                self.position = offset;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // --- Mutations. Every mutation flushes the mirror before returning. ---

    /// Append a record at the next free offset. Length mismatches are
    /// tolerated with a warning; short records are stored as handed in.
    pub fn insert(&mut self, data: &[u8]) -> Result<u32, BtrieveError> {
        if data.len() != self.file.record_length as usize {
            warn!(
                "inserting record of {} bytes into {} with record length {}",
                data.len(),
                self.dat_path.display(),
                self.file.record_length
            );
        }
        let offset = self.file.next_offset();
        self.file.records.insert(offset, data.to_vec());
        self.flush()?;
        Ok(offset)
    }

    /// Overwrite the record at `offset`. A length mismatch here is fatal:
    /// an in-place update that resizes the record would corrupt every key.
    pub fn update(&mut self, offset: u32, data: &[u8]) -> Result<(), BtrieveError> {
        if data.len() != self.file.record_length as usize {
            return Err(BtrieveError::MalformedRecord {
                expected: self.file.record_length,
                actual: data.len(),
            });
        }
        let record = self
            .file
            .records
            .get_mut(&offset)
            .ok_or(BtrieveError::RecordNotFound(offset))?;
        *record = data.to_vec();
        self.flush()?;
        Ok(())
    }

    /// Remove the record under the cursor. The cursor itself stays put, so
    /// a following `step_next` advances to the record after the deleted one.
    pub fn delete(&mut self) -> Result<bool, BtrieveError> {
        let removed = self.file.records.remove(&self.position).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn delete_all(&mut self) -> Result<(), BtrieveError> {
        self.file.records.clear();
        self.position = 0;
        self.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), BtrieveError> {
        mirror::save(&self.file, &self.emu_path)
    }

    /// Write the recovery dump for this file.
    pub fn dump_records(&self, out: &mut dyn Write) -> std::io::Result<()> {
        mirror::dump_records(&self.file, out)
    }
}

/// Little-endian increment modulo 2^(8*len).
fn increment_le(bytes: &mut [u8]) {
    for byte in bytes.iter_mut() {
        let (v, carry) = byte.overflowing_add(1);
        *byte = v;
        if !carry {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::dat::testutil::DatBuilder;
    use super::*;

    fn record(name: &[u8], ordinal: u32, alt: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 70];
        data[0] = 1;
        data[2..2 + name.len()].copy_from_slice(name);
        data[34..38].copy_from_slice(&ordinal.to_le_bytes());
        data[38..38 + alt.len()].copy_from_slice(alt);
        data
    }

    fn open_fixture(records: &[Vec<u8>]) -> (tempfile::TempDir, BtrieveProcessor) {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = DatBuilder::reference();
        builder.records = records.to_vec();
        std::fs::write(dir.path().join("MBBSEMU.DAT"), builder.build()).unwrap();
        let processor = BtrieveProcessor::open(dir.path(), "MBBSEMU.DAT").unwrap();
        (dir, processor)
    }

    #[test]
    fn open_writes_mirror_and_prefers_it_next_time() {
        let (dir, mut processor) = open_fixture(&[record(b"Sysop", 1, b"A")]);
        assert!(dir.path().join("MBBSEMU.EMU").is_file());

        processor.insert(&record(b"Guest", 2, b"B")).unwrap();
        drop(processor);

        // The .DAT still has one record; the mirror has two and wins.
        let reopened = BtrieveProcessor::open(dir.path(), "MBBSEMU.DAT").unwrap();
        assert_eq!(reopened.record_count(), 2);
    }

    #[test]
    fn open_restores_from_virgin_copy() {
        let dir = tempfile::tempdir().unwrap();
        let builder = DatBuilder::reference();
        std::fs::write(dir.path().join("MBBSEMU.VIR"), builder.build()).unwrap();

        let processor = BtrieveProcessor::open(dir.path(), "MBBSEMU.DAT").unwrap();
        assert_eq!(processor.record_count(), 0);
        assert!(dir.path().join("MBBSEMU.DAT").is_file());
    }

    #[test]
    fn missing_file_without_virgin_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            BtrieveProcessor::open(dir.path(), "NOPE.DAT"),
            Err(BtrieveError::FileNotFound(_))
        ));
    }

    #[test]
    fn step_operations_cover_the_file_in_offset_order() {
        let records: Vec<_> = (1..=4u32).map(|i| record(b"N", i, b"x")).collect();
        let (_dir, mut processor) = open_fixture(&records);

        assert!(processor.step_first());
        let mut seen = vec![processor.position()];
        while processor.step_next() {
            seen.push(processor.position());
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);

        assert!(processor.step_last());
        let mut seen = vec![processor.position()];
        while processor.step_previous() {
            seen.push(processor.position());
        }
        assert_eq!(seen, vec![4, 3, 2, 1]);
    }

    #[test]
    fn step_on_empty_file_reports_nothing() {
        let (_dir, mut processor) = open_fixture(&[]);
        assert!(!processor.step_first());
        assert!(!processor.step_next());
        assert!(!processor.step_last());
        assert_eq!(processor.position(), 0);
    }

    #[test]
    fn get_equal_finds_first_match_by_offset() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"Alpha", 10, b"x"),
            record(b"Beta", 20, b"x"),
            record(b"Alpha", 30, b"x"),
        ]);
        let mut key = [0u8; 32];
        key[..5].copy_from_slice(b"Alpha");
        assert!(processor.get_equal(0, &key).unwrap());
        assert_eq!(processor.position(), 1);
        assert!(!processor.get_equal(0, b"Missing").unwrap());
    }

    #[test]
    fn string_key_first_and_last_strip_trailing_nuls() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"delta", 1, b"x"),
            record(b"alpha", 2, b"x"),
            record(b"charlie", 3, b"x"),
        ]);
        assert!(processor.get_key_first(0).unwrap());
        assert_eq!(&processor.current_record().unwrap()[2..7], b"alpha");
        assert!(processor.get_key_last(0).unwrap());
        assert_eq!(&processor.current_record().unwrap()[2..7], b"delta");
    }

    #[test]
    fn numeric_key_first_and_last_are_unsigned() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"a", 0xFFFF_FFF0, b"x"),
            record(b"b", 5, b"x"),
            record(b"c", 0x8000_0000, b"x"),
        ]);
        assert!(processor.get_key_first(1).unwrap());
        assert_eq!(&processor.current_record().unwrap()[..1], b"b");
        assert!(processor.get_key_last(1).unwrap());
        assert_eq!(&processor.current_record().unwrap()[..1], b"a");
    }

    #[test]
    fn get_key_next_on_string_keys_walks_duplicates() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"dup", 1, b"x"),
            record(b"other", 2, b"x"),
            record(b"dup", 3, b"x"),
            record(b"dup", 4, b"x"),
        ]);
        let mut key = [0u8; 32];
        key[..3].copy_from_slice(b"dup");
        assert!(processor.get_equal(0, &key).unwrap());
        assert_eq!(processor.position(), 1);
        assert!(processor.get_key_next().unwrap());
        assert_eq!(processor.position(), 3);
        assert!(processor.get_key_next().unwrap());
        assert_eq!(processor.position(), 4);
        assert!(!processor.get_key_next().unwrap());
    }

    #[test]
    fn get_key_next_on_numeric_keys_increments_the_query() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"a", 7, b"x"),
            record(b"b", 8, b"x"),
        ]);
        assert!(processor.get_equal(1, &7u32.to_le_bytes()).unwrap());
        assert_eq!(processor.position(), 1);
        assert!(processor.get_key_next().unwrap());
        assert_eq!(processor.position(), 2);
        assert!(!processor.get_key_next().unwrap());
    }

    #[test]
    fn relational_scan_filters_offsets_beyond_the_cursor() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"a", 10, b"x"),
            record(b"b", 50, b"x"),
            record(b"c", 30, b"x"),
        ]);
        // Cursor at offset 2; the legacy filter hides records 1..=2 from
        // the less-than scan even though record 1 compares lower.
        processor.step_first();
        processor.step_next();
        assert!(processor.get_less(1, &40u32.to_le_bytes()).unwrap());
        assert_eq!(processor.position(), 3);

        processor.step_last();
        assert!(!processor.get_less(1, &40u32.to_le_bytes()).unwrap());

        // With the compatibility filter off the whole file is visible.
        processor.set_scan_from_position(false);
        assert!(processor.get_less(1, &40u32.to_le_bytes()).unwrap());
        assert_eq!(processor.position(), 1);
    }

    #[test]
    fn get_greater_scans_ascending_offsets() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"a", 10, b"x"),
            record(b"b", 50, b"x"),
            record(b"c", 30, b"x"),
        ]);
        processor.step_first();
        assert!(processor.get_greater(1, &20u32.to_le_bytes()).unwrap());
        assert_eq!(processor.position(), 2);
        assert!(processor.get_greater_or_equal(1, &30u32.to_le_bytes()).unwrap());
        assert_eq!(processor.position(), 3);
    }

    #[test]
    fn widened_query_keys_compare_past_the_declared_key() {
        let (_dir, mut processor) = open_fixture(&[record(b"Alpha", 1, b"")]);
        // 40-byte caller key against the 32-byte key 0: widened slice runs
        // into the ordinal field at offset 34.
        let mut wide = [0u8; 40];
        wide[..5].copy_from_slice(b"Alpha");
        wide[32..36].copy_from_slice(&1u32.to_le_bytes());
        assert!(processor.get_equal(0, &wide).unwrap());

        wide[32..36].copy_from_slice(&2u32.to_le_bytes());
        assert!(!processor.get_equal(0, &wide).unwrap());
    }

    #[test]
    fn insert_assigns_dense_offsets_and_persists() {
        let (_dir, mut processor) = open_fixture(&[]);
        assert_eq!(processor.insert(&record(b"a", 1, b"x")).unwrap(), 1);
        assert_eq!(processor.insert(&record(b"b", 2, b"x")).unwrap(), 2);
        // Length mismatch is a warning, not an error.
        assert_eq!(processor.insert(b"short").unwrap(), 3);
        assert_eq!(processor.record_count(), 3);
    }

    #[test]
    fn update_requires_exact_length() {
        let (_dir, mut processor) = open_fixture(&[record(b"a", 1, b"x")]);
        let replacement = record(b"z", 9, b"y");
        processor.update(1, &replacement).unwrap();
        assert_eq!(processor.file().records[&1], replacement);

        assert!(matches!(
            processor.update(1, b"short"),
            Err(BtrieveError::MalformedRecord { expected: 70, actual: 5 })
        ));
        assert!(matches!(
            processor.update(99, &replacement),
            Err(BtrieveError::RecordNotFound(99))
        ));
    }

    #[test]
    fn delete_keeps_cursor_so_step_next_advances() {
        let (_dir, mut processor) = open_fixture(&[
            record(b"a", 1, b"x"),
            record(b"b", 2, b"x"),
            record(b"c", 3, b"x"),
        ]);
        processor.step_first();
        processor.step_next();
        assert!(processor.delete().unwrap());
        assert!(!processor.delete().unwrap());
        assert_eq!(processor.position(), 2);
        assert!(processor.step_next());
        assert_eq!(processor.position(), 3);
    }

    #[test]
    fn delete_all_clears_and_resets() {
        let (_dir, mut processor) = open_fixture(&[record(b"a", 1, b"x")]);
        processor.delete_all().unwrap();
        assert_eq!(processor.record_count(), 0);
        assert_eq!(processor.position(), 0);
    }

    #[test]
    fn perform_maps_legacy_operation_codes() {
        let (_dir, mut processor) = open_fixture(&[record(b"a", 1, b"x")]);
        assert!(processor.perform(33, 0, &[]).unwrap()); // StepFirst
        assert!(!processor.perform(24, 0, &[]).unwrap()); // StepNext at end
        assert!(matches!(
            processor.perform(7, 0, &[]), // GetPrevious is not implemented
            Err(BtrieveError::UnsupportedOperation(7))
        ));
        assert!(matches!(
            processor.perform(200, 0, &[]),
            Err(BtrieveError::UnsupportedOperation(200))
        ));
    }

    #[test]
    fn mutation_survives_reopen_through_mirror() {
        let (dir, mut processor) = open_fixture(&[record(b"a", 1, b"x")]);
        processor.step_first();
        processor.delete().unwrap();
        drop(processor);

        let reopened = BtrieveProcessor::open(dir.path(), "MBBSEMU.DAT").unwrap();
        assert_eq!(reopened.record_count(), 0);
    }
}
