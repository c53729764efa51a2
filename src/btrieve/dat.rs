//! Parser for the legacy binary `.DAT` layout. Header fields sit at fixed
//! offsets; key definitions follow at 0x110 in 0x1E-byte blocks; records
//! live in fixed-size slots inside data pages.

use std::collections::BTreeMap;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;
use num_traits::FromPrimitive;

use crate::btrieve::key::{BtrieveKey, KeyAttributes, KeyDataType, KeyDefinition};
use crate::btrieve::{BtrieveError, BtrieveFile};

pub const PAGE_LENGTH_OFFSET: u64 = 0x08;
pub const KEY_COUNT_OFFSET: u64 = 0x14;
pub const RECORD_LENGTH_OFFSET: u64 = 0x16;
pub const PHYSICAL_RECORD_LENGTH_OFFSET: u64 = 0x18;
pub const RECORD_COUNT_OFFSET: u64 = 0x1A;
pub const PAGE_COUNT_OFFSET: u64 = 0x26;
pub const LOG_KEY_OFFSET: u64 = 0x10C;
pub const KEY_DEFINITION_BASE: u64 = 0x110;
pub const KEY_DEFINITION_LENGTH: u64 = 0x1E;

/// Within a key definition block.
const DEF_POSITION: u64 = 0x00;
const DEF_LENGTH: u64 = 0x02;
const DEF_ATTRIBUTES: u64 = 0x04;
const DEF_DATA_TYPE: u64 = 0x1C;

/// Marker dword opening a key page (at page offset 8).
const KEY_PAGE_MARKER: u32 = 0xFFFF_FFFF;
/// Marker byte of a key-constraint page (at page offset 6).
const CONSTRAINT_PAGE_MARKER: u8 = 0xAC;
/// Record slots whose first dword is all-ones are unoccupied.
const EMPTY_SLOT_MARKER: u32 = 0xFFFF_FFFF;
/// Records start this many bytes into a data page.
const DATA_PAGE_HEADER: usize = 6;

pub fn parse(data: &[u8]) -> Result<BtrieveFile, BtrieveError> {
    if (data.len() as u64) < KEY_DEFINITION_BASE {
        return Err(BtrieveError::MalformedFile(format!(
            "file is {} bytes, smaller than the fixed header",
            data.len()
        )));
    }
    let mut cursor = Cursor::new(data);

    cursor.set_position(PAGE_LENGTH_OFFSET);
    let page_length = cursor.read_u16::<LittleEndian>()?;
    cursor.set_position(KEY_COUNT_OFFSET);
    let key_count = cursor.read_u16::<LittleEndian>()?;
    cursor.set_position(RECORD_LENGTH_OFFSET);
    let record_length = cursor.read_u16::<LittleEndian>()?;
    cursor.set_position(PHYSICAL_RECORD_LENGTH_OFFSET);
    let physical_record_length = cursor.read_u16::<LittleEndian>()?;
    cursor.set_position(RECORD_COUNT_OFFSET);
    let record_count = cursor.read_u32::<LittleEndian>()?;
    cursor.set_position(PAGE_COUNT_OFFSET);
    let page_count = cursor.read_u16::<LittleEndian>()?;
    cursor.set_position(LOG_KEY_OFFSET);
    let log_key_present = cursor.read_u8()? != 0;

    if page_length == 0 || physical_record_length == 0 {
        return Err(BtrieveError::MalformedFile(format!(
            "implausible geometry: page length {page_length}, physical record length {physical_record_length}"
        )));
    }

    let keys = parse_keys(&mut cursor, key_count)?;
    let records = parse_records(
        data,
        page_length,
        page_count,
        record_length,
        physical_record_length,
        record_count,
    );

    Ok(BtrieveFile {
        record_length,
        physical_record_length,
        page_length,
        page_count,
        log_key_present,
        keys,
        records,
    })
}

/// A definition carrying the `SEGMENTED_KEY` attribute extends the previous
/// key instead of opening the next key number, so the number of blocks read
/// can exceed `key_count`.
fn parse_keys(
    cursor: &mut Cursor<&[u8]>,
    key_count: u16,
) -> Result<BTreeMap<u16, BtrieveKey>, BtrieveError> {
    let mut keys: BTreeMap<u16, BtrieveKey> = BTreeMap::new();
    let mut block = 0u64;
    let mut next_number = 0u16;

    loop {
        let base = KEY_DEFINITION_BASE + block * KEY_DEFINITION_LENGTH;
        if (keys.len() as u16) >= key_count {
            // All numbered keys assembled; only a trailing continuation
            // block may extend the last one.
            if base + KEY_DEFINITION_LENGTH > cursor.get_ref().len() as u64 {
                break;
            }
            cursor.set_position(base + DEF_ATTRIBUTES);
            let attributes = KeyAttributes::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
            if !attributes.contains(KeyAttributes::SEGMENTED_KEY) {
                break;
            }
        }
        block += 1;

        cursor.set_position(base + DEF_POSITION);
        let position = cursor.read_u16::<LittleEndian>()?;
        cursor.set_position(base + DEF_LENGTH);
        let length = cursor.read_u16::<LittleEndian>()?;
        cursor.set_position(base + DEF_ATTRIBUTES);
        let attributes = KeyAttributes::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        cursor.set_position(base + DEF_DATA_TYPE);
        let raw_type = cursor.read_u8()?;
        let data_type = KeyDataType::from_u8(raw_type).ok_or_else(|| {
            BtrieveError::MalformedFile(format!("unknown key data type {raw_type:#04X}"))
        })?;

        if position == 0 {
            return Err(BtrieveError::MalformedFile(format!(
                "key definition {} has position 0 (positions are 1-based)",
                block - 1
            )));
        }

        let continuation = attributes.contains(KeyAttributes::SEGMENTED_KEY) && next_number > 0;
        let number = if continuation { next_number - 1 } else { next_number };
        let definition = KeyDefinition {
            number,
            offset: position - 1,
            length,
            data_type,
            attributes,
        };

        if continuation {
            keys.get_mut(&number)
                .expect("continuation always follows a defined key")
                .segments
                .push(definition);
        } else {
            keys.insert(number, BtrieveKey::new(definition));
            next_number += 1;
        }
    }
    Ok(keys)
}

fn parse_records(
    data: &[u8],
    page_length: u16,
    page_count: u16,
    record_length: u16,
    physical_record_length: u16,
    record_count: u32,
) -> BTreeMap<u32, Vec<u8>> {
    let mut records = BTreeMap::new();
    let page_length = page_length as usize;
    let mut next_offset = 1u32;

    for page in 1..page_count as usize {
        let page_offset = page * page_length;
        if page_offset + page_length > data.len() {
            warn!("page {page} runs past end of file, stopping record scan");
            break;
        }
        let page_data = &data[page_offset..page_offset + page_length];

        let marker = u32::from_le_bytes([page_data[8], page_data[9], page_data[10], page_data[11]]);
        if marker == KEY_PAGE_MARKER {
            continue;
        }
        if page_data[6] == CONSTRAINT_PAGE_MARKER {
            continue;
        }
        if page_data[5] & 0x80 == 0 {
            warn!("page {page} lacks the data-page marker, skipping");
            continue;
        }

        let mut slot = DATA_PAGE_HEADER;
        while slot + physical_record_length as usize <= page_length {
            if records.len() as u32 >= record_count {
                break;
            }
            let raw = &page_data[slot..slot + physical_record_length as usize];
            slot += physical_record_length as usize;

            let lead = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if lead == EMPTY_SLOT_MARKER {
                continue;
            }
            records.insert(next_offset, raw[..record_length as usize].to_vec());
            next_offset += 1;
        }
    }
    records
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Builds synthetic `.DAT` images shaped like the reference fixture:
    //! 512-byte pages, 70-byte records in 86-byte slots, three keys.

    use super::*;

    pub struct DatBuilder {
        pub page_length: u16,
        pub record_length: u16,
        pub physical_record_length: u16,
        pub keys: Vec<(u16, u16, u16, u8)>, // (position, length, attributes, data_type)
        pub records: Vec<Vec<u8>>,
        /// Index pages between the header and the data pages, marked with
        /// the key-page dword so the record scan skips them.
        pub key_pages: usize,
    }

    impl DatBuilder {
        /// The reference fixture geometry: 4 pages of 512 bytes, 70-byte
        /// records in 86-byte slots, three keys.
        pub fn reference() -> Self {
            Self {
                page_length: 512,
                record_length: 70,
                physical_record_length: 86,
                keys: vec![
                    // Zstring len 32 at offset 2, Duplicates
                    (3, 32, 0x0001, 11),
                    // Integer len 4 at offset 34, Modifiable
                    (35, 4, 0x0002, 1),
                    // Zstring len 32 at offset 38, Duplicates|Modifiable
                    (39, 32, 0x0003, 11),
                ],
                records: Vec::new(),
                key_pages: 2,
            }
        }

        pub fn build(&self) -> Vec<u8> {
            let slots_per_page =
                (self.page_length as usize - DATA_PAGE_HEADER) / self.physical_record_length as usize;
            let data_pages = if self.records.is_empty() {
                1
            } else {
                self.records.len().div_ceil(slots_per_page)
            };
            // The fixed header (key definitions included) must fit in the
            // leading pages before any index or data page.
            let header_pages = (KEY_DEFINITION_BASE as usize
                + self.keys.len() * KEY_DEFINITION_LENGTH as usize)
                .div_ceil(self.page_length as usize);
            let first_data_page = header_pages + self.key_pages;
            let page_count = first_data_page + data_pages;
            let mut data = vec![0u8; page_count * self.page_length as usize];

            let put16 = |data: &mut [u8], at: usize, v: u16| {
                data[at..at + 2].copy_from_slice(&v.to_le_bytes());
            };
            put16(&mut data, PAGE_LENGTH_OFFSET as usize, self.page_length);
            put16(&mut data, KEY_COUNT_OFFSET as usize, self.key_count());
            put16(&mut data, RECORD_LENGTH_OFFSET as usize, self.record_length);
            put16(
                &mut data,
                PHYSICAL_RECORD_LENGTH_OFFSET as usize,
                self.physical_record_length,
            );
            data[RECORD_COUNT_OFFSET as usize..RECORD_COUNT_OFFSET as usize + 4]
                .copy_from_slice(&(self.records.len() as u32).to_le_bytes());
            put16(&mut data, PAGE_COUNT_OFFSET as usize, page_count as u16);

            for (i, &(position, length, attributes, data_type)) in self.keys.iter().enumerate() {
                let base = KEY_DEFINITION_BASE as usize + i * KEY_DEFINITION_LENGTH as usize;
                put16(&mut data, base + DEF_POSITION as usize, position);
                put16(&mut data, base + DEF_LENGTH as usize, length);
                put16(&mut data, base + DEF_ATTRIBUTES as usize, attributes);
                data[base + DEF_DATA_TYPE as usize] = data_type;
            }

            // Header-overflow pages and index pages both carry the key-page
            // marker so the record scan skips them.
            for page in 1..first_data_page {
                let at = page * self.page_length as usize + 8;
                data[at..at + 4].copy_from_slice(&KEY_PAGE_MARKER.to_le_bytes());
            }

            let mut record_iter = self.records.iter();
            for page in first_data_page..page_count {
                let page_base = page * self.page_length as usize;
                data[page_base + 5] = 0x80;
                let mut slot = page_base + DATA_PAGE_HEADER;
                for _ in 0..slots_per_page {
                    match record_iter.next() {
                        Some(record) => {
                            data[slot..slot + self.record_length as usize]
                                .copy_from_slice(&record[..self.record_length as usize]);
                        }
                        None => {
                            data[slot..slot + 4].copy_from_slice(&EMPTY_SLOT_MARKER.to_le_bytes());
                        }
                    }
                    slot += self.physical_record_length as usize;
                }
            }
            data
        }

        fn key_count(&self) -> u16 {
            self.keys
                .iter()
                .filter(|&&(_, _, attributes, _)| attributes & 0x0010 == 0)
                .count() as u16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::DatBuilder;
    use super::*;

    fn reference_record(name: &[u8], ordinal: u32, alt: &[u8]) -> Vec<u8> {
        let mut record = vec![0u8; 70];
        record[0] = 0x01;
        record[2..2 + name.len()].copy_from_slice(name);
        record[34..38].copy_from_slice(&ordinal.to_le_bytes());
        record[38..38 + alt.len()].copy_from_slice(alt);
        record
    }

    #[test]
    fn parses_reference_geometry() {
        let mut builder = DatBuilder::reference();
        builder.records.push(reference_record(b"Sysop", 1, b"Sysop"));
        builder.records.push(reference_record(b"Guest", 2, b"Guest"));
        let image = builder.build();

        let file = parse(&image).unwrap();
        assert_eq!(file.keys.len(), 3);
        assert_eq!(file.record_length, 70);
        assert_eq!(file.physical_record_length, 86);
        assert_eq!(file.page_length, 512);
        assert_eq!(file.page_count, 4);
        assert!(!file.log_key_present);

        let key0 = &file.keys[&0];
        assert_eq!(key0.data_type(), KeyDataType::Zstring);
        assert_eq!(key0.total_length(), 32);
        assert_eq!(key0.offset(), 2);
        assert!(key0.segments[0].allows_duplicates());

        let key1 = &file.keys[&1];
        assert_eq!(key1.data_type(), KeyDataType::Integer);
        assert_eq!(key1.total_length(), 4);
        assert_eq!(key1.offset(), 34);
        assert!(key1.segments[0].attributes.contains(KeyAttributes::MODIFIABLE));

        let key2 = &file.keys[&2];
        assert_eq!(key2.data_type(), KeyDataType::Zstring);
        assert_eq!(key2.offset(), 38);
        assert!(key2.segments[0].allows_duplicates());
        assert!(key2.segments[0].attributes.contains(KeyAttributes::MODIFIABLE));

        assert_eq!(file.records.len(), 2);
        assert_eq!(&file.records[&1][2..7], b"Sysop");
        assert_eq!(&file.records[&2][2..7], b"Guest");
    }

    #[test]
    fn segmented_definitions_extend_previous_key() {
        let mut builder = DatBuilder::reference();
        builder.keys = vec![
            (1, 4, 0x0000, 1),
            (3, 16, 0x0001, 11),
            // continuation of key 1
            (19, 8, 0x0011, 11),
        ];
        let image = builder.build();
        let file = parse(&image).unwrap();
        assert_eq!(file.keys.len(), 2);
        assert_eq!(file.keys[&1].segments.len(), 2);
        assert_eq!(file.keys[&1].total_length(), 24);
        assert_eq!(file.keys[&1].segments[1].offset, 18);
    }

    #[test]
    fn empty_slots_and_key_pages_are_skipped() {
        let builder = DatBuilder::reference();
        let image = builder.build();
        let file = parse(&image).unwrap();
        assert!(file.records.is_empty());
    }

    #[test]
    fn truncated_header_is_malformed() {
        assert!(matches!(
            parse(&[0u8; 0x100]),
            Err(BtrieveError::MalformedFile(_))
        ));
    }
}
