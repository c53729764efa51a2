//! The `.EMU` structured mirror: the fully deserialized file state as
//! gzip-compressed JSON. Once a mirror exists, loads bypass the legacy
//! `.DAT` parser entirely. Writes go through a temp file and a rename so a
//! crash mid-flush never leaves a torn mirror.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::btrieve::{BtrieveError, BtrieveFile};

pub fn load(path: &Path) -> Result<BtrieveFile, BtrieveError> {
    let reader = GzDecoder::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn save(file: &BtrieveFile, path: &Path) -> Result<(), BtrieveError> {
    let tmp = path.with_extension("EMU.tmp");
    {
        let mut encoder = GzEncoder::new(File::create(&tmp)?, Compression::default());
        serde_json::to_writer(&mut encoder, file)?;
        encoder.finish()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Recovery dump: `"<len>,"` in ASCII, the raw record bytes, CRLF per
/// record, 0x1A terminating the file.
pub fn dump_records(file: &BtrieveFile, out: &mut dyn Write) -> io::Result<()> {
    for data in file.records.values() {
        write!(out, "{},", data.len())?;
        out.write_all(data)?;
        out.write_all(&[0x0D, 0x0A])?;
    }
    out.write_all(&[0x1A])?;
    Ok(())
}
