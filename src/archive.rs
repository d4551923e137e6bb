//! Streaming access to package archives.
//!
//! Archives are tarballs behind zstd, xz or gzip compression. The streams
//! cannot rewind, and the adapter needs two passes (symlinks first, then
//! regular files), so every [`scan`](ArchiveReader::scan) re-opens the file.

use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use flate2::read::GzDecoder;
use tar::Entry;
use xz2::read::XzDecoder;

use crate::Error;

/// One package archive on disk.
#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
}

impl ArchiveReader {
    /// Refer to the archive at `path`; the file is opened per scan.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Iterate over all entries, in archive order.
    ///
    /// The callback may read the current entry's content; entries it does
    /// not touch are skipped over without decompressing their payload.
    pub fn scan<F>(&self, mut on_entry: F) -> Result<(), Error>
    where
        F: FnMut(&mut Entry<'_, Box<dyn Read>>) -> Result<(), Error>,
    {
        let mut archive = tar::Archive::new(self.reader()?);
        for entry in archive.entries().map_err(|e| self.malformed(e))? {
            let mut entry = entry.map_err(|e| self.malformed(e))?;
            on_entry(&mut entry)?;
        }
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn Read>, Error> {
        let file = fs_err::File::open(&self.path)?;
        let reader: Box<dyn Read> = match extension(&self.path) {
            Some("zst") => Box::new(
                zstd::stream::read::Decoder::new(file).map_err(|e| self.malformed(e))?,
            ),
            Some("xz") => Box::new(XzDecoder::new(file)),
            Some("gz") => Box::new(GzDecoder::new(file)),
            _ => Box::new(file),
        };
        Ok(reader)
    }

    /// Decompress the current entry's content into memory.
    pub fn read_entry_data(&self, entry: &mut Entry<'_, Box<dyn Read>>) -> Result<Vec<u8>, Error> {
        let declared = entry.header().size().map_err(|e| self.malformed(e))?;
        let mut data = Vec::with_capacity(declared as usize);
        entry.read_to_end(&mut data).map_err(|e| self.malformed(e))?;
        if data.len() as u64 != declared {
            return Err(Error::Malformed(format!(
                "`{}`: entry has {} bytes, header declares {declared}",
                self.path.display(),
                data.len()
            )));
        }
        Ok(data)
    }

    fn malformed<E: std::fmt::Display>(&self, e: E) -> Error {
        Error::Malformed(format!("`{}`: {e}", self.path.display()))
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension()?.to_str()
}
