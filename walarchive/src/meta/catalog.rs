//! Append-only catalog of archived WAL segments.
//!
//! One record per line in `<dir>/metadata.csv`. Records are addressed by
//! ordinal position (line index, blank lines excluded), never by byte offset.
//! A position is only meaningful for the scan that produced it: deleting a
//! record rewrites the file and shifts every later position down by one.
//!
//! There is no cross-process locking; callers run one writer per catalog.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::record::{CatalogLine, WalRecord, parse_line};
use crate::error::{CatalogError, CatalogResult};

pub const CATALOG_FILE: &str = "metadata.csv";

#[derive(Debug, Clone)]
pub struct WalCatalog {
    path: PathBuf,
    current_position: usize,
}

impl WalCatalog {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: dir.as_ref().join(CATALOG_FILE),
            current_position: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last position served by [`WalCatalog::record_at`].
    pub fn current_position(&self) -> usize {
        self.current_position
    }

    /// Lazily scan records starting at `from_position`.
    ///
    /// Every call reopens the file. A missing catalog is an empty scan.
    pub fn records(&self, from_position: usize) -> CatalogResult<CatalogScan> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(CatalogScan {
            reader,
            buf: String::new(),
            line_no: 0,
            position: 0,
            from_position,
        })
    }

    /// Read the first record at or after `position` and remember `position`
    /// so the caller can pick up from there.
    pub fn record_at(&mut self, position: usize) -> CatalogResult<Option<WalRecord>> {
        let record = self.records(position)?.next().transpose()?;
        if record.is_some() {
            self.current_position = position;
        }
        Ok(record)
    }

    /// Append records one line at a time. Each line is flushed and synced
    /// before the next one is written, so a crash leaves a prefix of the batch.
    /// The whole batch is rejected, and nothing written, if any record cannot
    /// be read back.
    pub fn append_records<'a, I>(&self, records: I) -> CatalogResult<()>
    where
        I: IntoIterator<Item = &'a WalRecord>,
    {
        let records: Vec<&WalRecord> = records.into_iter().collect();
        for record in &records {
            record.check()?;
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let created = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if created {
            sync_dir(&self.path)?;
        }

        for record in records {
            file.write_all(record.to_line().as_bytes())?;
            file.flush()?;
            file.sync_all()?;
            debug!(name = %record.name, size = record.size, "appended WAL record");
        }
        Ok(())
    }

    pub fn has_content(&self) -> CatalogResult<bool> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut first = String::new();
        BufReader::new(file).read_line(&mut first)?;
        Ok(first.split_whitespace().next().is_some())
    }

    /// Remove the record whose name equals `record.name`.
    ///
    /// Survivors are written to a sibling temporary file which is synced and
    /// renamed over the catalog. On failure the original file is untouched;
    /// once the rename succeeded the call reports success.
    /// Returns whether a record was removed.
    pub fn delete_record(&self, record: &WalRecord) -> CatalogResult<bool> {
        let source = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let tmp_path = self.temp_path();

        let result = write_without(source, &tmp_path, &record.name).and_then(|removed| {
            if removed > 0 {
                replace_file(&tmp_path, &self.path, sync_dir)?;
            } else {
                fs::remove_file(&tmp_path)?;
            }
            Ok(removed)
        });

        match result {
            Ok(removed) => {
                if removed > 0 {
                    info!(name = %record.name, "deleted WAL record from catalog");
                }
                Ok(removed > 0)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// Drop every record.
    pub fn truncate(&self) -> CatalogResult<()> {
        match OpenOptions::new().write(true).truncate(true).open(&self.path) {
            Ok(file) => {
                file.sync_all()?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".new");
        PathBuf::from(name)
    }
}

/// Copy every line of `source` except WAL records named `name` into a new
/// file at `dest`, synced to disk. Returns how many lines were dropped.
fn write_without(source: File, dest: &Path, name: &str) -> CatalogResult<usize> {
    let mut out = io::BufWriter::new(File::create(dest)?);
    let mut removed = 0;
    for (idx, line) in BufReader::new(source).lines().enumerate() {
        let line = line?;
        match parse_line(&line, idx + 1)? {
            CatalogLine::Wal(r) if r.name == name => removed += 1,
            CatalogLine::Blank => {}
            _ => {
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
    }
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(removed)
}

/// Rename `tmp` over `dest`, then sync the directory. A sync failure is
/// logged only: the catalog has already been replaced.
fn replace_file(
    tmp: &Path,
    dest: &Path,
    sync: impl FnOnce(&Path) -> io::Result<()>,
) -> io::Result<()> {
    fs::rename(tmp, dest)?;
    if let Err(e) = sync(dest) {
        warn!(path = %dest.display(), error = %e, "failed to sync catalog directory");
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Pull-based scan over the catalog, created by [`WalCatalog::records`].
///
/// Lines before the starting position are counted but not parsed. The scan
/// ends after the first error.
pub struct CatalogScan {
    reader: Option<BufReader<File>>,
    buf: String,
    line_no: usize,
    position: usize,
    from_position: usize,
}

impl CatalogScan {
    /// Number of positions consumed so far; scanning again from here resumes
    /// after the last record returned.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Iterator for CatalogScan {
    type Item = Result<WalRecord, CatalogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.reader.as_mut()?;
            self.buf.clear();
            match reader.read_line(&mut self.buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.reader = None;
                    return Some(Err(e.into()));
                }
            }
            self.line_no += 1;
            if self.buf.trim().is_empty() {
                continue;
            }

            let position = self.position;
            self.position += 1;
            if position < self.from_position {
                continue;
            }

            match parse_line(self.buf.trim_end(), self.line_no) {
                Ok(CatalogLine::Wal(record)) => return Some(Ok(record)),
                Ok(_) => continue,
                Err(e) => {
                    self.reader = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
