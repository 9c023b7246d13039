//! WAL segment records and their catalog line encoding.

use std::fmt;
use std::str::FromStr;

use crate::error::CatalogError;

/// Leading tag of a WAL record line.
pub const WAL_TAG: &str = "WAL";
/// Token written in place of an absent compression.
const NO_COMPRESSION: &str = "None";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Gzip,
    Bzip2,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bz2",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "bz2" => Ok(Compression::Bzip2),
            other => Err(format!("unknown compression {other:?}")),
        }
    }
}

/// Metadata about one archived WAL segment. Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub name: String,
    pub size: u64,
    /// Archival time, seconds since the epoch.
    pub time: f64,
    pub compression: Option<Compression>,
}

impl WalRecord {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        time: f64,
        compression: Option<Compression>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            time,
            compression,
        }
    }

    /// Fields are whitespace separated on read, so the name must be a single
    /// non-empty token and the time a finite number.
    pub fn check(&self) -> Result<(), CatalogError> {
        let reason = if self.name.is_empty() {
            "name is empty"
        } else if self.name.chars().any(char::is_whitespace) {
            "name contains whitespace"
        } else if !self.time.is_finite() {
            "time is not a finite number"
        } else {
            return Ok(());
        };
        Err(CatalogError::InvalidRecord {
            name: self.name.clone(),
            reason: reason.to_string(),
        })
    }

    /// Tab separated catalog line, newline included.
    pub fn to_line(&self) -> String {
        let compression = self
            .compression
            .map(|c| c.as_str())
            .unwrap_or(NO_COMPRESSION);
        // `{:?}` keeps the fractional part, so whole seconds read back as floats.
        format!(
            "{WAL_TAG}\t{}\t{}\t{:?}\t{}\n",
            self.name, self.size, self.time, compression
        )
    }
}

/// What a single catalog line holds.
#[derive(Debug, PartialEq)]
pub(crate) enum CatalogLine {
    Wal(WalRecord),
    /// A record kind this version does not know about.
    Other,
    Blank,
}

/// Parse one catalog line. `line_no` is 1-based and only used for errors.
pub(crate) fn parse_line(line: &str, line_no: usize) -> Result<CatalogLine, CatalogError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(tag) = tokens.first() else {
        return Ok(CatalogLine::Blank);
    };
    if *tag != WAL_TAG {
        return Ok(CatalogLine::Other);
    }

    let corrupt = |reason: String| CatalogError::Corruption {
        line: line_no,
        content: line.to_string(),
        reason,
    };

    let (name, size, time, compression) = match tokens.as_slice() {
        [_, name, size, time, compression] => (*name, *size, *time, Some(*compression)),
        // legacy lines predate the compression column
        [_, name, size, time] => (*name, *size, *time, None),
        other => return Err(corrupt(format!("expected 4 or 5 fields, got {}", other.len()))),
    };

    let size = size
        .parse::<u64>()
        .map_err(|e| corrupt(format!("invalid size {size:?}: {e}")))?;
    let time = time
        .parse::<f64>()
        .map_err(|e| corrupt(format!("invalid time {time:?}: {e}")))?;
    let compression = match compression {
        None | Some(NO_COMPRESSION) => None,
        Some(token) => Some(token.parse::<Compression>().map_err(corrupt)?),
    };

    Ok(CatalogLine::Wal(WalRecord {
        name: name.to_string(),
        size,
        time,
        compression,
    }))
}
