// src/extract/mod.rs

use csv::{ReaderBuilder, StringRecord};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};
use tracing::{debug, info, warn};

use crate::error::{LoadError, LoadResult};

/// Destination columns, in table order. CSV headers are matched against these
/// after lowercasing.
pub const COLUMNS: [&str; 4] = ["locationid", "borough", "zone", "service_zone"];

/// Cell values read as missing (NULL), matched exactly. This is the default
/// NA set of the dataframe reader the zone file was historically loaded with,
/// so `N/A` boroughs and service zones land as NULL.
pub const NA_VALUES: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// One row of the zone lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRecord {
    pub locationid: i32,
    pub borough: Option<String>,
    pub zone: Option<String>,
    pub service_zone: Option<String>,
}

impl ZoneRecord {
    pub fn new(locationid: i32, borough: &str, zone: &str, service_zone: &str) -> Self {
        Self {
            locationid,
            borough: Some(borough.to_string()),
            zone: Some(zone.to_string()),
            service_zone: Some(service_zone.to_string()),
        }
    }
}

/// The whole CSV held in memory.
#[derive(Debug, Default)]
pub struct ZoneTable {
    /// Header row as read, lowercased.
    pub headers: Vec<String>,
    pub records: Vec<ZoneRecord>,
}

impl ZoneTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn preview(&self, n: usize) -> &[ZoneRecord] {
        &self.records[..n.min(self.records.len())]
    }
}

/// Position of each destination column within a CSV record.
struct ColumnMap {
    idx: [usize; 4],
}

impl ColumnMap {
    fn resolve(path: &Path, headers: &[String]) -> LoadResult<Self> {
        let mut idx = [0usize; 4];
        for (slot, name) in idx.iter_mut().zip(COLUMNS) {
            *slot = headers.iter().position(|h| h == name).ok_or_else(|| {
                LoadError::parse(
                    path,
                    format!("missing column `{name}` (header: {})", headers.join(",")),
                )
            })?;
        }
        for extra in headers.iter().filter(|h| !COLUMNS.contains(&h.as_str())) {
            warn!(column = %extra, "ignoring column not in destination table");
        }
        Ok(Self { idx })
    }

    fn record(&self, path: &Path, line: u64, rec: &StringRecord) -> LoadResult<ZoneRecord> {
        let field = |i: usize| rec.get(self.idx[i]).unwrap_or("");
        let text = |i: usize| {
            let v = field(i);
            (!NA_VALUES.contains(&v)).then(|| v.to_string())
        };
        let raw_id = field(0).trim();
        let locationid = raw_id.parse::<i32>().map_err(|e| {
            LoadError::parse(path, format!("line {line}: locationid {raw_id:?}: {e}"))
        })?;
        Ok(ZoneRecord {
            locationid,
            borough: text(1),
            zone: text(2),
            service_zone: text(3),
        })
    }
}

/// Read the zone CSV at `path` fully into memory.
#[tracing::instrument(level = "info", skip(path), fields(path = %path.as_ref().display()))]
pub fn read_zone_csv<P: AsRef<Path>>(path: P) -> LoadResult<ZoneTable> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| LoadError::FileAccess {
        path: path.to_path_buf(),
        source,
    })?;
    let table = parse_zone_csv(path, BufReader::new(file))?;
    info!(rows = table.len(), "CSV loaded");
    Ok(table)
}

/// Parse zone CSV text from any reader; `path` is only used in errors.
pub fn parse_zone_csv<R: Read>(path: &Path, mut reader: R) -> LoadResult<ZoneTable> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|source| LoadError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
    if let Some(line) = unterminated_quote(&bytes) {
        return Err(LoadError::parse(
            path,
            format!("line {line}: quoted field not closed before end of file"),
        ));
    }

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes.as_slice());

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| csv_error(path, e))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect();
    debug!(?headers, "normalized header");
    let columns = ColumnMap::resolve(path, &headers)?;

    let mut records = Vec::new();
    let mut rec = StringRecord::new();
    loop {
        match rdr.read_record(&mut rec) {
            Ok(true) => {
                let line = rec.position().map_or(0, |p| p.line());
                records.push(columns.record(path, line, &rec)?);
            }
            Ok(false) => break,
            Err(e) => return Err(csv_error(path, e)),
        }
    }

    Ok(ZoneTable { headers, records })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    FieldStart,
    Unquoted,
    Quoted,
    /// A `"` seen inside a quoted field: either `""` or the closing quote.
    QuoteInQuoted,
}

/// Walk the raw bytes with the reader's quoting rules and return the line a
/// still-open quoted field started on. The csv reader closes such a field at
/// end of input without complaint.
fn unterminated_quote(bytes: &[u8]) -> Option<u64> {
    let mut state = Quote::FieldStart;
    let mut line = 1u64;
    let mut opened_at = 0u64;
    for &b in bytes {
        state = match (state, b) {
            (Quote::Quoted, _) if b != b'"' => Quote::Quoted,
            (Quote::Quoted, _) => Quote::QuoteInQuoted,
            (Quote::QuoteInQuoted, b'"') => Quote::Quoted,
            (Quote::FieldStart, b'"') => {
                opened_at = line;
                Quote::Quoted
            }
            (_, b',' | b'\n' | b'\r') => Quote::FieldStart,
            _ => Quote::Unquoted,
        };
        if b == b'\n' {
            line += 1;
        }
    }
    (state == Quote::Quoted).then_some(opened_at)
}

fn csv_error(path: &Path, err: csv::Error) -> LoadError {
    let message = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => LoadError::FileAccess {
            path: path.to_path_buf(),
            source,
        },
        _ => LoadError::parse(path, message),
    }
}
