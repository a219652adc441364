//! CSV input reading.
//!
//! Turns the delivered feed into [`RawRow`]s keyed by header name. Column
//! order does not matter; mapping happens later in the record mapper.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{ImportError, ImportResult, MappingError};

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// One data row before mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    /// 1-based line number (header = 1, first data row = 2).
    pub line: usize,
    /// Header name → raw cell value.
    pub cells: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            cells: BTreeMap::new(),
        }
    }

    /// Add a cell using builder pattern.
    #[must_use]
    pub fn with(mut self, header: &str, value: &str) -> Self {
        self.cells.insert(header.to_string(), value.to_string());
        self
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells.get(header).map(String::as_str)
    }
}

/// Rows read from one input feed.
#[derive(Debug, Clone, Default)]
pub struct CsvInput {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    /// Rows the CSV parser itself rejected.
    pub errors: Vec<MappingError>,
}

/// Strip UTF-8 BOM from the beginning of data if present.
fn strip_utf8_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(UTF8_BOM).unwrap_or(data)
}

/// Read a whole CSV feed.
///
/// Fails only when the feed cannot be read at all (I/O error, empty input,
/// unreadable header). Malformed data rows are returned in
/// [`CsvInput::errors`].
pub fn read_csv(mut input: impl Read, delimiter: u8) -> ImportResult<CsvInput> {
    let mut data = Vec::new();
    input
        .read_to_end(&mut data)
        .map_err(|e| ImportError::Input {
            message: e.to_string(),
        })?;
    let data = strip_utf8_bom(&data);
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(ImportError::Input {
            message: "input is empty".to_string(),
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut out = CsvInput {
        headers: headers.clone(),
        ..CsvInput::default()
    };

    for (idx, result) in reader.records().enumerate() {
        let fallback_line = idx + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                let line = e
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(fallback_line);
                out.errors
                    .push(MappingError::new(line, "", format!("cannot parse row: {e}")));
                continue;
            }
        };
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(fallback_line);

        let mut row = RawRow::new(line);
        for (header, value) in headers.iter().zip(record.iter()) {
            // first occurrence of a duplicated header wins
            row.cells
                .entry(header.clone())
                .or_insert_with(|| value.to_string());
        }
        out.rows.push(row);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_rows_keyed_by_header() {
        let csv = "Vorname,Nachname,Schule\nAnna,Müller,SchoolA\nMax,Meier,SchoolB\n";
        let input = read_csv(csv.as_bytes(), b',').unwrap();
        assert_eq!(input.headers, vec!["Vorname", "Nachname", "Schule"]);
        assert_eq!(input.rows.len(), 2);
        assert_eq!(input.rows[0].line, 2);
        assert_eq!(input.rows[1].line, 3);
        assert_eq!(input.rows[0].get("Nachname"), Some("Müller"));
    }

    #[test]
    fn test_semicolon_and_quoted_delimiters() {
        let csv = "Name;Klassen\n\"Anna\";\"1a;2b\"\n";
        let input = read_csv(csv.as_bytes(), b';').unwrap();
        assert_eq!(input.rows[0].get("Klassen"), Some("1a;2b"));
    }

    #[test]
    fn test_utf8_bom_is_stripped() {
        let mut csv = UTF8_BOM.to_vec();
        csv.extend_from_slice(b"ID,Name\n7,Anna");
        let input = read_csv(csv.as_slice(), b',').unwrap();
        assert_eq!(input.headers[0], "ID");
        assert_eq!(input.rows[0].get("ID"), Some("7"));
    }

    #[test]
    fn test_short_rows_leave_cells_absent() {
        let csv = "ID,Name,Email\n7,Anna\n";
        let input = read_csv(csv.as_bytes(), b',').unwrap();
        assert_eq!(input.rows[0].get("Email"), None);
    }

    #[test]
    fn test_multiline_cells_keep_line_numbers() {
        let csv = "ID,Note\n1,\"two\nlines\"\n2,x\n";
        let input = read_csv(csv.as_bytes(), b',').unwrap();
        assert_eq!(input.rows[0].line, 2);
        assert_eq!(input.rows[1].line, 4);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(matches!(
            read_csv("  \n".as_bytes(), b','),
            Err(ImportError::Input { .. })
        ));
    }
}
