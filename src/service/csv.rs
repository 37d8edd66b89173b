//! Structural validation of uploaded CSV bytes.
//!
//! Checks that the upload decodes, is not blank, and keeps a consistent
//! column count across a sample of rows. Quoted fields may contain the
//! delimiter but not line breaks.

use crate::error::{Error, Result};

/// Bytes of decoded text inspected for delimiter sniffing.
const MAX_SAMPLE_BYTES: usize = 64 * 1024;
/// Rows checked for column consistency.
const MAX_ROWS: usize = 500;
const DELIMITERS: [char; 4] = [',', ';', '\t', '|'];

/// What validation learned about the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvSummary {
    pub encoding: &'static str,
    pub delimiter: char,
    pub columns: usize,
    pub sampled_rows: usize,
}

/// Validate an upload. All problems found are reported together.
pub fn validate_csv(bytes: &[u8]) -> Result<CsvSummary> {
    let (text, encoding) = match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), "utf-8"),
        // Every byte is a valid Latin-1 code point.
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), "latin-1"),
    };

    let sample = truncate_at_char_boundary(&text, MAX_SAMPLE_BYTES);
    if sample.trim().is_empty() {
        return Err(Error::Validation(
            "file is empty or contains only blank lines".to_string(),
        ));
    }

    let delimiter = sniff_delimiter(sample);
    let mut errors = Vec::new();
    let mut expected = None;
    let mut sampled_rows = 0;

    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let columns = count_fields(line, delimiter);
        sampled_rows += 1;
        match expected {
            None => expected = Some(columns),
            Some(want) if want != columns => errors.push(format!(
                "row {} has {columns} columns, expected {want}",
                n + 1
            )),
            Some(_) => {}
        }
        if sampled_rows >= MAX_ROWS {
            break;
        }
    }

    if !errors.is_empty() {
        return Err(Error::Validation(errors.join("; ")));
    }

    Ok(CsvSummary {
        encoding,
        delimiter,
        columns: expected.unwrap_or(0),
        sampled_rows,
    })
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Pick the candidate delimiter appearing the same non-zero number of times
/// on every sampled line, preferring the most frequent. Falls back to the
/// first candidate present at all, then to a comma.
fn sniff_delimiter(sample: &str) -> char {
    let lines: Vec<&str> = sample
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(20)
        .collect();

    let consistent = DELIMITERS
        .iter()
        .filter_map(|&d| {
            let counts: Vec<usize> = lines.iter().map(|l| count_fields(l, d) - 1).collect();
            let first = *counts.first()?;
            (first > 0 && counts.iter().all(|c| *c == first)).then_some((d, first))
        })
        .max_by_key(|(_, count)| *count);

    consistent
        .map(|(d, _)| d)
        .or_else(|| DELIMITERS.iter().copied().find(|d| sample.contains(*d)))
        .unwrap_or(',')
}

/// Fields on one line, ignoring delimiters inside double quotes.
fn count_fields(line: &str, delimiter: char) -> usize {
    let mut in_quotes = false;
    let mut fields = 1;
    for c in line.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == delimiter && !in_quotes {
            fields += 1;
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_consistent_csv() {
        let summary = validate_csv(b"sp_id,do_id\nSP1,DO1\nSP2,DO2\n").unwrap();
        assert_eq!(summary.delimiter, ',');
        assert_eq!(summary.columns, 2);
        assert_eq!(summary.sampled_rows, 3);
        assert_eq!(summary.encoding, "utf-8");
    }

    #[test]
    fn sniffs_semicolons_and_skips_blank_rows() {
        let summary = validate_csv(b"a;b;c\n\n1;2;3\n4;5;6\n").unwrap();
        assert_eq!(summary.delimiter, ';');
        assert_eq!(summary.columns, 3);
        assert_eq!(summary.sampled_rows, 3);
    }

    #[test]
    fn quoted_delimiters_do_not_split() {
        let summary = validate_csv(b"name,city\n\"Doe, J\",Lima\n").unwrap();
        assert_eq!(summary.columns, 2);
    }

    #[test]
    fn rejects_blank_upload() {
        assert!(matches!(validate_csv(b"  \n\n"), Err(Error::Validation(_))));
        assert!(matches!(validate_csv(b""), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = validate_csv(b"a,b\n1,2\n3\n").unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("row 3"), "{msg}"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_latin1() {
        let summary = validate_csv(b"nombre,ciudad\nJos\xe9,Le\xf3n\n").unwrap();
        assert_eq!(summary.encoding, "latin-1");
        assert_eq!(summary.columns, 2);
    }
}
