//! Checksum records and their `filename,checksum[,timestamp]` text form.

use std::fmt;
use std::io::BufRead;

use sha2::{Digest, Sha256};

pub use arcgrid_bus::Checksum;

use crate::error::{ReplError, Result};

/// Checksum of a byte string.
pub fn digest(bytes: &[u8]) -> Checksum {
    Checksum::new(format!("{:x}", Sha256::digest(bytes)))
}

/// One authoritative (or reported) filename to checksum mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChecksumRecord {
    /// Archive filename.
    pub filename: String,
    /// Checksum of its content.
    pub checksum: Checksum,
    /// Provenance timestamp, when known.
    pub timestamp: Option<String>,
}

impl ChecksumRecord {
    /// Create a record without provenance.
    pub fn new(filename: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            filename: filename.into(),
            checksum,
            timestamp: None,
        }
    }

    /// Parse one `filename,checksum[,timestamp]` line.
    pub fn parse_line(line: &str) -> std::result::Result<Self, String> {
        let mut parts = line.trim().split(',');
        let filename = parts.next().map(str::trim).unwrap_or_default();
        let checksum = parts.next().map(str::trim).unwrap_or_default();
        let timestamp = parts.next().map(|s| s.trim().to_string());
        if parts.next().is_some() {
            return Err("too many fields".to_string());
        }
        if filename.is_empty() {
            return Err("empty filename".to_string());
        }
        if checksum.is_empty() {
            return Err("empty checksum".to_string());
        }
        Ok(Self {
            filename: filename.to_string(),
            checksum: Checksum::new(checksum),
            timestamp: timestamp.filter(|t| !t.is_empty()),
        })
    }

    /// Render the record as one line without a trailing newline.
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChecksumRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.filename, self.checksum)?;
        if let Some(ts) = &self.timestamp {
            write!(f, ",{}", ts)?;
        }
        Ok(())
    }
}

/// Lazily parse checksum lines from a reader. Blank lines are skipped.
pub fn read_records<R: BufRead>(reader: R) -> impl Iterator<Item = Result<ChecksumRecord>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| match line {
            Err(e) => Some(Err(ReplError::Io(e))),
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(ChecksumRecord::parse_line(&line).map_err(|reason| {
                ReplError::Listing {
                    line: idx + 1,
                    reason,
                }
            })),
        })
}

/// Lazily read a filename listing, one name per line. Blank lines are skipped.
pub fn read_names<R: BufRead>(reader: R) -> impl Iterator<Item = Result<String>> {
    reader.lines().filter_map(|line| match line {
        Err(e) => Some(Err(ReplError::Io(e))),
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(Ok(line.trim().to_string())),
    })
}

/// Parse an in-memory listing.
pub fn parse_listing(text: &str) -> Result<Vec<ChecksumRecord>> {
    read_records(text.as_bytes()).collect()
}

/// Render records as a listing, one per line.
pub fn render_listing<'a>(records: impl IntoIterator<Item = &'a ChecksumRecord>) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.to_line());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_hex() {
        let d = digest(b"hello");
        assert_eq!(
            d.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest(b"hello"), d);
        assert_ne!(digest(b"hello!"), d);
    }

    #[test]
    fn test_parse_two_and_three_fields() {
        let r = ChecksumRecord::parse_line("a.warc,ABC").unwrap();
        assert_eq!(r.filename, "a.warc");
        assert_eq!(r.checksum.as_str(), "abc");
        assert!(r.timestamp.is_none());

        let r = ChecksumRecord::parse_line("b.warc, def ,2024-01-01T00:00:00Z").unwrap();
        assert_eq!(r.checksum.as_str(), "def");
        assert_eq!(r.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(r.to_line(), "b.warc,def,2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(ChecksumRecord::parse_line("nochecksum").is_err());
        assert!(ChecksumRecord::parse_line(",abc").is_err());
        assert!(ChecksumRecord::parse_line("a,b,c,d").is_err());
    }

    #[test]
    fn test_read_records_skips_blank_and_reports_line() {
        let text = "a,1\n\nb,2\nbroken\n";
        let results: Vec<_> = read_records(text.as_bytes()).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        match &results[2] {
            Err(ReplError::Listing { line, .. }) => assert_eq!(*line, 4),
            other => panic!("expected listing error, got {:?}", other),
        }
    }

    #[test]
    fn test_read_names_skips_blank_lines() {
        let names: Vec<String> = read_names("a.warc\n\n b.warc \n".as_bytes())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(names, vec!["a.warc", "b.warc"]);
    }

    #[test]
    fn test_render_then_parse_listing() {
        let records = vec![
            ChecksumRecord::new("a", Checksum::new("01")),
            ChecksumRecord::new("b", Checksum::new("02")),
        ];
        let text = render_listing(&records);
        assert_eq!(text, "a,01\nb,02\n");
        assert_eq!(parse_listing(&text).unwrap(), records);
    }
}
