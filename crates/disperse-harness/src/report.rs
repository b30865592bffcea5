//! Structured JSONL reporting for harness runs.
//!
//! One record per scenario step, written as a single JSON line so runs
//! can be diffed and aggregated. Content checks carry SHA-256 digests of
//! the data read back.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

/// One JSONL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub scenario: String,
    pub step: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Record {
    pub fn pass(scenario: &str, step: &str) -> Self {
        Record {
            scenario: scenario.to_string(),
            step: step.to_string(),
            outcome: Outcome::Pass,
            detail: None,
            sha256: None,
        }
    }

    pub fn fail(scenario: &str, step: &str, detail: &str) -> Self {
        Record {
            scenario: scenario.to_string(),
            step: step.to_string(),
            outcome: Outcome::Fail,
            detail: Some(detail.to_string()),
            sha256: None,
        }
    }

    pub fn with_digest(mut self, digest: &str) -> Self {
        self.sha256 = Some(digest.to_string());
        self
    }
}

/// Writes records as JSONL to stdout or a file.
pub struct Emitter {
    sink: Box<dyn Write>,
    pub passed: u32,
    pub failed: u32,
}

impl Emitter {
    pub fn stdout() -> Self {
        Emitter {
            sink: Box::new(std::io::stdout()),
            passed: 0,
            failed: 0,
        }
    }

    pub fn file(path: &Path) -> std::io::Result<Self> {
        Ok(Emitter {
            sink: Box::new(std::fs::File::create(path)?),
            passed: 0,
            failed: 0,
        })
    }

    pub fn emit(&mut self, record: &Record) {
        match record.outcome {
            Outcome::Pass => self.passed += 1,
            _ => self.failed += 1,
        }
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(self.sink, "{line}");
        }
    }
}

/// Hex SHA-256 of a byte buffer.
pub fn digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in out {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Validate a single JSONL line against the record schema.
pub fn validate_line(line: &str) -> Result<Record, serde_json::Error> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrips_through_jsonl() {
        let rec = Record::pass("s1", "write").with_digest("abc");
        let line = serde_json::to_string(&rec).unwrap();
        let back = validate_line(&line).unwrap();
        assert_eq!(back.scenario, "s1");
        assert_eq!(back.outcome, Outcome::Pass);
        assert_eq!(back.sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn digest_is_stable_and_hex() {
        let d = digest(b"hello");
        assert_eq!(d.len(), 64);
        assert_eq!(d, digest(b"hello"));
        assert_ne!(d, digest(b"world"));
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn emitter_counts_outcomes() {
        let mut emitter = Emitter {
            sink: Box::new(Vec::new()),
            passed: 0,
            failed: 0,
        };
        emitter.emit(&Record::pass("s", "a"));
        emitter.emit(&Record::fail("s", "b", "boom"));
        assert_eq!((emitter.passed, emitter.failed), (1, 1));
    }
}
