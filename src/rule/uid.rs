//! The `UID` rule: matches the owning process's uid against a set of
//! inclusive integer ranges parsed from a slash-separated payload.

use super::types::Rule;
use crate::common::Metadata;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub start: i32,
    pub end: i32,
}

impl UidRange {
    pub fn contains(&self, uid: i32) -> bool {
        uid >= self.start && uid <= self.end
    }
}

#[derive(Debug, Clone)]
pub struct Uid {
    payload: String,
    adapter: String,
    ranges: Vec<UidRange>,
}

impl Uid {
    /// Parse a payload like `"100/1000-2000/[ 5000 ]"` into inclusive
    /// ranges. Each slash-separated entry is either `N` or `N-M`; brackets
    /// and surrounding whitespace are stripped; empty entries are ignored.
    /// An empty resulting range set is a parse error.
    pub fn parse(payload: String, adapter: String) -> Result<Self> {
        let ranges = parse_ranges(&payload)?;
        Ok(Uid { payload, adapter, ranges })
    }

    pub fn ranges(&self) -> &[UidRange] {
        &self.ranges
    }
}

fn parse_ranges(payload: &str) -> Result<Vec<UidRange>> {
    let mut ranges = Vec::new();

    for raw_entry in payload.split('/') {
        let entry = raw_entry.trim().trim_start_matches('[').trim_end_matches(']').trim();
        if entry.is_empty() {
            continue;
        }

        let bounds: Vec<&str> = entry.splitn(2, '-').collect();
        if bounds.len() > 2 {
            return Err(Error::Rule(format!("invalid uid entry: {}", raw_entry)));
        }

        let start: u32 = bounds[0]
            .trim()
            .parse()
            .map_err(|e| Error::Rule(format!("invalid uid {}: {}", bounds[0], e)))?;
        let end: u32 = if bounds.len() == 2 {
            bounds[1]
                .trim()
                .parse()
                .map_err(|e| Error::Rule(format!("invalid uid {}: {}", bounds[1], e)))?
        } else {
            start
        };

        ranges.push(UidRange { start: start as i32, end: end as i32 });
    }

    if ranges.is_empty() {
        return Err(Error::Rule(format!("empty uid rule payload: {}", payload)));
    }

    Ok(ranges)
}

impl Rule for Uid {
    fn is_match(&self, metadata: &Metadata) -> bool {
        match metadata.uid {
            Some(uid) => self.ranges.iter().any(|r| r.contains(uid)),
            None => false,
        }
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn rule_type(&self) -> &str {
        "UID"
    }

    fn should_resolve_ip(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_uid(uid: i32) -> Metadata {
        let mut m = Metadata::tcp().with_dst_port(443);
        m.uid = Some(uid);
        m
    }

    #[test]
    fn test_uid_parse_ranges() {
        let rule = Uid::parse("100/1000-2000/[ 5000 ]".to_string(), "PROXY".to_string()).unwrap();
        assert_eq!(
            rule.ranges(),
            &[
                UidRange { start: 100, end: 100 },
                UidRange { start: 1000, end: 2000 },
                UidRange { start: 5000, end: 5000 },
            ]
        );
    }

    #[test]
    fn test_uid_match_scenario() {
        let rule = Uid::parse("100/1000-2000/[ 5000 ]".to_string(), "PROXY".to_string()).unwrap();
        assert!(rule.is_match(&meta_with_uid(1500)));
        assert!(!rule.is_match(&meta_with_uid(3000)));
        assert!(rule.is_match(&meta_with_uid(100)));
        assert!(rule.is_match(&meta_with_uid(5000)));
    }

    #[test]
    fn test_uid_empty_payload_is_error() {
        assert!(Uid::parse("".to_string(), "PROXY".to_string()).is_err());
        assert!(Uid::parse("[ ]/ /".to_string(), "PROXY".to_string()).is_err());
    }

    #[test]
    fn test_uid_no_metadata_uid_never_matches() {
        let rule = Uid::parse("0-100000".to_string(), "PROXY".to_string()).unwrap();
        let meta = Metadata::tcp().with_dst_port(443);
        assert!(!rule.is_match(&meta));
    }
}
