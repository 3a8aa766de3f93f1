//! Port ranges for distributed-communication backends.
//!
//! A range is written as `"MIN:MAX"` in configuration and task specs. The
//! empty string means "unset" and is not an error.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PortRangeError;

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+):([0-9]+)$").expect("static port range pattern")
});

/// An inclusive `[min, max]` interval of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    /// Build a range, rejecting `min > max`.
    pub fn new(min: u16, max: u16) -> Result<Self, PortRangeError> {
        if min > max {
            return Err(PortRangeError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    /// Number of ports in the range.
    pub fn width(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }

    /// True when the two ranges share at least one port.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// True when `self` lies entirely inside `outer`.
    pub fn within(&self, outer: &PortRange) -> bool {
        outer.min <= self.min && self.max <= outer.max
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.min, self.max)
    }
}

/// Parse `"MIN:MAX"`. Returns `Ok(None)` for the empty string.
pub fn parse_range(text: &str) -> Result<Option<PortRange>, PortRangeError> {
    match validate_range(text).into_iter().next() {
        Some(err) => Err(err),
        None if text.is_empty() => Ok(None),
        None => {
            // validate_range accepted it, so both halves are valid u16s.
            let (min, max) = text
                .split_once(':')
                .ok_or_else(|| PortRangeError::Malformed(text.to_string()))?;
            let min = min.parse().map_err(|_| PortRangeError::InvalidMin(min.to_string()))?;
            let max = max.parse().map_err(|_| PortRangeError::InvalidMax(max.to_string()))?;
            Ok(Some(PortRange { min, max }))
        }
    }
}

/// Check `"MIN:MAX"` and collect every problem found, not just the first.
pub fn validate_range(text: &str) -> Vec<PortRangeError> {
    let mut errs = Vec::new();
    if text.is_empty() {
        return errs;
    }

    let Some(caps) = RANGE_RE.captures(text) else {
        errs.push(PortRangeError::Malformed(text.to_string()));
        return errs;
    };

    let min = caps[1].parse::<u16>();
    let max = caps[2].parse::<u16>();
    if min.is_err() {
        errs.push(PortRangeError::InvalidMin(caps[1].to_string()));
    }
    if max.is_err() {
        errs.push(PortRangeError::InvalidMax(caps[2].to_string()));
    }
    if let (Ok(min), Ok(max)) = (min, max) {
        if min > max {
            errs.push(PortRangeError::Inverted { min, max });
        }
    }

    errs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_range() {
        let range = parse_range("8000:9000").unwrap().unwrap();
        assert_eq!(range.min, 8000);
        assert_eq!(range.max, 9000);
        assert_eq!(range.width(), 1001);
        assert_eq!(range.to_string(), "8000:9000");
    }

    #[test]
    fn empty_is_unset() {
        assert_eq!(parse_range(""), Ok(None));
    }

    #[test]
    fn inverted_range_rejected() {
        assert_eq!(
            parse_range("9000:8000"),
            Err(PortRangeError::Inverted { min: 9000, max: 8000 })
        );
    }

    #[test]
    fn malformed_inputs_rejected() {
        for bad in ["abc:9000", "8000", "8000-9000", " 8000:9000", "8000:9000:1", "-1:5", ":"] {
            let err = parse_range(bad).unwrap_err();
            assert!(err.is_malformed(), "{bad} -> {err:?}");
        }
    }

    #[test]
    fn out_of_u16_values_are_malformed() {
        assert_eq!(
            parse_range("70000:80000"),
            Err(PortRangeError::InvalidMin("70000".to_string()))
        );
        assert_eq!(
            validate_range("70000:80000"),
            vec![
                PortRangeError::InvalidMin("70000".to_string()),
                PortRangeError::InvalidMax("80000".to_string()),
            ]
        );
    }

    #[test]
    fn single_port_range() {
        let range = parse_range("1234:1234").unwrap().unwrap();
        assert_eq!(range.width(), 1);
    }

    #[test]
    fn overlap_is_inclusive() {
        let a = PortRange::new(100, 200).unwrap();
        assert!(a.overlaps(&PortRange::new(200, 300).unwrap()));
        assert!(a.overlaps(&PortRange::new(150, 160).unwrap()));
        assert!(!a.overlaps(&PortRange::new(201, 300).unwrap()));
        assert!(!a.overlaps(&PortRange::new(1, 99).unwrap()));
    }

    #[test]
    fn new_rejects_inverted() {
        assert!(PortRange::new(5, 4).is_err());
    }
}
