//! Line-number selection for partial replays
//!
//! A list such as `1-100,250,400-` selects lines 1 through 100, line 250 and
//! everything from 400 on. `-50` selects lines up to 50. The empty list
//! selects every line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::error::RangeParseError;

/// Inclusive range of line numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn contains(&self, line: usize) -> bool {
        self.start <= line && line <= self.end
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.end) {
            (start, end) if start == end => write!(f, "{}", start),
            (0, end) => write!(f, "-{}", end),
            (start, usize::MAX) => write!(f, "{}-", start),
            (start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

/// Set of selected line ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<LineRange>,
}

impl RangeSet {
    /// A set that selects every line
    pub fn all() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn parse(list: &str) -> Result<Self, RangeParseError> {
        let list = list.trim();
        if list.is_empty() {
            return Ok(Self::all());
        }

        let mut ranges = Vec::new();
        for item in list.split(',') {
            let item = item.trim();
            if item.is_empty() {
                return Err(RangeParseError::EmptyItem {
                    list: list.to_string(),
                });
            }
            ranges.push(parse_item(item)?);
        }

        Ok(Self { ranges })
    }

    /// Whether `line` is selected for execution
    pub fn includes(&self, line: usize) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|r| r.contains(line))
    }

    /// Whether every line is selected
    pub fn is_unrestricted(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[LineRange] {
        &self.ranges
    }
}

impl FromStr for RangeSet {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return f.write_str("all");
        }
        let parts: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

fn parse_item(item: &str) -> Result<LineRange, RangeParseError> {
    let number = |text: &str| -> Result<usize, RangeParseError> {
        text.trim().parse().map_err(|_| RangeParseError::InvalidNumber {
            item: item.to_string(),
        })
    };

    let Some((start, end)) = item.split_once('-') else {
        let line = number(item)?;
        return Ok(LineRange { start: line, end: line });
    };

    let (start, end) = (start.trim(), end.trim());
    let range = match (start.is_empty(), end.is_empty()) {
        (true, true) => {
            return Err(RangeParseError::InvalidNumber {
                item: item.to_string(),
            })
        }
        (true, false) => LineRange { start: 0, end: number(end)? },
        (false, true) => LineRange { start: number(start)?, end: usize::MAX },
        (false, false) => LineRange { start: number(start)?, end: number(end)? },
    };

    if range.end < range.start {
        return Err(RangeParseError::InvertedRange {
            start: range.start,
            end: range.end,
        });
    }
    Ok(range)
}
