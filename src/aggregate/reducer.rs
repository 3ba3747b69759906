//! Reduce phase: sum counts per key.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use tracing::warn;

use super::AggregationResult;
use super::mapper::truncate;

/// Parse a `key<TAB>count` line.
pub fn parse_pair(line: &str) -> Option<(&str, u64)> {
    let (key, value) = line.trim_end_matches(['\r', '\n']).split_once('\t')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let count = value.trim().parse().ok()?;
    Some((key, count))
}

/// Accumulates pairs for a single reduce partition.
#[derive(Debug, Default)]
pub struct Reducer {
    counts: BTreeMap<String, u64>,
    skipped: u64,
}

impl Reducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, count: u64) {
        match self.counts.get_mut(key) {
            Some(total) => *total = total.saturating_add(count),
            None => {
                self.counts.insert(key.to_string(), count);
            }
        }
    }

    /// Feed one line of mapper output; returns false if it was skipped.
    pub fn push_line(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }
        match parse_pair(line) {
            Some((key, count)) => {
                self.add(key, count);
                true
            }
            None => {
                warn!(line = %truncate(line, 80), "Skipping malformed pair");
                self.skipped += 1;
                false
            }
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Ordered result: count descending, key ascending.
    pub fn finish(self) -> AggregationResult {
        AggregationResult::from_counts(self.counts)
    }
}

/// Stream mapper output from `input` to ordered `key<TAB>total` lines.
pub fn reduce_lines<R: BufRead, W: Write>(input: R, mut output: W) -> io::Result<(AggregationResult, u64)> {
    let mut reducer = Reducer::new();
    for line in input.lines() {
        reducer.push_line(&line?);
    }
    let skipped = reducer.skipped();
    let result = reducer.finish();
    output.write_all(result.to_tsv().as_bytes())?;
    output.flush()?;
    Ok((result, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ties_break_by_key() {
        let mut reducer = Reducer::new();
        for (key, count) in [("c", 5), ("a", 2), ("b", 5)] {
            reducer.add(key, count);
        }
        let result = reducer.finish();
        assert_eq!(result.to_tsv(), "b\t5\nc\t5\na\t2\n");
    }

    #[test]
    fn test_order_independent_of_input_order() {
        let lines = ["view\t1", "click\t1", "view\t1", "search\t1", "click\t1"];
        let forward = {
            let mut r = Reducer::new();
            lines.iter().for_each(|l| {
                r.push_line(l);
            });
            r.finish()
        };
        let backward = {
            let mut r = Reducer::new();
            lines.iter().rev().for_each(|l| {
                r.push_line(l);
            });
            r.finish()
        };
        assert_eq!(forward, backward);
        assert_eq!(forward.to_tsv(), "click\t2\nview\t2\nsearch\t1\n");
    }

    #[test]
    fn test_malformed_pairs_are_skipped() {
        let input = "view\t1\nno tab here\n\t3\nclick\tmany\nview\t4\n\n";
        let mut out = Vec::new();
        let (result, skipped) = reduce_lines(input.as_bytes(), &mut out).unwrap();

        assert_eq!(skipped, 3);
        assert_eq!(result.total(), 5);
        assert_eq!(String::from_utf8(out).unwrap(), "view\t5\n");
    }

    #[test]
    fn test_parse_pair_trims() {
        assert_eq!(parse_pair(" view \t 2 \r\n"), Some(("view", 2)));
        assert_eq!(parse_pair("view\t-1"), None);
    }
}
