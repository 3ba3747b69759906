//! Map phase: one grouping key per input record.

use serde_json::Value;
use std::io::{self, BufRead, Write};
use tracing::warn;

/// Position of the action column in pipe-separated records.
const ACTION_INDEX: usize = 3;

/// Extract the action key from a JSON object or a pipe-separated line.
///
/// Returns `None` for records with no usable key; those are skipped, not fatal.
pub fn extract_key(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let key = json_action(line).or_else(|| {
        line.split('|')
            .nth(ACTION_INDEX)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    })?;

    // Tabs and line breaks would corrupt the line-oriented key<TAB>count format.
    (!key.contains(char::is_control)).then_some(key)
}

fn json_action(line: &str) -> Option<String> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
        return None;
    };
    let key = match map.get("action")? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) if n.as_f64() != Some(0.0) => n.to_string(),
        _ => return None,
    };
    (!key.is_empty()).then_some(key)
}

/// Counters from one map pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub emitted: u64,
    pub skipped: u64,
}

/// Stream `input` to `output` as `key<TAB>1` lines.
pub fn map_lines<R: BufRead, W: Write>(input: R, mut output: W) -> io::Result<MapStats> {
    let mut stats = MapStats::default();
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match extract_key(&line) {
            Some(key) => {
                writeln!(output, "{key}\t1")?;
                stats.emitted += 1;
            }
            None => {
                warn!(line = %truncate(&line, 80), "Skipping malformed record");
                stats.skipped += 1;
            }
        }
    }
    output.flush()?;
    Ok(stats)
}

pub(crate) fn truncate(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
