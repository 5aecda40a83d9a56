//! Tail-repetition guard.
//!
//! Near-deterministic sampling of small quantized models can fall into exact
//! loops. The check only looks at units that end the text, so it is cheap
//! enough to run once per generated token over a turn's buffer.

use serde::{Deserialize, Serialize};

/// How repetitions of the trailing unit are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleCounting {
    /// Count non-overlapping occurrences anywhere in the text, then require
    /// that many back-to-back copies at the end. Occurrences earlier in the
    /// text can raise the count past the contiguous run and mask a loop.
    #[default]
    WholeText,
    /// Count only the contiguous copies that end the text.
    TailRuns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleDetector {
    pub min_unit_length: usize,
    pub min_repeats: usize,
    pub counting: CycleCounting,
}

impl Default for CycleDetector {
    fn default() -> Self {
        Self {
            min_unit_length: 6,
            min_repeats: 2,
            counting: CycleCounting::WholeText,
        }
    }
}

impl CycleDetector {
    pub fn detect(&self, text: &str) -> bool {
        match self.counting {
            CycleCounting::WholeText => detect(text, self.min_unit_length, self.min_repeats),
            CycleCounting::TailRuns => {
                detect_tail_runs(text, self.min_unit_length, self.min_repeats)
            }
        }
    }
}

/// True when `text` ends with some unit of at least `min_unit_length` chars
/// repeated more than `min_repeats` times.
pub fn detect(text: &str, min_unit_length: usize, min_repeats: usize) -> bool {
    scan_units(text, min_unit_length, min_repeats, |unit| {
        let count = text.matches(unit).count();
        count > min_repeats && text.ends_with(&unit.repeat(count))
    })
}

pub fn detect_tail_runs(text: &str, min_unit_length: usize, min_repeats: usize) -> bool {
    scan_units(text, min_unit_length, min_repeats, |unit| {
        let mut rest = text;
        let mut run = 0;
        while let Some(stripped) = rest.strip_suffix(unit) {
            run += 1;
            if run > min_repeats {
                return true;
            }
            rest = stripped;
        }
        false
    })
}

fn scan_units<F>(text: &str, min_unit_length: usize, min_repeats: usize, mut is_cycle: F) -> bool
where
    F: FnMut(&str) -> bool,
{
    let min_unit_length = min_unit_length.max(1);
    let char_count = text.chars().count();
    let max_unit_length = char_count / (min_repeats + 1);
    if max_unit_length < min_unit_length {
        return false;
    }

    // Byte offsets of char starts, so units can be sliced by char length.
    let starts: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    (min_unit_length..=max_unit_length).any(|unit_length| {
        let unit = &text[starts[char_count - unit_length]..];
        is_cycle(unit)
    })
}
