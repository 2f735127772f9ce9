//! Streaming detector for runaway repetitive output.
//!
//! Whitespace is skipped entirely: it neither counts toward a run nor breaks
//! one. Only the last three non-whitespace characters and three run lengths
//! are kept, so feeding is O(1) per character regardless of response size.

/// Minimum span length (in non-whitespace characters) that counts as degraded.
pub const DEGRADATION_SPAN: usize = 50;

/// Longest repeating unit the detector looks for.
const MAX_PERIOD: usize = 3;

#[derive(Debug, Default, Clone)]
pub struct DegradationDetector {
    /// Last `MAX_PERIOD` non-whitespace characters, oldest first.
    recent: [Option<char>; MAX_PERIOD],
    /// Number of non-whitespace characters seen so far.
    seen: usize,
    /// `runs[p - 1]` = length of the longest suffix that is `p`-periodic.
    runs: [usize; MAX_PERIOD],
    degraded: bool,
}

impl DegradationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next text fragment. Returns true only on the fragment that
    /// first confirms degradation; use [`is_degraded`](Self::is_degraded) for
    /// the sticky state.
    pub fn feed(&mut self, chunk: &str) -> bool {
        if self.degraded {
            return false;
        }
        for c in chunk.chars().filter(|c| !c.is_whitespace()) {
            self.push(c);
            if self.runs.iter().any(|&run| run >= DEGRADATION_SPAN) {
                self.degraded = true;
                return true;
            }
        }
        false
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Whole-string check, equivalent to feeding `text` into a fresh detector.
    pub fn has_output_degradation(text: &str) -> bool {
        let mut detector = Self::new();
        detector.feed(text);
        detector.is_degraded()
    }

    fn push(&mut self, c: char) {
        self.seen += 1;
        for period in 1..=MAX_PERIOD {
            // recent[MAX_PERIOD - period] is the char `period` positions back.
            let matches = self.recent[MAX_PERIOD - period] == Some(c);
            let run = &mut self.runs[period - 1];
            *run = if matches {
                *run + 1
            } else {
                self.seen.min(period)
            };
        }
        self.recent.rotate_left(1);
        self.recent[MAX_PERIOD - 1] = Some(c);
    }
}
