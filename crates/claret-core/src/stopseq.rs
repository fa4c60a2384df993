/// Streaming stop-sequence matcher.
///
/// Deltas are evaluated as one continuous byte stream across block
/// boundaries. Text that could still turn into a match is held back, so no
/// emitted chunk ever contains anything past a stop boundary.
#[derive(Debug)]
pub struct StopSequenceMatcher {
    sequences: Vec<String>,
    held: String,
}

/// Result of feeding one delta.
#[derive(Debug, PartialEq)]
pub enum ScanOutcome {
    /// Safe text to emit now (possibly empty while a partial match is held).
    Clear(String),
    /// A sequence matched. `emit` is the remaining safe prefix before the
    /// match; everything from the match onward is discarded.
    Matched { emit: String, sequence: String },
}

impl StopSequenceMatcher {
    pub fn new(sequences: &[String]) -> Self {
        Self {
            sequences: sequences
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            held: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn push(&mut self, delta: &str) -> ScanOutcome {
        if self.sequences.is_empty() {
            return ScanOutcome::Clear(delta.to_string());
        }
        self.held.push_str(delta);

        // Earliest match across all sequences wins.
        let mut earliest: Option<(usize, &str)> = None;
        for sequence in &self.sequences {
            if let Some(at) = self.held.find(sequence.as_str()) {
                let replace = match earliest {
                    Some((best, _)) => at < best,
                    None => true,
                };
                if replace {
                    earliest = Some((at, sequence));
                }
            }
        }
        if let Some((at, sequence)) = earliest {
            let sequence = sequence.to_string();
            let emit = self.held[..at].to_string();
            self.held.clear();
            return ScanOutcome::Matched { emit, sequence };
        }

        // Hold back the longest tail that is a proper prefix of any sequence.
        let hold = self.longest_suffix_prefix();
        let cut = self.held.len() - hold;
        let emit = self.held[..cut].to_string();
        self.held.drain(..cut);
        ScanOutcome::Clear(emit)
    }

    /// Emit whatever is still held once the stream ends without a match.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    fn longest_suffix_prefix(&self) -> usize {
        let mut best = 0;
        for sequence in &self.sequences {
            for (end, _) in sequence.char_indices().skip(1) {
                let prefix = &sequence[..end];
                if prefix.len() > best
                    && prefix.len() <= self.held.len()
                    && self.held.ends_with(prefix)
                {
                    best = prefix.len();
                }
            }
            // The whole sequence can never be a held suffix here: a full
            // occurrence would have matched above.
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(seqs: &[&str]) -> StopSequenceMatcher {
        StopSequenceMatcher::new(&seqs.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn no_sequences_passes_through() {
        let mut m = matcher(&[]);
        assert_eq!(m.push("anything"), ScanOutcome::Clear("anything".into()));
    }

    #[test]
    fn match_spanning_delta_boundary() {
        // "world" arrives split across two deltas; nothing past the match
        // boundary may leak out.
        let mut m = matcher(&["world"]);
        assert_eq!(m.push("Hello, wo"), ScanOutcome::Clear("Hello, ".into()));
        assert_eq!(
            m.push("rld! Good"),
            ScanOutcome::Matched {
                emit: String::new(),
                sequence: "world".into()
            }
        );
    }

    #[test]
    fn match_inside_single_delta() {
        let mut m = matcher(&["STOP"]);
        assert_eq!(
            m.push("before STOP after"),
            ScanOutcome::Matched {
                emit: "before ".into(),
                sequence: "STOP".into()
            }
        );
    }

    #[test]
    fn entire_response_equal_to_sequence_truncates_to_empty() {
        let mut m = matcher(&["whole"]);
        assert_eq!(
            m.push("whole"),
            ScanOutcome::Matched {
                emit: String::new(),
                sequence: "whole".into()
            }
        );
    }

    #[test]
    fn earliest_sequence_wins() {
        let mut m = matcher(&["late", "soon"]);
        assert_eq!(
            m.push("x soon y late"),
            ScanOutcome::Matched {
                emit: "x ".into(),
                sequence: "soon".into()
            }
        );
    }

    #[test]
    fn flush_releases_false_partial() {
        let mut m = matcher(&["world"]);
        assert_eq!(m.push("wo"), ScanOutcome::Clear(String::new()));
        assert_eq!(m.flush(), "wo");
    }

    #[test]
    fn emitted_concatenation_never_contains_sequence() {
        let mut m = matcher(&["ab"]);
        let mut emitted = String::new();
        for chunk in ["a", "a", "a", "b", "c"] {
            match m.push(chunk) {
                ScanOutcome::Clear(text) => emitted.push_str(&text),
                ScanOutcome::Matched { emit, .. } => {
                    emitted.push_str(&emit);
                    break;
                }
            }
        }
        assert_eq!(emitted, "aa");
        assert!(!emitted.contains("ab"));
    }

    #[test]
    fn multibyte_sequences_respect_char_boundaries() {
        let mut m = matcher(&["héllo"]);
        assert_eq!(m.push("say h"), ScanOutcome::Clear("say ".into()));
        assert_eq!(m.push("é"), ScanOutcome::Clear(String::new()));
        assert_eq!(
            m.push("llo!"),
            ScanOutcome::Matched {
                emit: String::new(),
                sequence: "héllo".into()
            }
        );
    }
}
