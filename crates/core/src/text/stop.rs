/// A stop string found in generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopMatch {
    /// Byte offset in the scanned text where the stop string begins.
    pub start: usize,
    /// Index of the matching stop string in configured order.
    pub stop_index: usize,
}

impl StopMatch {
    /// The part of `chunk` that precedes the match, given that `chunk` was
    /// appended to the scanned text at byte offset `chunk_start`.
    ///
    /// Empty when the match began before the chunk.
    pub fn visible_part<'a>(&self, chunk: &'a str, chunk_start: usize) -> &'a str {
        let end = self.start.saturating_sub(chunk_start).min(chunk.len());
        &chunk[..end]
    }
}

/// Scans cumulative text for configured stop strings.
#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
}

impl StopMatcher {
    pub fn new(stops: Vec<String>) -> Self {
        Self { stops }
    }

    /// Find the earliest-starting stop string in `text`. Ties at the same
    /// offset go to the stop configured first. Empty stop strings never match.
    pub fn check(&self, text: &str) -> Option<StopMatch> {
        let mut best: Option<StopMatch> = None;
        for (stop_index, stop) in self.stops.iter().enumerate() {
            if stop.is_empty() || text.len() < stop.len() {
                continue;
            }
            let Some(start) = text.find(stop.as_str()) else {
                continue;
            };
            if best.map_or(true, |b| start < b.start) {
                best = Some(StopMatch { start, stop_index });
            }
        }
        best
    }

    pub fn stop(&self, index: usize) -> Option<&str> {
        self.stops.get(index).map(String::as_str)
    }

    pub fn stops(&self) -> &[String] {
        &self.stops
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    pub fn clear(&mut self) {
        self.stops.clear();
    }
}
