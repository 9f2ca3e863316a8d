//! Log size capping.
//!
//! A chatty task can print far more than is useful to keep in the ledger.
//! The stored log keeps the start of the output (how the run began) and the
//! end (how it failed) and drops the middle. Capping happens while output
//! streams in, so memory stays bounded however much a process prints.

use std::collections::VecDeque;

/// Output collector that retains at most `max_chars` characters: the first
/// half as they arrive, then a sliding window over the most recent rest.
///
/// Works on characters, never splitting a multi-byte sequence. A `max_chars`
/// of zero keeps everything.
#[derive(Debug)]
pub struct LogBuffer {
    head: String,
    head_chars: usize,
    head_cap: usize,
    tail: VecDeque<char>,
    tail_cap: usize,
    omitted: usize,
}

impl LogBuffer {
    pub fn new(max_chars: usize) -> Self {
        let (head_cap, tail_cap) = if max_chars == 0 {
            (usize::MAX, 0)
        } else {
            (max_chars / 2, max_chars - max_chars / 2)
        };
        Self {
            head: String::new(),
            head_chars: 0,
            head_cap,
            tail: VecDeque::new(),
            tail_cap,
            omitted: 0,
        }
    }

    pub fn push_str(&mut self, text: &str) {
        for c in text.chars() {
            if self.head_chars < self.head_cap {
                self.head.push(c);
                self.head_chars += 1;
                continue;
            }
            self.tail.push_back(c);
            if self.tail.len() > self.tail_cap {
                self.tail.pop_front();
                self.omitted += 1;
            }
        }
    }

    /// Characters dropped from the middle so far.
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    /// The retained text, with a marker where the middle was dropped.
    pub fn finish(self) -> String {
        let tail: String = self.tail.into_iter().collect();
        if self.omitted == 0 {
            return self.head + &tail;
        }
        format!(
            "{}\n[... {} chars omitted ...]\n{tail}",
            self.head, self.omitted
        )
    }
}
