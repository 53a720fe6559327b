//! Sentinel-delimited turn splitting over a raw byte stream.
//!
//! Bytes are buffered as-is, so a multi-byte UTF-8 character or a sentinel
//! split across two reads is reassembled before it is inspected.

/// Output of feeding bytes to a [`TurnSplitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Split {
    /// Text that preceded a sentinel, trimmed and non-empty.
    Turn(String),
    /// The buffer exceeded its limit without a sentinel and was flushed.
    /// `text` is trimmed and may be empty.
    Overflow {
        text: String,
        error: StreamOverflowError,
    },
}

/// The buffer grew past its limit before a sentinel arrived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Output buffer exceeded {limit} bytes without a sentinel ({buffered} bytes buffered)")]
pub struct StreamOverflowError {
    pub limit: usize,
    pub buffered: usize,
}

/// Accumulates child output and cuts it into turns at each sentinel.
#[derive(Debug)]
pub struct TurnSplitter {
    sentinel: Vec<u8>,
    buffer: Vec<u8>,
    /// Offset below which the buffer is known not to start a sentinel.
    scan_from: usize,
    max_buffer: usize,
}

impl TurnSplitter {
    pub fn new(sentinel: &str, max_buffer: usize) -> Self {
        Self {
            sentinel: sentinel.as_bytes().to_vec(),
            buffer: Vec::new(),
            scan_from: 0,
            max_buffer: max_buffer.max(sentinel.len()),
        }
    }

    /// Feed one read's worth of bytes and collect every completed turn.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Split> {
        let mut out = Vec::new();
        if self.sentinel.is_empty() {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = find(&self.buffer[self.scan_from..], &self.sentinel) {
            let end = self.scan_from + pos;
            let text = trimmed_text(&self.buffer[..end]);
            self.buffer.drain(..end + self.sentinel.len());
            self.scan_from = 0;
            if !text.is_empty() {
                out.push(Split::Turn(text));
            }
        }
        self.scan_from = self
            .buffer
            .len()
            .saturating_sub(self.sentinel.len().saturating_sub(1));

        if self.buffer.len() > self.max_buffer {
            out.push(self.flush_overflow());
        }
        out
    }

    /// Bytes received since the last turn boundary.
    pub fn residue(&self) -> &[u8] {
        &self.buffer
    }

    /// Drain the residue as trimmed text.
    pub fn take_residue(&mut self) -> String {
        let text = trimmed_text(&self.buffer);
        self.buffer.clear();
        self.scan_from = 0;
        text
    }

    fn flush_overflow(&mut self) -> Split {
        let buffered = self.buffer.len();
        // Keep a trailing partial sentinel so the next read can complete it.
        let keep = partial_sentinel_len(&self.buffer, &self.sentinel);
        let cut = buffered - keep;
        let text = trimmed_text(&self.buffer[..cut]);
        self.buffer.drain(..cut);
        self.scan_from = 0;
        Split::Overflow {
            text,
            error: StreamOverflowError {
                limit: self.max_buffer,
                buffered,
            },
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest proper prefix of `sentinel` that ends `buffer`.
fn partial_sentinel_len(buffer: &[u8], sentinel: &[u8]) -> usize {
    (1..sentinel.len())
        .rev()
        .find(|&k| buffer.ends_with(&sentinel[..k]))
        .unwrap_or(0)
}

fn trimmed_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENTINEL: &str = "### User:";

    fn turns(splits: Vec<Split>) -> Vec<String> {
        splits
            .into_iter()
            .filter_map(|s| match s {
                Split::Turn(t) => Some(t),
                Split::Overflow { .. } => None,
            })
            .collect()
    }

    #[test]
    fn single_read_yields_trimmed_turn() {
        let mut splitter = TurnSplitter::new(SENTINEL, 1024);
        assert_eq!(turns(splitter.push(b"Hello\n### User:")), ["Hello"]);
        assert!(splitter.residue().is_empty());
    }

    #[test]
    fn turn_accumulates_across_reads() {
        let mut splitter = TurnSplitter::new(SENTINEL, 1024);
        assert!(splitter.push(b"Hel").is_empty());
        assert_eq!(splitter.residue(), b"Hel");
        assert_eq!(turns(splitter.push(b"lo\n### User:")), ["Hello"]);
    }

    #[test]
    fn sentinel_split_across_reads_is_found() {
        let mut splitter = TurnSplitter::new(SENTINEL, 1024);
        assert!(splitter.push(b"answer ###").is_empty());
        assert!(splitter.push(b" Us").is_empty());
        assert_eq!(turns(splitter.push(b"er: tail")), ["answer"]);
        assert_eq!(splitter.residue(), b" tail");
    }

    #[test]
    fn several_turns_in_one_read() {
        let mut splitter = TurnSplitter::new(SENTINEL, 1024);
        let out = turns(splitter.push(b"one### User:  two \n### User:three"));
        assert_eq!(out, ["one", "two"]);
        assert_eq!(splitter.residue(), b"three");
    }

    #[test]
    fn whitespace_only_turns_are_skipped() {
        let mut splitter = TurnSplitter::new(SENTINEL, 1024);
        assert!(splitter.push(b"  \n### User:### User:").is_empty());
    }

    #[test]
    fn utf8_split_across_reads_survives() {
        let mut splitter = TurnSplitter::new(SENTINEL, 1024);
        let text = "привет".as_bytes();
        assert!(splitter.push(&text[..3]).is_empty());
        let mut rest = text[3..].to_vec();
        rest.extend_from_slice(SENTINEL.as_bytes());
        assert_eq!(turns(splitter.push(&rest)), ["привет"]);
    }

    #[test]
    fn overflow_flushes_but_keeps_partial_sentinel() {
        let mut splitter = TurnSplitter::new(SENTINEL, 16);
        let out = splitter.push(b"0123456789abcdef### U");
        match out.as_slice() {
            [Split::Overflow { text, error }] => {
                assert_eq!(text, "0123456789abcdef");
                assert_eq!(error.limit, 16);
                assert_eq!(error.buffered, 21);
            }
            other => unreachable!("unexpected splits {other:?}"),
        }
        assert_eq!(splitter.residue(), b"### U");
        assert_eq!(turns(splitter.push(b"ser:")), Vec::<String>::new());
        assert!(splitter.residue().is_empty());
    }

    #[test]
    fn take_residue_clears_buffer() {
        let mut splitter = TurnSplitter::new(SENTINEL, 1024);
        splitter.push(b"  partial answer ");
        assert_eq!(splitter.take_residue(), "partial answer");
        assert!(splitter.residue().is_empty());
    }

    #[test]
    fn partial_sentinel_len_matches_longest_prefix() {
        assert_eq!(partial_sentinel_len(b"abc###", b"### User:"), 3);
        assert_eq!(partial_sentinel_len(b"abc", b"### User:"), 0);
        assert_eq!(partial_sentinel_len(b"x#", b"### User:"), 1);
    }
}
