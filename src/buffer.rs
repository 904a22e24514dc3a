use std::collections::VecDeque;

use parking_lot::RwLock;

/// Default number of lines retained per session.
pub const DEFAULT_MAX_LINES: usize = 1000;

struct BufferState {
    lines: VecDeque<String>,
    /// Number of lines trimmed from the front since creation. The absolute
    /// index of `lines[0]` is `dropped`.
    dropped: u64,
    /// True while the last line has not seen its terminating newline yet.
    open: bool,
    /// Bumped on every mutation, including growth of an open line.
    revision: u64,
}

/// A bounded, append-only sequence of output lines.
///
/// Lines are addressed by absolute index: the first line ever appended is
/// index 0, and indices keep counting up as old lines are trimmed from the
/// front. This lets a reader hold a cursor across trims.
///
/// The buffer has a single writer (the session's pty reader) and many readers.
/// All reads return owned copies taken under the read lock, so a reader never
/// observes a half-applied append or trim.
pub struct OutputBuffer {
    state: RwLock<BufferState>,
    capacity: usize,
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("OutputBuffer")
            .field("capacity", &self.capacity)
            .field("len", &state.lines.len())
            .field("dropped", &state.dropped)
            .finish_non_exhaustive()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl OutputBuffer {
    /// Create an empty buffer retaining at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(BufferState {
                lines: VecDeque::new(),
                dropped: 0,
                open: false,
                revision: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append complete lines.
    ///
    /// An open trailing fragment is closed first, so each item becomes its
    /// own line.
    pub fn append<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write();
        state.open = false;
        for line in lines {
            state.lines.push_back(line.into());
        }
        state.revision += 1;
        self.trim(&mut state);
    }

    /// Append a raw chunk of terminal text.
    ///
    /// The chunk is split on `\n`; carriage returns are discarded. The first
    /// piece continues the previous line if that line was left open, and a
    /// chunk that does not end in a newline leaves its last piece open.
    ///
    /// Returns the pieces of the chunk as they were applied, for observers.
    pub fn push_chunk(&self, chunk: &str) -> Vec<String> {
        let normalized: String = chunk.chars().filter(|&c| c != '\r').collect();
        if normalized.is_empty() {
            return Vec::new();
        }

        let mut applied = Vec::new();
        let mut state = self.state.write();
        let mut pieces = normalized.split('\n').peekable();
        while let Some(piece) = pieces.next() {
            let terminated = pieces.peek().is_some();
            if !terminated && piece.is_empty() {
                break;
            }
            let continues = state.open && !state.lines.is_empty();
            if continues {
                if let Some(last) = state.lines.back_mut() {
                    last.push_str(piece);
                }
            } else {
                state.lines.push_back(piece.to_string());
            }
            state.open = !terminated;
            applied.push(piece.to_string());
        }
        state.revision += 1;
        self.trim(&mut state);
        applied
    }

    /// Close any open trailing line and return the absolute index the next
    /// line will get. Content is unchanged, so the revision is not bumped.
    pub fn seal(&self) -> u64 {
        let mut state = self.state.write();
        state.open = false;
        state.dropped + state.lines.len() as u64
    }

    fn trim(&self, state: &mut BufferState) {
        while state.lines.len() > self.capacity {
            state.lines.pop_front();
            state.dropped += 1;
        }
    }

    /// Copy of every retained line, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.state.read().lines.iter().cloned().collect()
    }

    /// Copy of the retained lines whose absolute index is `>= from`.
    ///
    /// If `from` points into the trimmed region, the slice starts at the
    /// oldest retained line.
    pub fn slice_since(&self, from: u64) -> Vec<String> {
        let state = self.state.read();
        let skip = from.saturating_sub(state.dropped) as usize;
        state.lines.iter().skip(skip).cloned().collect()
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.state.read().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute index one past the newest line.
    ///
    /// An open last line is counted, so output that continues it after a
    /// cursor is taken will not be part of `slice_since(cursor)`.
    pub fn total(&self) -> u64 {
        let state = self.state.read();
        state.dropped + state.lines.len() as u64
    }

    /// Mutation counter; changes whenever any line is added or extended.
    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }
}
