use crate::pool::Recycle;
use crate::MessageId;

/// Backing storage above this size is released on reset instead of retained.
const RETAIN_TEXT_BYTES: usize = 4096;
const RETAIN_TRACE_IDS: usize = 256;

/// Accumulates generated text and the sorted set of message ids that contributed.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MessageBuilder {
    text: String,
    chars: usize,
    trace: Vec<MessageId>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment of text contributed by `id`.
    pub fn append(&mut self, id: &MessageId, fragment: &str) {
        self.add_trace(id);
        self.append_untraced(fragment);
    }

    /// Append text with no contributing message, such as a caller's prompt.
    pub fn append_untraced(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.chars += fragment.chars().count();
    }

    pub fn add_trace(&mut self, id: &MessageId) {
        if let Err(at) = self.trace.binary_search(id) {
            self.trace.insert(at, id.clone());
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn trace(&self) -> &[MessageId] {
        &self.trace
    }

    #[must_use]
    pub fn char_len(&self) -> usize {
        self.chars
    }

    pub fn reset(&mut self) {
        self.text.clear();
        self.chars = 0;
        self.trace.clear();
        if self.text.capacity() > RETAIN_TEXT_BYTES {
            self.text.shrink_to(RETAIN_TEXT_BYTES);
        }
        if self.trace.capacity() > RETAIN_TRACE_IDS {
            self.trace.shrink_to(RETAIN_TRACE_IDS);
        }
    }
}

impl Recycle for MessageBuilder {
    fn recycle(&mut self) {
        self.reset();
    }
}
