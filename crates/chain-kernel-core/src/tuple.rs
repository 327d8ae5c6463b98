use crate::pool::Recycle;
use crate::tokenize::reduce;
use crate::ChainError;

/// One prefix→suffix training example borrowed from a [`Tuples`] batch.
///
/// `prefix[0]` is the most recent token before `suffix`; the prefix always holds
/// exactly `order` reduced terms, padded with empty strings.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Tuple<'a> {
    pub prefix: &'a [String],
    pub suffix: &'a str,
}

impl Tuple<'_> {
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.prefix.iter().all(String::is_empty)
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        self.suffix.is_empty()
    }
}

/// All tuples of one message.
///
/// Prefixes are windows into a single array holding the reduced tokens in reverse
/// order followed by `order` empty terms, so no tuple owns its own prefix storage.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Tuples {
    order: usize,
    terms: Vec<String>,
    suffixes: Vec<String>,
}

impl Tuples {
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    /// Tuples in message order: the start tuple first, the end tuple last.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Tuple<'_>> + '_ {
        let k = self.suffixes.len().saturating_sub(1);
        self.suffixes.iter().enumerate().map(move |(i, suffix)| Tuple {
            prefix: &self.terms[k - i..k - i + self.order],
            suffix: suffix.as_str(),
        })
    }

    /// Rebuild this batch in place from `tokens`.
    pub fn fill(&mut self, order: usize, tokens: &[String]) {
        self.recycle();
        self.order = order;
        if tokens.is_empty() {
            return;
        }
        self.terms.extend(tokens.iter().rev().map(|token| reduce(token)));
        self.terms.resize(tokens.len() + order, String::new());
        self.suffixes.extend(tokens.iter().cloned());
        self.suffixes.push(String::new());
    }
}

impl Recycle for Tuples {
    fn recycle(&mut self) {
        self.terms.clear();
        self.suffixes.clear();
    }
}

/// Convert a token sequence into the tuples of one chain training.
///
/// A message of k tokens yields k+1 tuples: a start tuple with an all-empty prefix
/// whose suffix is the first token, one tuple per following token, and an end
/// tuple whose suffix is empty. An empty token sequence yields no tuples.
#[must_use]
pub fn build_tuples(order: usize, tokens: &[String]) -> Tuples {
    let mut tuples = Tuples::default();
    tuples.fill(order, tokens);
    tuples
}

/// Check the structural invariants a store relies on before persisting a batch.
///
/// # Errors
/// Returns [`ChainError::EncodingInvariantViolation`] when a prefix has the wrong
/// length, a non-final suffix is empty, or the batch does not contain exactly one
/// start tuple and one end tuple.
pub fn validate_tuples(order: usize, tuples: &Tuples) -> Result<(), ChainError> {
    if tuples.is_empty() {
        return Ok(());
    }
    if tuples.order() != order {
        return Err(ChainError::EncodingInvariantViolation(format!(
            "tuples built for order {} but store uses order {order}",
            tuples.order()
        )));
    }

    let last = tuples.len() - 1;
    let mut starts = 0_usize;
    for (i, tuple) in tuples.iter().enumerate() {
        if tuple.prefix.len() != order {
            return Err(ChainError::EncodingInvariantViolation(format!(
                "prefix length {} differs from order {order}",
                tuple.prefix.len()
            )));
        }
        if tuple.is_end() != (i == last) {
            return Err(ChainError::EncodingInvariantViolation(
                "exactly the final tuple MUST have an empty suffix".to_string(),
            ));
        }
        if tuple.is_start() {
            starts += 1;
        }
    }

    if starts != 1 {
        return Err(ChainError::EncodingInvariantViolation(format!(
            "expected exactly one start tuple, found {starts}"
        )));
    }
    Ok(())
}
