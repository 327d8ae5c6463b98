use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::builder::MessageBuilder;
use crate::config::EngineConfig;
use crate::skip::Skip;
use crate::store::{ChainStore, ScanControl};
use crate::tokenize::reduce;
use crate::{CancelToken, ChainError, MessageId};

/// Generated text and the sorted, unique ids of the messages it was drawn from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Speech {
    pub text: String,
    pub trace: Vec<MessageId>,
    /// Set when a store failure cut generation short under best-effort output.
    pub truncated: bool,
}

/// Result of sampling one continuation for a context.
struct Sampled {
    choice: Option<(String, MessageId)>,
    distinct: usize,
}

/// Uniformly pick one candidate continuation of `prefix`.
///
/// An empty prefix reads message-start tuples. Up to `min_candidates` distinct
/// suffixes are counted so the caller can decide whether to back off.
fn sample<S, R>(
    store: &S,
    cancel: &CancelToken,
    tag: &str,
    prefix: Option<&[String]>,
    min_candidates: usize,
    rng: &mut R,
) -> Result<Sampled, ChainError>
where
    S: ChainStore + ?Sized,
    R: RngCore + ?Sized,
{
    let mut skip = Skip::new();
    let mut remaining = 0_u64;
    let mut seen_any = false;
    let mut distinct: Vec<String> = Vec::with_capacity(min_candidates);
    let mut choice: Option<(String, MessageId)> = None;

    let mut visit = |candidate: crate::store::Candidate<'_>| {
        if distinct.len() < min_candidates && !distinct.iter().any(|s| s == candidate.suffix) {
            distinct.push(candidate.suffix.to_string());
        }
        if seen_any && remaining > 0 {
            remaining -= 1;
            return ScanControl::Continue;
        }
        seen_any = true;
        choice = Some((candidate.suffix.to_string(), candidate.id.clone()));
        remaining = skip.next_skip(rng.next_u64(), rng.next_u64());
        ScanControl::Continue
    };

    match prefix {
        Some(prefix) => store.scan_candidates(cancel, tag, prefix, &mut visit)?,
        None => store.scan_start(cancel, tag, &mut visit)?,
    }
    Ok(Sampled { choice, distinct: distinct.len() })
}

/// Walk the chain for `tag` and produce one message.
///
/// Generation starts from message-start tuples, or from `prompt` when it is
/// non-empty; prompt tokens are emitted first and contribute no trace ids. Each
/// step samples uniformly among continuations of the current context. When fewer
/// than `min_candidates` distinct continuations exist and the context is longer
/// than one term, the oldest term is dropped and the query retried. Generation ends
/// on the end-of-message marker, when no continuation exists, or when the
/// character or iteration budget is spent.
///
/// # Errors
/// Store failures and cancellation are returned as errors. With
/// `config.best_effort`, a store failure after some text was generated returns
/// the partial speech marked `truncated` instead.
pub fn speak<S, R>(
    store: &S,
    cancel: &CancelToken,
    config: &EngineConfig,
    tag: &str,
    prompt: &[String],
    rng: &mut R,
    builder: &mut MessageBuilder,
) -> Result<Speech, ChainError>
where
    S: ChainStore + ?Sized,
    R: RngCore + ?Sized,
{
    builder.reset();
    let order = store.order();
    // Most recent term first, padded with the empty sentinel.
    let mut context = vec![String::new(); order];
    for token in prompt {
        builder.append_untraced(token);
        builder.append_untraced(" ");
        push_context(&mut context, reduce(token));
    }

    match walk(store, cancel, config, tag, &mut context, rng, builder) {
        Ok(()) => Ok(finish(builder, false)),
        Err(ChainError::StoreUnavailable(reason))
            if config.best_effort && !builder.trace().is_empty() =>
        {
            tracing::warn!(tag, %reason, "returning partial speech after store failure");
            Ok(finish(builder, true))
        }
        Err(err) => Err(err),
    }
}

fn walk<S, R>(
    store: &S,
    cancel: &CancelToken,
    config: &EngineConfig,
    tag: &str,
    context: &mut Vec<String>,
    rng: &mut R,
    builder: &mut MessageBuilder,
) -> Result<(), ChainError>
where
    S: ChainStore + ?Sized,
    R: RngCore + ?Sized,
{
    let order = context.len();
    let mut iterations = 0_usize;
    while iterations < config.max_iterations && builder.char_len() < config.max_chars {
        cancel.check()?;
        let at_start = context.iter().all(String::is_empty);
        let mut depth = order;
        let sampled = loop {
            iterations += 1;
            let prefix = if at_start { None } else { Some(&context[..depth]) };
            let sampled = sample(store, cancel, tag, prefix, config.min_candidates, rng)?;
            if at_start
                || sampled.distinct >= config.min_candidates
                || depth <= 1
                || iterations >= config.max_iterations
            {
                break sampled;
            }
            depth -= 1;
            tracing::trace!(tag, depth, distinct = sampled.distinct, "backing off context");
        };

        let Some((suffix, id)) = sampled.choice else {
            tracing::debug!(tag, "no continuation found");
            return Ok(());
        };
        if suffix.is_empty() {
            return Ok(());
        }
        builder.append(&id, &suffix);
        builder.append_untraced(" ");
        push_context(context, reduce(&suffix));
    }
    tracing::debug!(tag, iterations, chars = builder.char_len(), "generation budget reached");
    Ok(())
}

/// Shift `term` in as the most recent context entry, dropping the oldest.
fn push_context(context: &mut [String], term: String) {
    if context.is_empty() {
        return;
    }
    context.rotate_right(1);
    context[0] = term;
}

fn finish(builder: &MessageBuilder, truncated: bool) -> Speech {
    Speech {
        text: builder.text().trim().to_string(),
        trace: builder.trace().to_vec(),
        truncated,
    }
}
