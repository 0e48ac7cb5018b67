//! Token estimation and transcript truncation.
//!
//! Estimates are deterministic character counts. Truncation prices messages
//! with the same constants as `estimate_tokens`.

use crate::core::message::ChatMessage;
use crate::core::model::context_limit;

pub const CHARS_PER_TOKEN: usize = 4;
pub const PER_MESSAGE_OVERHEAD: usize = 4;
pub const TRANSCRIPT_OVERHEAD: usize = 3;

fn message_tokens(message: &ChatMessage) -> usize {
    message.content.chars().count().div_ceil(CHARS_PER_TOKEN) + PER_MESSAGE_OVERHEAD
}

pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    TRANSCRIPT_OVERHEAD + messages.iter().map(message_tokens).sum::<usize>()
}

pub fn fits_in_context(messages: &[ChatMessage], model_id: &str) -> bool {
    fits_in_context_with_limit(messages, context_limit(model_id))
}

pub fn fits_in_context_with_limit(messages: &[ChatMessage], limit: usize) -> bool {
    estimate_tokens(messages) <= limit
}

pub fn truncate_context(messages: &[ChatMessage], model_id: &str) -> Vec<ChatMessage> {
    truncate_context_with_limit(messages, context_limit(model_id))
}

/// Drops the oldest non-system messages until the transcript fits `limit`.
///
/// A leading system message is always kept. The newest message is kept even
/// when it alone exceeds the budget, so the result is best effort.
pub fn truncate_context_with_limit(messages: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    if fits_in_context_with_limit(messages, limit) {
        return messages.to_vec();
    }

    let pinned = usize::from(messages.first().is_some_and(ChatMessage::is_system));
    let (head, tail) = messages.split_at(pinned);
    if tail.is_empty() {
        return messages.to_vec();
    }

    let head_cost = TRANSCRIPT_OVERHEAD + head.iter().map(message_tokens).sum::<usize>();
    let mut tail_cost: usize = tail.iter().map(message_tokens).sum();

    let mut start = 0;
    while start < tail.len() - 1 && head_cost + tail_cost > limit {
        tail_cost -= message_tokens(&tail[start]);
        start += 1;
    }

    if start > 0 {
        tracing::debug!(
            dropped = start,
            kept = tail.len() - start,
            limit,
            "truncated transcript to fit context window"
        );
    }

    head.iter().chain(&tail[start..]).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;

    fn long(n: usize) -> String {
        "x".repeat(n)
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(&[]), TRANSCRIPT_OVERHEAD);
        let msgs = vec![ChatMessage::user("Hello")];
        assert_eq!(estimate_tokens(&msgs), TRANSCRIPT_OVERHEAD + 2 + PER_MESSAGE_OVERHEAD);
    }

    #[test]
    fn test_short_exchange_fits_large_model() {
        let msgs = vec![ChatMessage::user("Hello"), ChatMessage::assistant("Hi there!")];
        assert!(fits_in_context(&msgs, "llama-3.2-3b-instruct"));
    }

    #[test]
    fn test_huge_message_does_not_fit_small_limit() {
        let msgs = vec![ChatMessage::user(long(20_000))];
        assert!(!fits_in_context_with_limit(&msgs, 1500));
    }

    #[test]
    fn test_unknown_model_uses_default_limit() {
        let msgs = vec![ChatMessage::user(long(7_000))];
        assert!(fits_in_context(&msgs, "no-such-model"));
        let msgs = vec![ChatMessage::user(long(9_000))];
        assert!(!fits_in_context(&msgs, "no-such-model"));
    }

    #[test]
    fn test_truncate_keeps_system_and_recent() {
        let msgs = vec![
            ChatMessage::system("You are helpful."),
            ChatMessage::user(long(5000)),
            ChatMessage::assistant(long(5000)),
            ChatMessage::user("Third"),
            ChatMessage::assistant("Fourth"),
        ];
        let out = truncate_context_with_limit(&msgs, 1500);

        assert_eq!(out[0].role, Role::System);
        assert!(out.iter().any(|m| m.content == "Third"));
        assert!(out.iter().any(|m| m.content == "Fourth"));
        assert!(out.len() < msgs.len());
        assert_eq!(out.last().unwrap().content, "Fourth");
        assert!(fits_in_context_with_limit(&out, 1500));
    }

    #[test]
    fn test_truncate_small_catalog_model() {
        let msgs = vec![
            ChatMessage::system("sys"),
            ChatMessage::user(long(5000)),
            ChatMessage::assistant(long(5000)),
            ChatMessage::user("Third"),
            ChatMessage::assistant("Fourth"),
        ];
        let out = truncate_context(&msgs, "smollm2-1.7b-instruct");
        assert!(out.len() < msgs.len());
        assert!(out[0].is_system());
        assert_eq!(&out[out.len() - 2..], &msgs[3..]);
    }

    #[test]
    fn test_truncate_returns_input_when_it_fits() {
        let msgs = vec![ChatMessage::user("a"), ChatMessage::assistant("b")];
        assert_eq!(truncate_context_with_limit(&msgs, 1000), msgs);
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let msgs = vec![
            ChatMessage::system("sys"),
            ChatMessage::user(long(3000)),
            ChatMessage::assistant(long(3000)),
            ChatMessage::user(long(3000)),
            ChatMessage::assistant("tail"),
        ];
        for limit in [50, 800, 1600, 2500, 10_000] {
            let once = truncate_context_with_limit(&msgs, limit);
            let twice = truncate_context_with_limit(&once, limit);
            assert_eq!(once, twice, "limit {limit}");
            assert!(once[0].is_system());
        }
    }

    #[test]
    fn test_truncate_edge_cases() {
        assert!(truncate_context_with_limit(&[], 1).is_empty());

        let only_system = vec![ChatMessage::system(long(10_000))];
        assert_eq!(truncate_context_with_limit(&only_system, 10), only_system);

        let oversized = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("old"),
            ChatMessage::user(long(20_000)),
        ];
        let out = truncate_context_with_limit(&oversized, 100);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_system());
        assert_eq!(out[1].content.len(), 20_000);
    }

    #[test]
    fn test_truncate_without_system_evicts_from_front() {
        let msgs = vec![
            ChatMessage::user(long(4000)),
            ChatMessage::assistant("second"),
            ChatMessage::user("third"),
        ];
        let out = truncate_context_with_limit(&msgs, 100);
        assert_eq!(out, msgs[1..].to_vec());
    }
}
