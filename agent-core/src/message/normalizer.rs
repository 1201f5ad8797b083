//! Repairs the tool_use/tool_result pairing invariant before a provider call.
//!
//! For every assistant message carrying `tool_use` blocks, every id must be
//! matched by a `tool_result` in a user message before the next assistant
//! message. Interruption (process killed, cancellation) can leave this
//! violated; `normalize` restores it by dropping unpaired tool_use-only
//! messages or synthesizing `is_error` results for partially-answered ones.

use super::{Content, ContentBlock, Message};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("malformed content block: {0}")]
    MalformedBlock(String),
}

/// Produces the provider-facing message list, repairing tool_use/tool_result
/// pairing and dropping `progress` messages. Idempotent: `normalize(normalize(m)) == normalize(m)`.
pub fn normalize(messages: &[Message]) -> Result<Vec<Message>, NormalizationError> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        match msg {
            Message::Progress { .. } => {
                i += 1;
                continue;
            }
            Message::Assistant { .. } => {
                let tool_uses = msg.tool_use_blocks();
                if tool_uses.is_empty() {
                    out.push(msg.clone());
                    i += 1;
                    continue;
                }

                let wanted_ids: Vec<String> = tool_uses
                    .iter()
                    .map(|b| {
                        b.as_tool_use()
                            .map(|(id, _, _)| id.to_string())
                            .ok_or_else(|| {
                                NormalizationError::MalformedBlock(
                                    "tool_use_blocks() returned a non-tool_use block".into(),
                                )
                            })
                    })
                    .collect::<Result<_, _>>()?;

                // Scan forward to the next assistant message, collecting matched ids.
                let mut matched = std::collections::HashSet::new();
                let mut j = i + 1;
                while j < messages.len() && !matches!(messages[j], Message::Assistant { .. }) {
                    if let Message::User { .. } = &messages[j] {
                        for id in messages[j].tool_result_ids() {
                            matched.insert(id);
                        }
                    }
                    j += 1;
                }

                let missing: Vec<&String> = wanted_ids.iter().filter(|id| !matched.contains(*id)).collect();

                if missing.is_empty() {
                    // All matched: message (and the interleaved user messages) pass through.
                    out.push(msg.clone());
                    for m in &messages[i + 1..j] {
                        out.push(m.clone());
                    }
                } else if missing.len() == wanted_ids.len() {
                    // None matched: interruption before any result. Strip tool_use blocks,
                    // keep any text. Drop the message entirely if nothing remains.
                    let remaining: Vec<ContentBlock> = msg
                        .content()
                        .map(|c| c.blocks())
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|b| !matches!(b, ContentBlock::ToolUse { .. }))
                        .collect();
                    if !remaining.is_empty() {
                        if let Message::Assistant { id, usage, .. } = msg {
                            out.push(Message::Assistant {
                                id: id.clone(),
                                content: Content::Blocks(remaining),
                                usage: *usage,
                            });
                        }
                    }
                    for m in &messages[i + 1..j] {
                        out.push(m.clone());
                    }
                } else {
                    // Partial match: pass the assistant message through, then synthesize
                    // a fresh user message with is_error results for the missing ids.
                    out.push(msg.clone());
                    for m in &messages[i + 1..j] {
                        out.push(m.clone());
                    }
                    let synthesized: Vec<ContentBlock> = missing
                        .into_iter()
                        .map(|id| {
                            ContentBlock::tool_result(id.clone(), "Tool execution was interrupted", true)
                        })
                        .collect();
                    out.push(Message::user(Content::Blocks(synthesized)));
                }

                i = j;
                continue;
            }
            Message::User { .. } => {
                // A bare user message not following an assistant tool_use turn (e.g. the
                // very first message, or a synthetic one already emitted above) passes
                // through unchanged.
                out.push(msg.clone());
                i += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentBlock;

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "Bash".to_string(),
            input: serde_json::Map::new(),
        }
    }

    #[test]
    fn passthrough_when_no_tool_use() {
        let m = vec![Message::user("hi".to_string()), Message::assistant("hello".to_string(), None)];
        let out = normalize(&m).unwrap();
        assert_eq!(out, m);
    }

    #[test]
    fn fully_matched_passes_through() {
        let m = vec![
            Message::assistant(Content::Blocks(vec![tool_use("a")]), None),
            Message::user(Content::Blocks(vec![ContentBlock::tool_result("a", "ok", false)])),
        ];
        let out = normalize(&m).unwrap();
        assert_eq!(out, m);
    }

    #[test]
    fn none_matched_strips_tool_use_and_keeps_text() {
        let m = vec![Message::assistant(
            Content::Blocks(vec![ContentBlock::text("thinking"), tool_use("x")]),
            None,
        )];
        let out = normalize(&m).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content().unwrap().blocks(), vec![ContentBlock::text("thinking")]);
    }

    #[test]
    fn none_matched_drops_message_if_only_tool_use() {
        let m = vec![Message::assistant(Content::Blocks(vec![tool_use("x")]), None)];
        let out = normalize(&m).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn partial_match_synthesizes_error_for_missing() {
        let m = vec![
            Message::assistant(Content::Blocks(vec![tool_use("p"), tool_use("q")]), None),
            Message::user(Content::Blocks(vec![ContentBlock::tool_result("p", "ok", false)])),
        ];
        let out = normalize(&m).unwrap();
        assert_eq!(out.len(), 3);
        let (tool_use_id, content, is_error) = out[2].content().unwrap().blocks()[0]
            .as_tool_result()
            .unwrap();
        assert_eq!(tool_use_id, "q");
        assert_eq!(content, "Tool execution was interrupted");
        assert!(is_error);
    }

    #[test]
    fn progress_messages_are_dropped() {
        let m = vec![Message::progress("a", "working...")];
        assert_eq!(normalize(&m).unwrap(), Vec::new());
    }

    #[test]
    fn is_idempotent() {
        let m = vec![
            Message::assistant(Content::Blocks(vec![tool_use("p"), tool_use("q")]), None),
            Message::user(Content::Blocks(vec![ContentBlock::tool_result("p", "ok", false)])),
        ];
        let once = normalize(&m).unwrap();
        let twice = normalize(&once).unwrap();
        assert_eq!(once, twice);
    }
}
