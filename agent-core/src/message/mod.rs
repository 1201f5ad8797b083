//! Canonical conversation representation.
//!
//! A [`Message`] is one of `user` | `assistant` | `progress`. Content is either a
//! plain string or an ordered list of [`ContentBlock`]s. Progress messages are
//! never sent to a provider; see [`normalizer`] for the tool_use/tool_result
//! pairing invariant enforced before every provider call.

mod normalizer;

pub use normalizer::{normalize, NormalizationError};

use serde::{Deserialize, Serialize};

/// One element of a message's content list.
///
/// Data only — no behavior lives on a content block. Unknown variants
/// encountered on the wire are rejected by the provider adapter, not here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Map<String, serde_json::Value>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text { text: s.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn as_tool_use(&self) -> Option<(&str, &str, &serde_json::Map<String, serde_json::Value>)> {
        match self {
            ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<(&str, &str, bool)> {
        match self {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                Some((tool_use_id, content, *is_error))
            }
            _ => None,
        }
    }
}

/// Either a plain string or an ordered list of content blocks.
///
/// Most hand-typed user turns are plain strings; everything the loop itself
/// produces (tool_use/tool_result turns) is a block list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            Content::Text(t) => vec![ContentBlock::text(t.clone())],
            Content::Blocks(b) => b.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(t) => t.is_empty(),
            Content::Blocks(b) => b.is_empty(),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<Vec<ContentBlock>> for Content {
    fn from(b: Vec<ContentBlock>) -> Self {
        Content::Blocks(b)
    }
}

/// Token usage reported by a provider for one completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Tagged variant: user | assistant | progress. Every message has a stable id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        id: String,
        content: Content,
    },
    Assistant {
        id: String,
        content: Content,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    /// Carries a referent tool-use id and text. Never sent to the provider.
    Progress {
        id: String,
        tool_use_id: String,
        text: String,
    },
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::User { id, .. } => id,
            Message::Assistant { id, .. } => id,
            Message::Progress { id, .. } => id,
        }
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Message::User {
            id: new_id(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<Content>, usage: Option<Usage>) -> Self {
        Message::Assistant {
            id: new_id(),
            content: content.into(),
            usage,
        }
    }

    pub fn progress(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Message::Progress {
            id: new_id(),
            tool_use_id: tool_use_id.into(),
            text: text.into(),
        }
    }

    pub fn content(&self) -> Option<&Content> {
        match self {
            Message::User { content, .. } | Message::Assistant { content, .. } => Some(content),
            Message::Progress { .. } => None,
        }
    }

    pub fn tool_use_blocks(&self) -> Vec<ContentBlock> {
        match self {
            Message::Assistant { content, .. } => content
                .blocks()
                .into_iter()
                .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn tool_result_ids(&self) -> Vec<String> {
        match self {
            Message::User { content, .. } => content
                .blocks()
                .into_iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
