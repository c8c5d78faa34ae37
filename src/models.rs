use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Title every conversation starts with until the first user message names it.
pub const DEFAULT_TITLE: &str = "New chat";

// Longest auto-derived title, in characters, before the ellipsis
const AUTO_TITLE_MAX_CHARS: usize = 40;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(s)
    }
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    // Only field ever mutated in place, while a reply streams in
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Input to `ConversationStore::add_message`. `id` and `created_at` are
/// assigned by the store when left empty.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub id: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            id: None,
            created_at: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

// A titled, timestamped thread of messages
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation, optionally seeded with a leading system message.
    pub fn new(seed_system_prompt: Option<&str>) -> Self {
        let now = Utc::now();
        let messages = match seed_system_prompt {
            Some(prompt) => vec![Message {
                id: Uuid::new_v4(),
                role: Role::System,
                content: prompt.to_string(),
                created_at: now,
            }],
            None => Vec::new(),
        };
        Self {
            id: Uuid::new_v4(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            messages,
        }
    }

    pub fn has_message(&self, id: Uuid) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Title derived from the first user message, or the default title when
    /// there is none yet.
    pub fn auto_title(&self) -> String {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| derive_title(&m.content))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string())
    }

    /// The `{role, content}` pairs sent to the backend. Assistant messages with
    /// no visible content (an unfilled placeholder) are left out.
    pub fn history(&self) -> Vec<ChatTurn> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::Assistant || !m.content.trim().is_empty())
            .map(ChatTurn::from)
            .collect()
    }
}

/// Collapses whitespace runs and truncates to 40 characters with an ellipsis.
pub fn derive_title(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if collapsed.chars().count() > AUTO_TITLE_MAX_CHARS {
        let head: String = collapsed.chars().take(AUTO_TITLE_MAX_CHARS).collect();
        format!("{}…", head)
    } else {
        collapsed
    }
}

// One entry of the history sent over the wire
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_collapses_whitespace() {
        assert_eq!(derive_title("  hello   world  "), "hello world");
        assert_eq!(derive_title("line one\n\tline two"), "line one line two");
    }

    #[test]
    fn title_truncates_long_content() {
        let content = "a".repeat(50);
        let title = derive_title(&content);
        assert_eq!(title, format!("{}…", "a".repeat(40)));
    }

    #[test]
    fn title_counts_characters_not_bytes() {
        let content = "é".repeat(40);
        assert_eq!(derive_title(&content), content);
    }

    #[test]
    fn blank_content_keeps_default_title() {
        assert_eq!(derive_title("   \n "), DEFAULT_TITLE);
    }

    #[test]
    fn seeded_conversation_starts_with_system_message() {
        let convo = Conversation::new(Some("be brief"));
        assert_eq!(convo.messages.len(), 1);
        assert_eq!(convo.messages[0].role, Role::System);
        assert_eq!(convo.title, DEFAULT_TITLE);
        assert_eq!(convo.auto_title(), DEFAULT_TITLE);
    }

    #[test]
    fn history_skips_empty_assistant_placeholders() {
        let mut convo = Conversation::new(None);
        convo.messages.push(Message::new(Role::User, "hi"));
        convo.messages.push(Message::new(Role::Assistant, "  "));
        convo.messages.push(Message::new(Role::User, "again"));

        let history = convo.history();
        assert_eq!(
            history,
            vec![
                ChatTurn::new(Role::User, "hi"),
                ChatTurn::new(Role::User, "again")
            ]
        );
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatTurn::new(Role::Assistant, "x")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"x"}"#);
    }
}
