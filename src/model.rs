use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marks ids synthesized on this device before the server has seen the comment.
pub const LOCAL_ID_PREFIX: &str = "local-";

static LOCAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifier of a comment, either issued by the server or synthesized locally
/// for an optimistic placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommentId {
    Local(String),
    Remote(String),
}

impl CommentId {
    pub fn remote(id: impl Into<String>) -> Self {
        CommentId::Remote(id.into())
    }

    /// Time based and unique for the lifetime of the process.
    pub fn next_local() -> Self {
        let seq = LOCAL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        CommentId::Local(format!(
            "{LOCAL_ID_PREFIX}{}-{seq}",
            Utc::now().timestamp_millis()
        ))
    }

    pub fn parse(raw: &str) -> Self {
        if raw.starts_with(LOCAL_ID_PREFIX) {
            CommentId::Local(raw.to_string())
        } else {
            CommentId::Remote(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommentId::Local(id) | CommentId::Remote(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, CommentId::Local(_))
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CommentId {
    fn from(raw: &str) -> Self {
        CommentId::parse(raw)
    }
}

impl From<String> for CommentId {
    fn from(raw: String) -> Self {
        CommentId::parse(&raw)
    }
}

impl Serialize for CommentId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(CommentId::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    Sending,
    #[default]
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    pub author: Author,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
    #[serde(default)]
    pub liked_by_me: bool,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub reply_to_name: Option<String>,
    #[serde(default)]
    pub status: SendStatus,
}

impl Comment {
    /// Builds the optimistic row shown while a send is in flight.
    pub fn placeholder(author: &Author, content: &str, parent_id: Option<CommentId>) -> Self {
        Comment {
            id: CommentId::next_local(),
            content: content.to_string(),
            author: author.clone(),
            like_count: 0,
            reply_count: 0,
            created_at: Utc::now().timestamp_millis().to_string(),
            parent_id,
            liked_by_me: false,
            is_owner: true,
            reply_to_name: None,
            status: SendStatus::Sending,
        }
    }

    /// Like count as it should be rendered; the stored value may dip below
    /// zero while toggles against stale server data settle.
    pub fn displayed_like_count(&self) -> i64 {
        self.like_count.max(0)
    }
}

/// One row of the flattened two-level tree. A reply's display target lives
/// in its comment's `reply_to_name`.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadItem {
    Parent(Comment),
    Reply(Comment),
}

impl ThreadItem {
    pub fn comment(&self) -> &Comment {
        match self {
            ThreadItem::Parent(comment) | ThreadItem::Reply(comment) => comment,
        }
    }

    pub fn comment_mut(&mut self) -> &mut Comment {
        match self {
            ThreadItem::Parent(comment) | ThreadItem::Reply(comment) => comment,
        }
    }

    pub fn id(&self) -> &CommentId {
        &self.comment().id
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, ThreadItem::Parent(_))
    }

    pub fn nesting_level(&self) -> usize {
        match self {
            ThreadItem::Parent(_) => 0,
            ThreadItem::Reply(_) => 1,
        }
    }

    pub fn reply_to_name(&self) -> Option<&str> {
        match self {
            ThreadItem::Parent(_) => None,
            ThreadItem::Reply(comment) => comment.reply_to_name.as_deref(),
        }
    }
}

/// A page returned by the read collaborators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Comment>,
    pub next_cursor: Option<String>,
    /// Total comments under the subject, when the server reports it.
    pub total: Option<i64>,
}
