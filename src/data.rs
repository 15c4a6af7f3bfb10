use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;

use crate::model::{Author, Comment, CommentId, Page, SendStatus};
use crate::rest;

pub trait CommentService: Send + Sync {
    fn fetch_top_level(&self, subject_id: &str, cursor: Option<&str>) -> Result<Page>;
    fn fetch_replies(
        &self,
        subject_id: &str,
        parent_id: &CommentId,
        cursor: Option<&str>,
    ) -> Result<Page>;
}

pub trait InteractionService: Send + Sync {
    fn post_comment(&self, subject_id: &str, content: &str) -> Result<Comment>;
    fn post_reply(&self, subject_id: &str, target_id: &CommentId, content: &str)
        -> Result<Comment>;
    fn like(&self, comment_id: &CommentId) -> Result<()>;
    fn unlike(&self, comment_id: &CommentId) -> Result<()>;
    fn delete(&self, comment_id: &CommentId) -> Result<()>;
}

pub struct RestCommentService {
    client: Arc<rest::Client>,
}

impl RestCommentService {
    pub fn new(client: Arc<rest::Client>) -> Self {
        Self { client }
    }
}

impl CommentService for RestCommentService {
    fn fetch_top_level(&self, subject_id: &str, cursor: Option<&str>) -> Result<Page> {
        self.client
            .comments(subject_id, cursor)
            .context("fetch comments")
    }

    fn fetch_replies(
        &self,
        subject_id: &str,
        parent_id: &CommentId,
        cursor: Option<&str>,
    ) -> Result<Page> {
        self.client
            .replies(subject_id, parent_id, cursor)
            .context("fetch replies")
    }
}

pub struct RestInteractionService {
    client: Arc<rest::Client>,
}

impl RestInteractionService {
    pub fn new(client: Arc<rest::Client>) -> Self {
        Self { client }
    }
}

impl InteractionService for RestInteractionService {
    fn post_comment(&self, subject_id: &str, content: &str) -> Result<Comment> {
        self.client
            .post_comment(subject_id, content)
            .context("post comment")
    }

    fn post_reply(
        &self,
        subject_id: &str,
        target_id: &CommentId,
        content: &str,
    ) -> Result<Comment> {
        self.client
            .post_reply(subject_id, target_id, content)
            .context("post reply")
    }

    fn like(&self, comment_id: &CommentId) -> Result<()> {
        self.client.set_liked(comment_id, true)
    }

    fn unlike(&self, comment_id: &CommentId) -> Result<()> {
        self.client.set_liked(comment_id, false)
    }

    fn delete(&self, comment_id: &CommentId) -> Result<()> {
        self.client.delete(comment_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchTopLevel,
    FetchReplies,
    PostComment,
    PostReply,
    Like,
    Unlike,
    Delete,
}

struct StoredComment {
    subject_id: String,
    root: Option<CommentId>,
    comment: Comment,
}

#[derive(Default)]
struct MemoryState {
    comments: Vec<StoredComment>,
    next_id: u64,
    failing: HashMap<Operation, String>,
    calls: HashMap<Operation, usize>,
}

impl MemoryState {
    fn enter(&mut self, operation: Operation) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;
        if let Some(message) = self.failing.get(&operation) {
            bail!("{message}");
        }
        Ok(())
    }

    fn find(&self, id: &CommentId) -> Result<usize> {
        self.comments
            .iter()
            .position(|stored| stored.comment.id == *id)
            .ok_or_else(|| anyhow!("comment {id} not found"))
    }

    fn next_id(&mut self) -> CommentId {
        self.next_id += 1;
        CommentId::remote(format!("cm_{}", self.next_id))
    }
}

/// In-process backend serving both collaborator traits. Pages are offset
/// cursors; replies are returned flattened under their top-level ancestor.
pub struct MemoryBackend {
    viewer: Author,
    page_size: usize,
    reply_page_size: usize,
    inner: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(viewer: Author, page_size: usize, reply_page_size: usize) -> Self {
        Self {
            viewer,
            page_size: page_size.max(1),
            reply_page_size: reply_page_size.max(1),
            inner: Mutex::new(MemoryState::default()),
        }
    }

    /// A backend pre-filled with a short conversation under `subject_id`.
    pub fn demo(viewer: Author, subject_id: &str) -> Self {
        let backend = Self::new(viewer, 10, 10);
        let ada = demo_author("u-ada", "Ada");
        let linus = demo_author("u-linus", "Linus");
        let grace = demo_author("u-grace", "Grace");

        let first = backend.add_comment(subject_id, None, &ada, "First! Great write-up.");
        let reply = backend.add_comment(
            subject_id,
            Some(&first),
            &linus,
            "Agreed, the benchmarks are solid.",
        );
        backend.add_comment(
            subject_id,
            Some(&reply),
            &grace,
            "Did you try it with a cold cache?",
        );
        let second = backend.add_comment(
            subject_id,
            None,
            &grace,
            "The section on cursors could use an example.",
        );
        backend.add_comment(subject_id, Some(&second), &ada, "Seconded.");
        backend.add_comment(subject_id, None, &linus, "Shipping it.");
        backend
    }

    /// Stores a comment as if another client had posted it.
    pub fn add_comment(
        &self,
        subject_id: &str,
        target: Option<&CommentId>,
        author: &Author,
        content: &str,
    ) -> CommentId {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        let (root, reply_to_name) = match target {
            Some(target) => match inner.find(target) {
                Ok(index) => {
                    let stored = &inner.comments[index];
                    let root = stored.root.clone().unwrap_or_else(|| target.clone());
                    (Some(root), Some(stored.comment.author.display_name.clone()))
                }
                Err(_) => (Some(target.clone()), None),
            },
            None => (None, None),
        };
        if let Some(root) = &root {
            if let Ok(index) = inner.find(root) {
                inner.comments[index].comment.reply_count += 1;
            }
        }
        let comment = Comment {
            id: id.clone(),
            content: content.to_string(),
            author: author.clone(),
            like_count: 0,
            reply_count: 0,
            created_at: Utc::now().to_rfc3339(),
            parent_id: target.cloned(),
            liked_by_me: false,
            is_owner: author.id == self.viewer.id,
            reply_to_name,
            status: SendStatus::Sent,
        };
        inner.comments.push(StoredComment {
            subject_id: subject_id.to_string(),
            root,
            comment,
        });
        id
    }

    /// Makes every following call of `operation` fail with `message`.
    pub fn fail(&self, operation: Operation, message: &str) {
        self.inner.lock().failing.insert(operation, message.to_string());
    }

    pub fn recover(&self, operation: Operation) {
        self.inner.lock().failing.remove(&operation);
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.inner.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn comment(&self, id: &CommentId) -> Option<Comment> {
        let inner = self.inner.lock();
        let index = inner.find(id).ok()?;
        Some(inner.comments[index].comment.clone())
    }

    fn page(items: Vec<Comment>, cursor: Option<&str>, size: usize, total: i64) -> Result<Page> {
        let start = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid cursor {raw:?}"))?,
            None => 0,
        };
        let end = (start + size).min(items.len());
        let page_items = items.get(start..end).map(<[Comment]>::to_vec).unwrap_or_default();
        Ok(Page {
            items: page_items,
            next_cursor: (end < items.len()).then(|| end.to_string()),
            total: Some(total),
        })
    }

    fn post(&self, subject_id: &str, target: Option<&CommentId>, content: &str) -> Result<Comment> {
        let id = self.add_comment(subject_id, target, &self.viewer, content);
        self.comment(&id).context("stored comment vanished")
    }
}

fn demo_author(id: &str, name: &str) -> Author {
    Author {
        id: id.to_string(),
        display_name: name.to_string(),
        avatar: None,
    }
}

impl CommentService for MemoryBackend {
    fn fetch_top_level(&self, subject_id: &str, cursor: Option<&str>) -> Result<Page> {
        let (parents, total) = {
            let mut inner = self.inner.lock();
            inner.enter(Operation::FetchTopLevel)?;
            let in_subject: Vec<&StoredComment> = inner
                .comments
                .iter()
                .filter(|stored| stored.subject_id == subject_id)
                .collect();
            let parents: Vec<Comment> = in_subject
                .iter()
                .filter(|stored| stored.root.is_none())
                .map(|stored| stored.comment.clone())
                .collect();
            (parents, in_subject.len() as i64)
        };
        Self::page(parents, cursor, self.page_size, total)
    }

    fn fetch_replies(
        &self,
        subject_id: &str,
        parent_id: &CommentId,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let (replies, total) = {
            let mut inner = self.inner.lock();
            inner.enter(Operation::FetchReplies)?;
            inner.find(parent_id)?;
            let replies: Vec<Comment> = inner
                .comments
                .iter()
                .filter(|stored| {
                    stored.subject_id == subject_id && stored.root.as_ref() == Some(parent_id)
                })
                .map(|stored| stored.comment.clone())
                .collect();
            let total = replies.len() as i64;
            (replies, total)
        };
        Self::page(replies, cursor, self.reply_page_size, total)
    }
}

impl InteractionService for MemoryBackend {
    fn post_comment(&self, subject_id: &str, content: &str) -> Result<Comment> {
        self.inner.lock().enter(Operation::PostComment)?;
        self.post(subject_id, None, content)
    }

    fn post_reply(
        &self,
        subject_id: &str,
        target_id: &CommentId,
        content: &str,
    ) -> Result<Comment> {
        {
            let mut inner = self.inner.lock();
            inner.enter(Operation::PostReply)?;
            inner.find(target_id)?;
        }
        self.post(subject_id, Some(target_id), content)
    }

    fn like(&self, comment_id: &CommentId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::Like)?;
        let index = inner.find(comment_id)?;
        let comment = &mut inner.comments[index].comment;
        if !comment.liked_by_me {
            comment.liked_by_me = true;
            comment.like_count += 1;
        }
        Ok(())
    }

    fn unlike(&self, comment_id: &CommentId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::Unlike)?;
        let index = inner.find(comment_id)?;
        let comment = &mut inner.comments[index].comment;
        if comment.liked_by_me {
            comment.liked_by_me = false;
            comment.like_count -= 1;
        }
        Ok(())
    }

    fn delete(&self, comment_id: &CommentId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::Delete)?;
        let index = inner.find(comment_id)?;
        let removed = inner.comments.remove(index);
        match removed.root {
            None => inner
                .comments
                .retain(|stored| stored.root.as_ref() != Some(comment_id)),
            Some(root) => {
                if let Ok(root_index) = inner.find(&root) {
                    let parent = &mut inner.comments[root_index].comment;
                    parent.reply_count = (parent.reply_count - 1).max(0);
                }
            }
        }
        Ok(())
    }
}
