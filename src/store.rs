//! Thread state and the pure transforms that evolve it.
//!
//! The sequence is a flattened two-level tree: every `Parent` is followed by
//! its contiguous block of `Reply` items, so the owner of a reply is always
//! the nearest `Parent` before it. Every transform takes `&self` and returns
//! the next state, leaving the previous snapshot untouched for readers and
//! for rollback.

use std::collections::{HashMap, HashSet};

use anyhow::{ensure, Result};

use crate::cursor::{Cursor, CursorKey};
use crate::model::{Comment, CommentId, SendStatus, ThreadItem};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadState {
    subject_id: Option<String>,
    items: Vec<ThreadItem>,
    top_level: Cursor,
    replies: HashMap<CommentId, Cursor>,
    loading: HashSet<CursorKey>,
    likes_in_flight: HashSet<CommentId>,
    total_count: i64,
    error: Option<String>,
    revision: u64,
}

fn fetched(mut comment: Comment) -> Comment {
    comment.status = SendStatus::Sent;
    comment
}

impl ThreadState {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            ..Self::default()
        }
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    pub fn items(&self) -> &[ThreadItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Parents plus replies on the server, independent of what is paginated in.
    pub fn total_count(&self) -> i64 {
        self.total_count
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Bumped by the engine on every committed transition.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn top_level_cursor(&self) -> &Cursor {
        &self.top_level
    }

    pub fn reply_cursor(&self, parent_id: &CommentId) -> Option<&Cursor> {
        self.replies.get(parent_id)
    }

    pub fn cursor(&self, key: &CursorKey) -> Cursor {
        match key {
            CursorKey::TopLevel => self.top_level.clone(),
            CursorKey::Replies(parent_id) => {
                self.replies.get(parent_id).cloned().unwrap_or_default()
            }
        }
    }

    pub fn is_loading(&self, key: &CursorKey) -> bool {
        self.loading.contains(key)
    }

    /// False while a fetch for `key` is in flight or once its cursor is exhausted.
    pub fn can_fetch(&self, key: &CursorKey) -> bool {
        !self.is_loading(key) && self.cursor(key).has_more
    }

    pub fn like_in_flight(&self, id: &CommentId) -> bool {
        self.likes_in_flight.contains(id)
    }

    pub fn position(&self, id: &CommentId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    pub fn get(&self, id: &CommentId) -> Option<&ThreadItem> {
        self.position(id).map(|index| &self.items[index])
    }

    pub fn contains(&self, id: &CommentId) -> bool {
        self.position(id).is_some()
    }

    /// Materialized replies of a parent, in display order.
    pub fn replies_of(&self, parent_id: &CommentId) -> &[ThreadItem] {
        match self.position(parent_id) {
            Some(index) if self.items[index].is_parent() => {
                &self.items[index + 1..self.block_end(index)]
            }
            _ => &[],
        }
    }

    /// Id of the parent whose group holds `id` (the id itself for a parent).
    pub fn group_of(&self, id: &CommentId) -> Option<&CommentId> {
        let index = self.position(id)?;
        let owner = self.owner_index(index)?;
        Some(self.items[owner].id())
    }

    fn block_end(&self, parent_index: usize) -> usize {
        self.items[parent_index + 1..]
            .iter()
            .position(ThreadItem::is_parent)
            .map_or(self.items.len(), |offset| parent_index + 1 + offset)
    }

    fn owner_index(&self, index: usize) -> Option<usize> {
        self.items[..=index].iter().rposition(ThreadItem::is_parent)
    }

    fn settle_reply_count(&mut self, parent_index: usize) {
        let materialized = (self.block_end(parent_index) - parent_index - 1) as i64;
        let parent = self.items[parent_index].comment_mut();
        if parent.reply_count < materialized {
            parent.reply_count = materialized;
        }
    }

    /// Replaces the whole sequence with childless parents.
    #[must_use]
    pub fn replace_top_level(&self, items: Vec<Comment>) -> Self {
        let mut next = self.clone();
        let mut seen = HashSet::new();
        next.items = items
            .into_iter()
            .filter(|comment| seen.insert(comment.id.clone()))
            .map(|comment| ThreadItem::Parent(fetched(comment)))
            .collect();
        next
    }

    /// Appends parents after the tail, skipping ids already present.
    #[must_use]
    pub fn append_top_level(&self, items: Vec<Comment>) -> Self {
        let mut next = self.clone();
        let mut seen: HashSet<CommentId> =
            next.items.iter().map(|item| item.id().clone()).collect();
        for comment in items {
            if seen.insert(comment.id.clone()) {
                next.items.push(ThreadItem::Parent(fetched(comment)));
            }
        }
        next
    }

    /// Splices replies at the end of the parent's block, skipping known ids.
    #[must_use]
    pub fn insert_replies(&self, parent_id: &CommentId, items: Vec<Comment>) -> Self {
        let Some(parent_index) = self
            .position(parent_id)
            .filter(|&index| self.items[index].is_parent())
        else {
            return self.clone();
        };
        let mut seen: HashSet<CommentId> =
            self.items.iter().map(|item| item.id().clone()).collect();
        let fresh: Vec<ThreadItem> = items
            .into_iter()
            .filter(|comment| seen.insert(comment.id.clone()))
            .map(|comment| ThreadItem::Reply(fetched(comment)))
            .collect();

        let mut next = self.clone();
        let at = next.block_end(parent_index);
        next.items.splice(at..at, fresh);
        next.settle_reply_count(parent_index);
        next
    }

    /// New parents go to the front; new replies to the end of the anchor's block.
    #[must_use]
    pub fn insert_optimistic(&self, item: ThreadItem, anchor_parent_id: Option<&CommentId>) -> Self {
        let mut next = self.clone();
        if next.contains(item.id()) {
            return next;
        }
        if item.is_parent() {
            next.items.insert(0, item);
            return next;
        }
        let anchor = anchor_parent_id
            .and_then(|anchor| next.position(anchor))
            .filter(|&index| next.items[index].is_parent());
        if let Some(anchor) = anchor {
            let at = next.block_end(anchor);
            next.items.insert(at, item);
        }
        next
    }

    /// Swaps a placeholder for the server's copy in the same slot. A missing
    /// placeholder (already reconciled or deleted) leaves the state as is.
    #[must_use]
    pub fn reconcile(&self, placeholder_id: &CommentId, server: Comment) -> Self {
        if !self.contains(placeholder_id) {
            return self.clone();
        }
        let mut server = fetched(server);
        let mut next = self.clone();

        // A page may already have delivered the server id; keep one entry.
        let mut orphans = Vec::new();
        if server.id != *placeholder_id {
            if let Some(dup) = next.position(&server.id) {
                if next.items[dup].is_parent() {
                    let end = next.block_end(dup);
                    orphans = next.items.drain(dup + 1..end).collect();
                }
                next.items.remove(dup);
            }
        }

        let Some(index) = next.position(placeholder_id) else {
            return next;
        };
        let comment = next.items[index].comment_mut();
        server.is_owner |= comment.is_owner;
        if server.reply_to_name.is_none() {
            server.reply_to_name = comment.reply_to_name.take();
        }
        *comment = server;
        if next.items[index].is_parent() {
            let at = next.block_end(index);
            next.items.splice(at..at, orphans);
            next.settle_reply_count(index);
        }
        next
    }

    #[must_use]
    pub fn mark_failed(&self, placeholder_id: &CommentId) -> Self {
        self.with_status(placeholder_id, SendStatus::Failed)
    }

    #[must_use]
    pub fn mark_sending(&self, placeholder_id: &CommentId) -> Self {
        self.with_status(placeholder_id, SendStatus::Sending)
    }

    fn with_status(&self, placeholder_id: &CommentId, status: SendStatus) -> Self {
        if !placeholder_id.is_local() {
            return self.clone();
        }
        self.mutate_comment(placeholder_id, |comment| comment.status = status)
    }

    /// Removes a parent with its whole block, or a single reply while
    /// decrementing its parent's reply count.
    #[must_use]
    pub fn remove(&self, id: &CommentId) -> Self {
        let mut next = self.clone();
        let Some(index) = next.position(id) else {
            return next;
        };
        if next.items[index].is_parent() {
            let end = next.block_end(index);
            next.items.drain(index..end);
        } else {
            let owner = next.owner_index(index);
            next.items.remove(index);
            if let Some(owner) = owner {
                let parent = next.items[owner].comment_mut();
                parent.reply_count = (parent.reply_count - 1).max(0);
            }
        }
        next
    }

    /// Puts back the block that `id` headed in `snapshot`, next to the
    /// nearest earlier neighbour that still exists. Returns `None` when the
    /// block cannot be restored without breaking the tree.
    #[must_use]
    pub fn restore_removed(&self, snapshot: &ThreadState, id: &CommentId) -> Option<Self> {
        let index = snapshot.position(id)?;
        let mut next = self.clone();

        if snapshot.items[index].is_parent() {
            let block = snapshot.items[index..snapshot.block_end(index)].to_vec();
            if block.iter().any(|item| next.contains(item.id())) {
                return None;
            }
            let at = snapshot.items[..index]
                .iter()
                .rev()
                .find_map(|item| next.position(item.id()))
                .and_then(|anchor| next.owner_index(anchor))
                .map_or(0, |owner| next.block_end(owner));
            next.items.splice(at..at, block);
            return Some(next);
        }

        let item = snapshot.items[index].clone();
        if next.contains(item.id()) {
            return None;
        }
        let owner_id = snapshot.items[snapshot.owner_index(index)?].id();
        let owner = next
            .position(owner_id)
            .filter(|&position| next.items[position].is_parent())?;
        let owner_end = next.block_end(owner);
        let at = snapshot.items[..index]
            .iter()
            .rev()
            .take_while(|candidate| !candidate.is_parent())
            .find_map(|candidate| next.position(candidate.id()))
            .filter(|&position| position > owner && position < owner_end)
            .map_or(owner + 1, |position| position + 1);
        next.items.insert(at, item);
        next.items[owner].comment_mut().reply_count += 1;
        Some(next)
    }

    #[must_use]
    pub fn mutate_comment(&self, id: &CommentId, transform: impl FnOnce(&mut Comment)) -> Self {
        let mut next = self.clone();
        if let Some(index) = next.position(id) {
            transform(next.items[index].comment_mut());
        }
        next
    }

    #[must_use]
    pub fn adjust_total(&self, delta: i64) -> Self {
        let mut next = self.clone();
        next.total_count = (next.total_count + delta).max(0);
        next
    }

    #[must_use]
    pub fn set_total(&self, count: i64) -> Self {
        let mut next = self.clone();
        next.total_count = count.max(0);
        next
    }

    /// Only takes effect while the counter is still zero.
    #[must_use]
    pub fn seed_total(&self, count: i64) -> Self {
        if self.total_count != 0 {
            return self.clone();
        }
        self.set_total(count)
    }

    #[must_use]
    pub fn with_error(&self, error: Option<String>) -> Self {
        let mut next = self.clone();
        next.error = error;
        next
    }

    #[must_use]
    pub fn with_top_level_cursor(&self, cursor: Cursor) -> Self {
        let mut next = self.clone();
        next.top_level = cursor;
        next
    }

    #[must_use]
    pub fn with_reply_cursor(&self, parent_id: &CommentId, cursor: Cursor) -> Self {
        let mut next = self.clone();
        next.replies.insert(parent_id.clone(), cursor);
        next
    }

    /// Starts the pagination topology over: top-level back to its initial
    /// state and every reply cursor dropped.
    #[must_use]
    pub fn reset_cursors(&self) -> Self {
        let mut next = self.clone();
        next.top_level = Cursor::default();
        next.replies.clear();
        next.loading.clear();
        next
    }

    #[must_use]
    pub fn start_loading(&self, key: CursorKey) -> Self {
        let mut next = self.clone();
        if let CursorKey::Replies(parent_id) = &key {
            next.replies.entry(parent_id.clone()).or_default();
        }
        next.loading.insert(key);
        next
    }

    #[must_use]
    pub fn finish_loading(&self, key: &CursorKey) -> Self {
        let mut next = self.clone();
        next.loading.remove(key);
        next
    }

    #[must_use]
    pub fn begin_like(&self, id: &CommentId) -> Self {
        let mut next = self.clone();
        next.likes_in_flight.insert(id.clone());
        next
    }

    #[must_use]
    pub fn end_like(&self, id: &CommentId) -> Self {
        let mut next = self.clone();
        next.likes_in_flight.remove(id);
        next
    }

    pub(crate) fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Checks the structural invariants of the sequence.
    pub fn check_invariants(&self) -> Result<()> {
        if let Some(first) = self.items.first() {
            ensure!(first.is_parent(), "reply {} has no parent before it", first.id());
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            ensure!(seen.insert(item.id()), "duplicate comment id {}", item.id());
        }
        for (index, item) in self.items.iter().enumerate() {
            if let ThreadItem::Parent(parent) = item {
                let materialized = (self.block_end(index) - index - 1) as i64;
                ensure!(
                    parent.reply_count >= materialized,
                    "parent {} counts {} replies but holds {}",
                    parent.id,
                    parent.reply_count,
                    materialized
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Author;

    fn comment(id: &str) -> Comment {
        Comment {
            id: CommentId::parse(id),
            content: format!("content of {id}"),
            author: Author {
                id: format!("author-{id}"),
                display_name: format!("Author {id}"),
                avatar: None,
            },
            like_count: 0,
            reply_count: 0,
            created_at: "2024-01-01T00:00:00Z".into(),
            parent_id: None,
            liked_by_me: false,
            is_owner: false,
            reply_to_name: None,
            status: SendStatus::Sent,
        }
    }

    fn with_replies(id: &str, count: i64) -> Comment {
        let mut parent = comment(id);
        parent.reply_count = count;
        parent
    }

    fn ids(state: &ThreadState) -> Vec<&str> {
        state.items().iter().map(|item| item.id().as_str()).collect()
    }

    fn two_groups() -> ThreadState {
        ThreadState::new("post-1")
            .replace_top_level(vec![with_replies("a", 2), with_replies("b", 1)])
            .insert_replies(&CommentId::remote("a"), vec![comment("a1"), comment("a2")])
            .insert_replies(&CommentId::remote("b"), vec![comment("b1")])
    }

    #[test]
    fn replace_top_level_builds_childless_parents() {
        let state = ThreadState::new("post-1").replace_top_level(vec![
            comment("a"),
            comment("b"),
            comment("a"),
        ]);
        assert_eq!(ids(&state), ["a", "b"]);
        assert!(state.items().iter().all(ThreadItem::is_parent));
    }

    #[test]
    fn append_top_level_skips_known_ids() {
        let state = ThreadState::new("post-1")
            .replace_top_level(vec![comment("a"), comment("b")])
            .append_top_level(vec![comment("b"), comment("c")]);
        assert_eq!(ids(&state), ["a", "b", "c"]);
    }

    #[test]
    fn insert_replies_lands_after_existing_block() {
        let state = two_groups().insert_replies(&CommentId::remote("a"), vec![comment("a3")]);
        assert_eq!(ids(&state), ["a", "a1", "a2", "a3", "b", "b1"]);
        // raised to keep up with what is materialized
        assert_eq!(state.get(&"a".into()).unwrap().comment().reply_count, 3);
        state.check_invariants().unwrap();
    }

    #[test]
    fn insert_replies_for_missing_parent_is_ignored() {
        let state = two_groups();
        let next = state.insert_replies(&CommentId::remote("zzz"), vec![comment("x")]);
        assert_eq!(ids(&next), ids(&state));
    }

    #[test]
    fn insert_optimistic_parent_goes_first_reply_goes_to_block_end() {
        let parent = ThreadItem::Parent(comment("local-1-0"));
        let reply = ThreadItem::Reply(comment("local-1-1"));
        let state = two_groups()
            .insert_optimistic(parent, None)
            .insert_optimistic(reply, Some(&CommentId::remote("a")));
        assert_eq!(
            ids(&state),
            ["local-1-0", "a", "a1", "a2", "local-1-1", "b", "b1"]
        );
    }

    #[test]
    fn reconcile_swaps_in_place_and_is_idempotent() {
        let placeholder = comment("local-9-0");
        let state = two_groups().insert_optimistic(ThreadItem::Parent(placeholder.clone()), None);
        let state = state.mark_sending(&placeholder.id);

        let server = comment("cm_99");
        let once = state.reconcile(&placeholder.id, server.clone());
        assert_eq!(ids(&once)[0], "cm_99");
        assert_eq!(once.items()[0].comment().status, SendStatus::Sent);

        let twice = once.reconcile(&placeholder.id, server);
        assert_eq!(twice, once);
    }

    #[test]
    fn reconcile_keeps_reply_target_unless_server_sends_one() {
        let mut placeholder = comment("local-3-0");
        placeholder.status = SendStatus::Sending;
        placeholder.reply_to_name = Some("Author a1".into());
        let item = ThreadItem::Reply(placeholder.clone());
        let state = two_groups().insert_optimistic(item, Some(&CommentId::remote("a")));

        let kept = state.reconcile(&placeholder.id, comment("cm_5"));
        assert_eq!(
            kept.get(&"cm_5".into()).unwrap().reply_to_name(),
            Some("Author a1")
        );

        let mut server = comment("cm_5");
        server.reply_to_name = Some("Someone".into());
        let replaced = state.reconcile(&placeholder.id, server);
        assert_eq!(
            replaced.get(&"cm_5".into()).unwrap().reply_to_name(),
            Some("Someone")
        );
    }

    #[test]
    fn reconcile_drops_duplicate_delivered_by_a_page() {
        let placeholder = comment("local-4-0");
        let state = ThreadState::new("post-1")
            .replace_top_level(vec![comment("a")])
            .insert_optimistic(ThreadItem::Parent(placeholder.clone()), None)
            .append_top_level(vec![comment("cm_7")]);
        let next = state.reconcile(&placeholder.id, comment("cm_7"));
        assert_eq!(ids(&next), ["cm_7", "a"]);
        next.check_invariants().unwrap();
    }

    #[test]
    fn mark_failed_only_touches_placeholders() {
        let state = two_groups();
        assert_eq!(state.mark_failed(&"a".into()), state);

        let placeholder = comment("local-2-0");
        let state = state.insert_optimistic(ThreadItem::Parent(placeholder.clone()), None);
        let failed = state.mark_failed(&placeholder.id);
        assert_eq!(
            failed.get(&placeholder.id).unwrap().comment().status,
            SendStatus::Failed
        );
    }

    #[test]
    fn remove_parent_takes_its_block() {
        let state = two_groups().remove(&"a".into());
        assert_eq!(ids(&state), ["b", "b1"]);
    }

    #[test]
    fn remove_reply_decrements_parent() {
        let state = two_groups().remove(&"a1".into());
        assert_eq!(ids(&state), ["a", "a2", "b", "b1"]);
        assert_eq!(state.get(&"a".into()).unwrap().comment().reply_count, 1);
        state.check_invariants().unwrap();
    }

    #[test]
    fn restore_removed_parent_returns_to_its_slot() {
        let before = two_groups();
        let after = before.remove(&"b".into()).append_top_level(vec![comment("c")]);
        let restored = after.restore_removed(&before, &"b".into()).unwrap();
        assert_eq!(ids(&restored), ["a", "a1", "a2", "b", "b1", "c"]);
        restored.check_invariants().unwrap();
    }

    #[test]
    fn restore_removed_reply_keeps_neighbours() {
        let before = two_groups();
        let after = before.remove(&"a1".into());
        let restored = after.restore_removed(&before, &"a1".into()).unwrap();
        assert_eq!(ids(&restored), ids(&before));
        assert_eq!(restored.get(&"a".into()).unwrap().comment().reply_count, 2);
    }

    #[test]
    fn restore_removed_reply_without_parent_gives_up() {
        let before = two_groups();
        let after = before.remove(&"a2".into()).remove(&"a".into());
        assert!(after.restore_removed(&before, &"a2".into()).is_none());
    }

    #[test]
    fn seed_total_does_not_overwrite() {
        let state = ThreadState::new("post-1").seed_total(4);
        assert_eq!(state.total_count(), 4);
        assert_eq!(state.seed_total(10).total_count(), 4);
        assert_eq!(state.adjust_total(-9).total_count(), 0);
    }

    #[test]
    fn loading_guard_is_per_key() {
        let parent = CommentId::remote("a");
        let state = two_groups().start_loading(CursorKey::Replies(parent.clone()));
        assert!(!state.can_fetch(&CursorKey::Replies(parent.clone())));
        assert!(state.can_fetch(&CursorKey::TopLevel));
        assert!(state.reply_cursor(&parent).is_some());

        let state = state
            .finish_loading(&CursorKey::Replies(parent.clone()))
            .with_reply_cursor(&parent, Cursor::after(None));
        assert!(!state.can_fetch(&CursorKey::Replies(parent)));
    }

    #[test]
    fn reset_cursors_starts_over() {
        let parent = CommentId::remote("a");
        let state = two_groups()
            .with_top_level_cursor(Cursor::after(None))
            .with_reply_cursor(&parent, Cursor::after(Some("r2".into())))
            .reset_cursors();
        assert!(state.top_level_cursor().is_initial());
        assert!(state.reply_cursor(&parent).is_none());
    }

    #[test]
    fn group_of_resolves_nearest_parent() {
        let state = two_groups();
        assert_eq!(state.group_of(&"a2".into()).map(CommentId::as_str), Some("a"));
        assert_eq!(state.group_of(&"b".into()).map(CommentId::as_str), Some("b"));
        assert_eq!(state.replies_of(&"a".into()).len(), 2);
    }
}
