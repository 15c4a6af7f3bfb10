//! The comment thread engine.
//!
//! Every action runs on the owner's sequence: it applies its optimistic
//! transform to the current [`ThreadState`], publishes the new snapshot and
//! hands the collaborator call to a worker. Workers report back over a
//! channel; [`Engine::poll`] applies those completions one at a time, so the
//! tree is only ever touched from the owning sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::cursor::{Cursor, CursorKey};
use crate::data::{CommentService, InteractionService};
use crate::model::{Author, Comment, CommentId, Page, SendStatus, ThreadItem};
use crate::store::ThreadState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// One worker thread per collaborator call.
    #[default]
    Background,
    /// Run the call inline; its completion still waits for the next `poll`.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("no subject loaded")]
    NotLoaded,
    #[error("subject id is empty")]
    EmptySubject,
    #[error("comment is empty")]
    EmptyContent,
    #[error("comment {0} not found")]
    UnknownComment(CommentId),
    #[error("comment {0} is not a top-level comment")]
    NotAParent(CommentId),
    #[error("comment {target} is not in the reply group of {root}")]
    OutsideGroup { root: CommentId, target: CommentId },
    #[error("comment {0} has not been sent yet")]
    NotSent(CommentId),
    #[error("a like for comment {0} is already in flight")]
    LikeInFlight(CommentId),
    #[error("comment {0} cannot be retried")]
    NotRetryable(CommentId),
}

pub struct Options {
    /// The signed-in user; placeholders are authored as this user.
    pub identity: Author,
    pub comment_service: Arc<dyn CommentService>,
    pub interaction_service: Arc<dyn InteractionService>,
    pub dispatch: Dispatch,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LoadMode {
    Replace,
    Append,
}

#[derive(Clone, Debug)]
struct ReplyTarget {
    root: CommentId,
    target: CommentId,
}

/// What a send needs to be re-run from scratch.
#[derive(Clone, Debug)]
struct Draft {
    content: String,
    reply: Option<ReplyTarget>,
}

struct PendingDelete {
    snapshot: Arc<ThreadState>,
    applied_revision: u64,
    amount: i64,
    /// Retry drafts of placeholders inside the removed block.
    drafts: Vec<(CommentId, Draft)>,
}

enum AsyncResponse {
    TopLevel {
        generation: u64,
        mode: LoadMode,
        result: Result<Page>,
    },
    Replies {
        generation: u64,
        parent_id: CommentId,
        result: Result<Page>,
    },
    Sent {
        placeholder: CommentId,
        result: Result<Comment>,
    },
    LikeResult {
        comment_id: CommentId,
        liked: bool,
        error: Option<String>,
    },
    Deleted {
        request_id: u64,
        comment_id: CommentId,
        error: Option<String>,
    },
}

pub struct Engine {
    identity: Author,
    comment_service: Arc<dyn CommentService>,
    interaction_service: Arc<dyn InteractionService>,
    dispatch: Dispatch,
    state: Arc<ThreadState>,
    subscribers: Vec<Sender<Arc<ThreadState>>>,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    alive: Arc<AtomicBool>,
    generation: u64,
    next_request_id: u64,
    outstanding: usize,
    drafts: HashMap<CommentId, Draft>,
    pending_deletes: HashMap<u64, PendingDelete>,
}

impl Engine {
    pub fn new(options: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            identity: options.identity,
            comment_service: options.comment_service,
            interaction_service: options.interaction_service,
            dispatch: options.dispatch,
            state: Arc::new(ThreadState::default()),
            subscribers: Vec::new(),
            response_tx,
            response_rx,
            alive: Arc::new(AtomicBool::new(true)),
            generation: 0,
            next_request_id: 1,
            outstanding: 0,
            drafts: HashMap::new(),
            pending_deletes: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &Author {
        &self.identity
    }

    /// The latest immutable snapshot.
    pub fn snapshot(&self) -> Arc<ThreadState> {
        Arc::clone(&self.state)
    }

    /// Stream of snapshots, starting with the current one.
    pub fn subscribe(&mut self) -> Receiver<Arc<ThreadState>> {
        let (tx, rx) = unbounded();
        let _ = tx.send(self.snapshot());
        self.subscribers.push(tx);
        rx
    }

    /// Collaborator calls whose completion has not been applied yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn commit(&mut self, next: ThreadState) {
        let next = next.with_revision(self.state.revision() + 1);
        self.state = Arc::new(next);
        let snapshot = Arc::clone(&self.state);
        self.drafts.retain(|id, _| snapshot.contains(id));
        self.subscribers
            .retain(|subscriber| subscriber.send(Arc::clone(&snapshot)).is_ok());
    }

    fn spawn<F>(&mut self, job: F)
    where
        F: FnOnce() -> AsyncResponse + Send + 'static,
    {
        self.outstanding += 1;
        let tx = self.response_tx.clone();
        match self.dispatch {
            Dispatch::Background => {
                let alive = Arc::clone(&self.alive);
                thread::spawn(move || {
                    let response = job();
                    if alive.load(Ordering::SeqCst) {
                        let _ = tx.send(response);
                    }
                });
            }
            Dispatch::Immediate => {
                let _ = tx.send(job());
            }
        }
    }

    fn subject(&self) -> Result<String, ActionError> {
        self.state
            .subject_id()
            .map(str::to_string)
            .ok_or(ActionError::NotLoaded)
    }

    /// Opens (or reloads) the thread of `subject_id` and fetches its first page.
    pub fn load_initial(&mut self, subject_id: &str) -> Result<(), ActionError> {
        let subject_id = subject_id.trim();
        if subject_id.is_empty() {
            return Err(ActionError::EmptySubject);
        }
        self.generation += 1;
        let base = match self.state.subject_id() {
            Some(current) if current == subject_id => self.state.reset_cursors(),
            // keep a counter seeded before the first load
            None => ThreadState::new(subject_id).seed_total(self.state.total_count()),
            Some(_) => {
                self.pending_deletes.clear();
                ThreadState::new(subject_id)
            }
        };
        self.commit(base.start_loading(CursorKey::TopLevel).with_error(None));
        debug!(subject = subject_id, generation = self.generation, "loading comments");

        let service = Arc::clone(&self.comment_service);
        let generation = self.generation;
        let subject = subject_id.to_string();
        self.spawn(move || AsyncResponse::TopLevel {
            generation,
            mode: LoadMode::Replace,
            result: service.fetch_top_level(&subject, None),
        });
        Ok(())
    }

    pub fn refresh(&mut self) -> Result<(), ActionError> {
        let subject = self.subject()?;
        self.load_initial(&subject)
    }

    /// Fetches the next top-level page. Returns false when the call was
    /// suppressed (already loading or no more pages).
    pub fn load_more_top_level(&mut self) -> Result<bool, ActionError> {
        let subject = self.subject()?;
        let key = CursorKey::TopLevel;
        if !self.state.can_fetch(&key) {
            debug!(subject = %subject, "top-level page suppressed");
            return Ok(false);
        }
        let cursor = self.state.top_level_cursor().token.clone();
        let mode = if cursor.is_none() {
            LoadMode::Replace
        } else {
            LoadMode::Append
        };
        self.commit(self.state.start_loading(key).with_error(None));

        let service = Arc::clone(&self.comment_service);
        let generation = self.generation;
        self.spawn(move || AsyncResponse::TopLevel {
            generation,
            mode,
            result: service.fetch_top_level(&subject, cursor.as_deref()),
        });
        Ok(true)
    }

    /// Fetches the next page of replies for a top-level comment.
    pub fn load_more_replies(&mut self, parent_id: &CommentId) -> Result<bool, ActionError> {
        let subject = self.subject()?;
        let parent = self
            .state
            .get(parent_id)
            .ok_or_else(|| ActionError::UnknownComment(parent_id.clone()))?;
        if !parent.is_parent() {
            return Err(ActionError::NotAParent(parent_id.clone()));
        }
        if parent_id.is_local() {
            return Err(ActionError::NotSent(parent_id.clone()));
        }
        let key = CursorKey::Replies(parent_id.clone());
        if !self.state.can_fetch(&key) {
            debug!(parent = %parent_id, "reply page suppressed");
            return Ok(false);
        }
        let cursor = self.state.cursor(&key).token;
        self.commit(self.state.start_loading(key).with_error(None));

        let service = Arc::clone(&self.comment_service);
        let generation = self.generation;
        let parent_id = parent_id.clone();
        self.spawn(move || {
            let result = service.fetch_replies(&subject, &parent_id, cursor.as_deref());
            AsyncResponse::Replies {
                generation,
                parent_id,
                result,
            }
        });
        Ok(true)
    }

    pub fn send_comment(&mut self, content: &str) -> Result<CommentId, ActionError> {
        let base = self.snapshot();
        self.start_send(
            &base,
            Draft {
                content: content.to_string(),
                reply: None,
            },
        )
    }

    /// Replies to `target_id`, showing the reply in the group of `root_parent_id`.
    pub fn send_reply(
        &mut self,
        root_parent_id: &CommentId,
        target_id: &CommentId,
        content: &str,
    ) -> Result<CommentId, ActionError> {
        let base = self.snapshot();
        self.start_send(
            &base,
            Draft {
                content: content.to_string(),
                reply: Some(ReplyTarget {
                    root: root_parent_id.clone(),
                    target: target_id.clone(),
                }),
            },
        )
    }

    fn reply_to_name(base: &ThreadState, reply: &ReplyTarget) -> Result<String, ActionError> {
        let root = base
            .get(&reply.root)
            .ok_or_else(|| ActionError::UnknownComment(reply.root.clone()))?;
        if !root.is_parent() {
            return Err(ActionError::NotAParent(reply.root.clone()));
        }
        let target = base
            .get(&reply.target)
            .ok_or_else(|| ActionError::UnknownComment(reply.target.clone()))?;
        if reply.target.is_local() {
            return Err(ActionError::NotSent(reply.target.clone()));
        }
        if base.group_of(&reply.target) != Some(&reply.root) {
            return Err(ActionError::OutsideGroup {
                root: reply.root.clone(),
                target: reply.target.clone(),
            });
        }
        Ok(target.comment().author.display_name.clone())
    }

    /// Synthesizes the placeholder on top of `base`, commits it and posts the draft.
    fn start_send(&mut self, base: &ThreadState, draft: Draft) -> Result<CommentId, ActionError> {
        let subject = self.subject()?;
        let content = draft.content.trim().to_string();
        if content.is_empty() {
            return Err(ActionError::EmptyContent);
        }

        let (placeholder, next) = match &draft.reply {
            None => {
                let placeholder = Comment::placeholder(&self.identity, &content, None);
                let next = base.insert_optimistic(ThreadItem::Parent(placeholder.clone()), None);
                (placeholder, next)
            }
            Some(reply) => {
                let name = Self::reply_to_name(base, reply)?;
                let mut placeholder =
                    Comment::placeholder(&self.identity, &content, Some(reply.target.clone()));
                placeholder.reply_to_name = Some(name);
                let item = ThreadItem::Reply(placeholder.clone());
                // The reply count bump stands even if the post later fails.
                let next = base
                    .insert_optimistic(item, Some(&reply.root))
                    .mutate_comment(&reply.root, |root| root.reply_count += 1);
                (placeholder, next)
            }
        };

        let id = placeholder.id.clone();
        self.drafts.insert(
            id.clone(),
            Draft {
                content: content.clone(),
                reply: draft.reply.clone(),
            },
        );
        self.commit(next.adjust_total(1).with_error(None));
        debug!(placeholder = %id, reply = draft.reply.is_some(), "sending comment");

        let service = Arc::clone(&self.interaction_service);
        let target = draft.reply.map(|reply| reply.target);
        let placeholder_id = id.clone();
        self.spawn(move || {
            let result = match &target {
                Some(target) => service.post_reply(&subject, target, &content),
                None => service.post_comment(&subject, &content),
            };
            AsyncResponse::Sent {
                placeholder: placeholder_id,
                result,
            }
        });
        Ok(id)
    }

    pub fn toggle_like(&mut self, comment_id: &CommentId) -> Result<(), ActionError> {
        let item = self
            .state
            .get(comment_id)
            .ok_or_else(|| ActionError::UnknownComment(comment_id.clone()))?;
        if comment_id.is_local() {
            return Err(ActionError::NotSent(comment_id.clone()));
        }
        if self.state.like_in_flight(comment_id) {
            return Err(ActionError::LikeInFlight(comment_id.clone()));
        }
        let liked = !item.comment().liked_by_me;
        self.commit(
            self.state
                .begin_like(comment_id)
                .mutate_comment(comment_id, |comment| {
                    comment.liked_by_me = liked;
                    comment.like_count += if liked { 1 } else { -1 };
                })
                .with_error(None),
        );

        let service = Arc::clone(&self.interaction_service);
        let comment_id = comment_id.clone();
        self.spawn(move || {
            let result = if liked {
                service.like(&comment_id)
            } else {
                service.unlike(&comment_id)
            };
            AsyncResponse::LikeResult {
                comment_id,
                liked,
                error: result.err().map(|err| format!("{err:#}")),
            }
        });
        Ok(())
    }

    pub fn delete(&mut self, comment_id: &CommentId) -> Result<(), ActionError> {
        let item = self
            .state
            .get(comment_id)
            .ok_or_else(|| ActionError::UnknownComment(comment_id.clone()))?;
        let amount = match item {
            ThreadItem::Parent(comment) => 1 + comment.reply_count.max(0),
            ThreadItem::Reply(_) => 1,
        };
        let mut removed = vec![comment_id.clone()];
        if item.is_parent() {
            removed.extend(
                self.state
                    .replies_of(comment_id)
                    .iter()
                    .map(|reply| reply.id().clone()),
            );
        }
        let drafts: Vec<(CommentId, Draft)> = removed
            .into_iter()
            .filter_map(|id| self.drafts.get(&id).cloned().map(|draft| (id, draft)))
            .collect();
        let snapshot = self.snapshot();
        self.commit(
            self.state
                .remove(comment_id)
                .adjust_total(-amount)
                .with_error(None),
        );

        // The server never saw a placeholder; dropping it locally is final.
        if comment_id.is_local() {
            debug!(placeholder = %comment_id, "discarded unsent comment");
            return Ok(());
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending_deletes.insert(
            request_id,
            PendingDelete {
                snapshot,
                applied_revision: self.state.revision(),
                amount,
                drafts,
            },
        );

        let service = Arc::clone(&self.interaction_service);
        let comment_id = comment_id.clone();
        self.spawn(move || {
            let error = service.delete(&comment_id).err().map(|err| format!("{err:#}"));
            AsyncResponse::Deleted {
                request_id,
                comment_id,
                error,
            }
        });
        Ok(())
    }

    /// Drops a failed placeholder and sends its content again as a new one.
    pub fn retry(&mut self, comment_id: &CommentId) -> Result<CommentId, ActionError> {
        let item = self
            .state
            .get(comment_id)
            .ok_or_else(|| ActionError::UnknownComment(comment_id.clone()))?;
        if item.comment().status != SendStatus::Failed {
            return Err(ActionError::NotRetryable(comment_id.clone()));
        }
        let draft = self
            .drafts
            .get(comment_id)
            .cloned()
            .ok_or_else(|| ActionError::NotRetryable(comment_id.clone()))?;
        let base = self.state.remove(comment_id).adjust_total(-1);
        self.start_send(&base, draft)
    }

    /// Seeds the header counter from an outside source; ignored once non-zero.
    pub fn set_known_total_count(&mut self, count: i64) {
        if self.state.total_count() != 0 || count <= 0 {
            return;
        }
        self.commit(self.state.seed_total(count));
    }

    pub fn dismiss_error(&mut self) {
        if self.state.error().is_some() {
            self.commit(self.state.with_error(None));
        }
    }

    /// Applies every completion that has arrived. Returns true if any did.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
            changed = true;
        }
        changed
    }

    /// Blocks until all outstanding calls are applied or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.poll();
        while self.outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(message) => self.handle_async_response(message),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    fn handle_async_response(&mut self, message: AsyncResponse) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match message {
            AsyncResponse::TopLevel {
                generation,
                mode,
                result,
            } => {
                if generation != self.generation {
                    debug!(generation, "dropping stale top-level page");
                    return;
                }
                let next = self.state.finish_loading(&CursorKey::TopLevel);
                match result {
                    Ok(page) => {
                        let cursor = Cursor::after(page.next_cursor);
                        let next = match mode {
                            LoadMode::Replace => {
                                let next = next.replace_top_level(page.items);
                                match page.total {
                                    Some(total) => next.set_total(total),
                                    None => next,
                                }
                            }
                            LoadMode::Append => next.append_top_level(page.items),
                        };
                        self.commit(next.with_top_level_cursor(cursor));
                    }
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "loading comments failed");
                        self.commit(
                            next.with_error(Some(format!("Failed to load comments: {err:#}"))),
                        );
                    }
                }
            }
            AsyncResponse::Replies {
                generation,
                parent_id,
                result,
            } => {
                if generation != self.generation {
                    debug!(generation, parent = %parent_id, "dropping stale reply page");
                    return;
                }
                let key = CursorKey::Replies(parent_id.clone());
                let next = self.state.finish_loading(&key);
                match result {
                    Ok(page) if next.contains(&parent_id) => {
                        let cursor = Cursor::after(page.next_cursor);
                        self.commit(
                            next.insert_replies(&parent_id, page.items)
                                .with_reply_cursor(&parent_id, cursor),
                        );
                    }
                    Ok(_) => {
                        debug!(parent = %parent_id, "parent gone before its replies arrived");
                        self.commit(next);
                    }
                    Err(err) => {
                        warn!(parent = %parent_id, error = %format!("{err:#}"), "loading replies failed");
                        self.commit(
                            next.with_error(Some(format!("Failed to load replies: {err:#}"))),
                        );
                    }
                }
            }
            AsyncResponse::Sent {
                placeholder,
                result,
            } => {
                if !self.state.contains(&placeholder) {
                    debug!(placeholder = %placeholder, "placeholder gone before send settled");
                    return;
                }
                match result {
                    Ok(comment) => {
                        debug!(placeholder = %placeholder, id = %comment.id, "comment sent");
                        self.commit(self.state.reconcile(&placeholder, comment));
                    }
                    Err(err) => {
                        warn!(placeholder = %placeholder, error = %format!("{err:#}"), "sending comment failed");
                        self.commit(
                            self.state
                                .mark_failed(&placeholder)
                                .with_error(Some(format!("Failed to send comment: {err:#}"))),
                        );
                    }
                }
            }
            AsyncResponse::LikeResult {
                comment_id,
                liked,
                error,
            } => {
                let next = self.state.end_like(&comment_id);
                match error {
                    None => self.commit(next),
                    Some(err) => {
                        warn!(comment = %comment_id, error = %err, "like rolled back");
                        // Invert the toggle only while the row still shows it;
                        // a fresher server copy is left alone.
                        self.commit(
                            next.mutate_comment(&comment_id, |comment| {
                                if comment.liked_by_me == liked {
                                    comment.liked_by_me = !liked;
                                    comment.like_count -= if liked { 1 } else { -1 };
                                }
                            })
                            .with_error(Some(format!("Failed to update like: {err}"))),
                        );
                    }
                }
            }
            AsyncResponse::Deleted {
                request_id,
                comment_id,
                error,
            } => {
                let Some(pending) = self.pending_deletes.remove(&request_id) else {
                    return;
                };
                let Some(err) = error else {
                    debug!(comment = %comment_id, "comment deleted");
                    return;
                };
                warn!(comment = %comment_id, error = %err, "delete rolled back");
                let restored = if self.state.revision() == pending.applied_revision {
                    Some((*pending.snapshot).clone())
                } else {
                    self.state
                        .restore_removed(&pending.snapshot, &comment_id)
                        .map(|state| state.adjust_total(pending.amount))
                };
                let message = Some(format!("Failed to delete comment: {err}"));
                match restored {
                    Some(state) => self.commit(state.with_error(message)),
                    None => self.commit(self.state.with_error(message)),
                }
                for (id, draft) in pending.drafts {
                    if self.state.contains(&id) {
                        self.drafts.insert(id, draft);
                    }
                }
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryBackend, Operation};

    fn me() -> Author {
        Author {
            id: "me".into(),
            display_name: "Me".into(),
            avatar: None,
        }
    }

    fn engine_with(backend: &Arc<MemoryBackend>) -> Engine {
        Engine::new(Options {
            identity: me(),
            comment_service: backend.clone(),
            interaction_service: backend.clone(),
            dispatch: Dispatch::Immediate,
        })
    }

    fn loaded(backend: &Arc<MemoryBackend>) -> Engine {
        let mut engine = engine_with(backend);
        engine.load_initial("post-1").unwrap();
        engine.poll();
        engine
    }

    #[test]
    fn actions_before_load_are_rejected() {
        let backend = Arc::new(MemoryBackend::new(me(), 5, 5));
        let mut engine = engine_with(&backend);
        assert_eq!(engine.send_comment("hi"), Err(ActionError::NotLoaded));
        assert_eq!(engine.load_more_top_level(), Err(ActionError::NotLoaded));
        assert_eq!(engine.load_initial("  "), Err(ActionError::EmptySubject));
    }

    #[test]
    fn empty_content_is_rejected() {
        let backend = Arc::new(MemoryBackend::new(me(), 5, 5));
        let mut engine = loaded(&backend);
        assert_eq!(engine.send_comment("   "), Err(ActionError::EmptyContent));
        assert_eq!(backend.calls(Operation::PostComment), 0);
    }

    #[test]
    fn second_like_while_first_in_flight_is_rejected() {
        let backend = Arc::new(MemoryBackend::demo(me(), "post-1"));
        let mut engine = loaded(&backend);
        let id = engine.snapshot().items()[0].id().clone();
        engine.toggle_like(&id).unwrap();
        assert_eq!(
            engine.toggle_like(&id),
            Err(ActionError::LikeInFlight(id.clone()))
        );
        engine.poll();
        assert!(!engine.snapshot().like_in_flight(&id));
        assert_eq!(backend.calls(Operation::Like), 1);
    }

    #[test]
    fn liking_a_placeholder_is_rejected() {
        let backend = Arc::new(MemoryBackend::new(me(), 5, 5));
        let mut engine = loaded(&backend);
        let placeholder = engine.send_comment("hello").unwrap();
        assert_eq!(
            engine.toggle_like(&placeholder),
            Err(ActionError::NotSent(placeholder.clone()))
        );
    }

    #[test]
    fn reply_target_must_sit_in_root_group() {
        let backend = Arc::new(MemoryBackend::demo(me(), "post-1"));
        let mut engine = loaded(&backend);
        let state = engine.snapshot();
        let first = state.items()[0].id().clone();
        let second = state.items()[1].id().clone();
        assert_eq!(
            engine.send_reply(&first, &second, "hi"),
            Err(ActionError::OutsideGroup {
                root: first.clone(),
                target: second.clone()
            })
        );
    }

    #[test]
    fn retry_requires_failed_placeholder() {
        let backend = Arc::new(MemoryBackend::new(me(), 5, 5));
        let mut engine = loaded(&backend);
        let placeholder = engine.send_comment("hello").unwrap();
        assert_eq!(
            engine.retry(&placeholder),
            Err(ActionError::NotRetryable(placeholder.clone()))
        );
    }

    #[test]
    fn known_total_is_seeded_once() {
        let backend = Arc::new(MemoryBackend::new(me(), 5, 5));
        let mut engine = engine_with(&backend);
        engine.set_known_total_count(12);
        engine.set_known_total_count(30);
        assert_eq!(engine.snapshot().total_count(), 12);
    }

    #[test]
    fn subscribers_see_every_transition() {
        let backend = Arc::new(MemoryBackend::demo(me(), "post-1"));
        let mut engine = engine_with(&backend);
        let updates = engine.subscribe();
        engine.load_initial("post-1").unwrap();
        engine.poll();
        let revisions: Vec<u64> = updates.try_iter().map(|state| state.revision()).collect();
        assert_eq!(revisions, [0, 1, 2]);
    }

    #[test]
    fn completions_after_drop_are_discarded() {
        let backend = Arc::new(MemoryBackend::demo(me(), "post-1"));
        let mut engine = Engine::new(Options {
            identity: me(),
            comment_service: backend.clone(),
            interaction_service: backend.clone(),
            dispatch: Dispatch::Background,
        });
        engine.load_initial("post-1").unwrap();
        drop(engine);
        // nothing left to apply against; the worker must finish quietly
        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.calls(Operation::FetchTopLevel) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(backend.calls(Operation::FetchTopLevel), 1);
    }
}
