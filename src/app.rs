use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{self, Config};
use crate::cursor::CursorKey;
use crate::data::{CommentService, InteractionService, MemoryBackend};
use crate::data::{RestCommentService, RestInteractionService};
use crate::engine::{Dispatch, Engine, Options};
use crate::model::SendStatus;
use crate::rest;
use crate::store::ThreadState;

pub const DEMO_SUBJECT: &str = "post-1";

const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub subject_id: Option<String>,
    pub config_file: Option<PathBuf>,
    /// Serve the thread from the in-memory backend regardless of config.
    pub demo: bool,
}

/// Loads the thread of the requested subject with every reply page and
/// prints it to stdout.
pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    init_logging(&cfg);

    let demo = options.demo || cfg.api.base_url.trim().is_empty();
    let subject_id = match options.subject_id {
        Some(subject) => subject,
        None if demo => DEMO_SUBJECT.to_string(),
        None => bail!("a subject id is required when an api base url is configured"),
    };

    let mut engine = build_engine(&cfg, demo, &subject_id)?;
    let state = load_thread(&mut engine, &subject_id)?;
    print!("{}", render(&state));
    Ok(())
}

fn init_logging(cfg: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.filter));
    // a global subscriber may already be installed when embedded
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_engine(cfg: &Config, demo: bool, subject_id: &str) -> Result<Engine> {
    let identity = cfg.identity.author();
    let comment_service: Arc<dyn CommentService>;
    let interaction_service: Arc<dyn InteractionService>;
    if demo {
        info!(subject = %subject_id, "using in-memory demo backend");
        let backend = Arc::new(MemoryBackend::demo(identity.clone(), subject_id));
        comment_service = backend.clone();
        interaction_service = backend;
    } else {
        info!(base_url = %cfg.api.base_url, "using comment api");
        let client = Arc::new(
            rest::Client::new(rest::ClientConfig {
                base_url: cfg.api.base_url.clone(),
                user_agent: cfg.api.user_agent.clone(),
                token: cfg.api.token.clone(),
                timeout: cfg.api.timeout,
                page_size: cfg.thread.page_size,
                reply_page_size: cfg.thread.reply_page_size,
                http_client: None,
            })
            .context("create comment api client")?,
        );
        comment_service = Arc::new(RestCommentService::new(client.clone()));
        interaction_service = Arc::new(RestInteractionService::new(client));
    }

    Ok(Engine::new(Options {
        identity,
        comment_service,
        interaction_service,
        dispatch: if cfg.thread.background {
            Dispatch::Background
        } else {
            Dispatch::Immediate
        },
    }))
}

fn load_thread(engine: &mut Engine, subject_id: &str) -> Result<Arc<ThreadState>> {
    engine.load_initial(subject_id)?;
    settle(engine)?;
    while engine.load_more_top_level()? {
        settle(engine)?;
    }

    // replies are fetched group by group until every cursor is exhausted
    loop {
        let state = engine.snapshot();
        let pending: Vec<_> = state
            .items()
            .iter()
            .filter(|item| {
                item.is_parent()
                    && !item.id().is_local()
                    && item.comment().reply_count > 0
                    && state.can_fetch(&CursorKey::Replies(item.id().clone()))
            })
            .map(|item| item.id().clone())
            .collect();
        if pending.is_empty() {
            return Ok(state);
        }
        for parent_id in &pending {
            engine.load_more_replies(parent_id)?;
        }
        settle(engine)?;
    }
}

fn settle(engine: &mut Engine) -> Result<()> {
    if !engine.wait_idle(LOAD_TIMEOUT) {
        bail!("timed out waiting for the comment service");
    }
    if let Some(err) = engine.snapshot().error() {
        bail!("{err}");
    }
    Ok(())
}

pub fn render(state: &ThreadState) -> String {
    let mut out = String::new();
    let subject = state.subject_id().unwrap_or("-");
    let _ = writeln!(
        out,
        "{subject}: {} comment{}",
        state.total_count(),
        if state.total_count() == 1 { "" } else { "s" }
    );
    for item in state.items() {
        let comment = item.comment();
        let indent = "  ".repeat(item.nesting_level());
        let mut header = comment.author.display_name.clone();
        if let Some(name) = item.reply_to_name() {
            let _ = write!(header, " -> {name}");
        }
        let mut meta = format!("{} like", comment.displayed_like_count());
        if comment.displayed_like_count() != 1 {
            meta.push('s');
        }
        if item.is_parent() && comment.reply_count > 0 {
            let _ = write!(meta, ", {} repl", comment.reply_count);
            meta.push_str(if comment.reply_count == 1 { "y" } else { "ies" });
        }
        match comment.status {
            SendStatus::Sending => meta.push_str(", sending"),
            SendStatus::Failed => meta.push_str(", failed"),
            SendStatus::Sent => {}
        }
        let _ = writeln!(out, "{indent}- {header} ({meta}): {}", comment.content);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Author;

    fn viewer() -> Author {
        Author {
            id: "me".into(),
            display_name: "Me".into(),
            avatar: None,
        }
    }

    #[test]
    fn loads_whole_demo_thread() {
        let backend = Arc::new(MemoryBackend::demo(viewer(), DEMO_SUBJECT));
        let mut engine = Engine::new(Options {
            identity: viewer(),
            comment_service: backend.clone(),
            interaction_service: backend,
            dispatch: Dispatch::Immediate,
        });
        let state = load_thread(&mut engine, DEMO_SUBJECT).unwrap();
        assert_eq!(state.items().len(), 6);
        assert_eq!(state.total_count(), 6);
        state.check_invariants().unwrap();
    }

    #[test]
    fn render_indents_replies() {
        let backend = Arc::new(MemoryBackend::demo(viewer(), DEMO_SUBJECT));
        let mut engine = Engine::new(Options {
            identity: viewer(),
            comment_service: backend.clone(),
            interaction_service: backend,
            dispatch: Dispatch::Immediate,
        });
        let state = load_thread(&mut engine, DEMO_SUBJECT).unwrap();
        let text = render(&state);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "post-1: 6 comments");
        assert!(lines[1].starts_with("- Ada (0 likes, 2 replies): First!"));
        assert!(lines[2].starts_with("  - Linus -> Ada"));
        assert!(lines[3].starts_with("  - Grace -> Linus"));
    }
}
