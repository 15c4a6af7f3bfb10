use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{Author, Comment, CommentId, Page, SendStatus};

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub page_size: usize,
    pub reply_page_size: usize,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    base_url: Url,
    user_agent: String,
    token: Option<String>,
    page_size: usize,
    reply_page_size: usize,
}

/// Every endpoint wraps its payload in this envelope; `success = false` is a
/// well-formed failure and is reported like a transport error.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

fn default_success() -> bool {
    true
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T> {
        if !self.success {
            bail!(self
                .message
                .unwrap_or_else(|| "request was not successful".to_string()));
        }
        self.data.context("response carried no data")
    }

    fn into_unit(self) -> Result<()> {
        if !self.success {
            bail!(self
                .message
                .unwrap_or_else(|| "request was not successful".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorDto {
    #[serde(default)]
    id: String,
    #[serde(default, alias = "nickname", alias = "name")]
    display_name: String,
    #[serde(default, alias = "avatarUrl")]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentDto {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    author: AuthorDto,
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    reply_count: i64,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default, alias = "likedByMe", alias = "isLiked")]
    liked: bool,
    #[serde(default)]
    is_owner: bool,
    #[serde(default, alias = "replyToUserName")]
    reply_to_name: Option<String>,
}

impl From<CommentDto> for Comment {
    fn from(dto: CommentDto) -> Self {
        Comment {
            id: CommentId::remote(dto.id),
            content: dto.content,
            author: Author {
                id: dto.author.id,
                display_name: dto.author.display_name,
                avatar: dto.author.avatar,
            },
            like_count: dto.like_count,
            reply_count: dto.reply_count,
            created_at: dto.created_at,
            parent_id: dto.parent_id.map(CommentId::remote),
            liked_by_me: dto.liked,
            is_owner: dto.is_owner,
            reply_to_name: dto.reply_to_name,
            status: SendStatus::Sent,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageDto {
    #[serde(default)]
    items: Vec<CommentDto>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    total: Option<i64>,
}

impl From<PageDto> for Page {
    fn from(dto: PageDto) -> Self {
        Page {
            items: dto.items.into_iter().map(Comment::from).collect(),
            // some backends send "" instead of null on the last page
            next_cursor: dto.next_cursor.filter(|cursor| !cursor.is_empty()),
            total: dto.total,
        }
    }
}

#[derive(Debug, Serialize)]
struct ContentBody<'a> {
    content: &'a str,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("comment api client user agent required");
        }
        let mut base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("invalid api base url {:?}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("api base url {base_url} cannot carry paths");
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(if config.timeout.is_zero() {
                    Duration::from_secs(20)
                } else {
                    config.timeout
                })
                .build()?,
        };

        Ok(Client {
            http,
            base_url,
            user_agent: config.user_agent,
            token: config.token.filter(|token| !token.trim().is_empty()),
            page_size: config.page_size.max(1),
            reply_page_size: config.reply_page_size.max(1),
        })
    }

    pub fn comments(&self, subject_id: &str, cursor: Option<&str>) -> Result<Page> {
        let url = self.page_url(&["posts", subject_id, "comments"], cursor, self.page_size)?;
        let page: PageDto = self.send(self.http.get(url))?.into_data()?;
        Ok(page.into())
    }

    pub fn replies(
        &self,
        subject_id: &str,
        parent_id: &CommentId,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let url = self.page_url(
            &["posts", subject_id, "comments", parent_id.as_str(), "replies"],
            cursor,
            self.reply_page_size,
        )?;
        let page: PageDto = self.send(self.http.get(url))?.into_data()?;
        Ok(page.into())
    }

    pub fn post_comment(&self, subject_id: &str, content: &str) -> Result<Comment> {
        let url = self.endpoint(&["posts", subject_id, "comments"])?;
        let request = self.http.post(url).json(&ContentBody { content });
        let comment: CommentDto = self.send(request)?.into_data()?;
        Ok(comment.into())
    }

    pub fn post_reply(
        &self,
        subject_id: &str,
        target_id: &CommentId,
        content: &str,
    ) -> Result<Comment> {
        let url = self.endpoint(&[
            "posts",
            subject_id,
            "comments",
            target_id.as_str(),
            "replies",
        ])?;
        let request = self.http.post(url).json(&ContentBody { content });
        let comment: CommentDto = self.send(request)?.into_data()?;
        Ok(comment.into())
    }

    pub fn set_liked(&self, comment_id: &CommentId, liked: bool) -> Result<()> {
        let url = self.endpoint(&["comments", comment_id.as_str(), "like"])?;
        let request = if liked {
            self.http.post(url)
        } else {
            self.http.delete(url)
        };
        let action = if liked { "like" } else { "unlike" };
        self.send::<IgnoredAny>(request)?
            .into_unit()
            .with_context(|| format!("{action} comment {comment_id}"))
    }

    pub fn delete(&self, comment_id: &CommentId) -> Result<()> {
        let url = self.endpoint(&["comments", comment_id.as_str()])?;
        self.send::<IgnoredAny>(self.http.delete(url))?
            .into_unit()
            .with_context(|| format!("delete comment {comment_id}"))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base url cannot carry paths"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn page_url(&self, segments: &[&str], cursor: Option<&str>, limit: usize) -> Result<Url> {
        let mut url = self.endpoint(segments)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        Ok(url)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Envelope<T>> {
        let mut request = request.header(USER_AGENT, &self.user_agent);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let message = serde_json::from_str::<Envelope<IgnoredAny>>(&body)
                .ok()
                .and_then(|envelope| envelope.message)
                .unwrap_or_else(|| status.to_string());
            bail!("{message}");
        }
        tracing::debug!(%status, url = %response.url(), "comment api response");
        response
            .json::<Envelope<T>>()
            .context("decode comment api response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> Client {
        Client::new(ClientConfig {
            base_url: base_url.to_string(),
            user_agent: "comment-thread/test".into(),
            page_size: 20,
            reply_page_size: 5,
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn requires_user_agent() {
        let err = Client::new(ClientConfig {
            base_url: "https://api.example.com".into(),
            ..ClientConfig::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn endpoints_keep_base_path_and_escape_ids() {
        let client = client("https://api.example.com/v1");
        let url = client.endpoint(&["posts", "post 1", "comments"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/posts/post%201/comments"
        );
    }

    #[test]
    fn page_url_carries_limit_and_cursor() {
        let client = client("https://api.example.com/");
        let url = client
            .page_url(&["posts", "p1", "comments", "cm_1", "replies"], Some("c2"), 5)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/posts/p1/comments/cm_1/replies?limit=5&cursor=c2"
        );
    }

    #[test]
    fn decodes_page_envelope() {
        let body = r#"{
            "success": true,
            "data": {
                "items": [{
                    "id": "cm_1",
                    "content": "hi",
                    "author": {"id": "u1", "nickname": "Ada"},
                    "likeCount": 3,
                    "replyCount": 1,
                    "createdAt": "2024-05-01T10:00:00Z",
                    "isLiked": true
                }],
                "nextCursor": ""
            }
        }"#;
        let envelope: Envelope<PageDto> = serde_json::from_str(body).unwrap();
        let page: Page = envelope.into_data().unwrap().into();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_cursor.is_none());
        let comment = &page.items[0];
        assert_eq!(comment.author.display_name, "Ada");
        assert!(comment.liked_by_me);
        assert_eq!(comment.status, SendStatus::Sent);
    }

    #[test]
    fn unsuccessful_envelope_is_an_error() {
        let body = r#"{"success": false, "message": "comment not found"}"#;
        let envelope: Envelope<IgnoredAny> = serde_json::from_str(body).unwrap();
        let err = envelope.into_unit().unwrap_err();
        assert_eq!(err.to_string(), "comment not found");
    }
}
