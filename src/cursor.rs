use crate::model::CommentId;

/// Opaque server token plus whether another page may exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub token: Option<String>,
    pub has_more: bool,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            token: None,
            has_more: true,
        }
    }
}

impl Cursor {
    /// Cursor after a page whose response carried `next`. A missing next
    /// token ends pagination even when the page itself had items.
    pub fn after(next: Option<String>) -> Self {
        Self {
            has_more: next.is_some(),
            token: next,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.token.is_none() && self.has_more
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CursorKey {
    TopLevel,
    Replies(CommentId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_open() {
        let cursor = Cursor::default();
        assert!(cursor.is_initial());
        assert!(cursor.has_more);
    }

    #[test]
    fn null_next_ends_pagination() {
        assert!(!Cursor::after(None).has_more);
        let cursor = Cursor::after(Some("c1".into()));
        assert!(cursor.has_more);
        assert_eq!(cursor.token.as_deref(), Some("c1"));
        assert!(!cursor.is_initial());
    }
}
