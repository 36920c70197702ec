use serde_json::Value;

/// Pagination style of a source resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// Numbered pages; iteration stops when a page returns fewer records
    /// than the page size. Pages are independent, so they can be fetched
    /// concurrently.
    Numbered { page_size: u32 },
    /// Opaque cursor tokens; iteration stops when no next cursor is
    /// returned. Inherently sequential.
    Cursor { limit: u32 },
}

/// Position of one page within a paginated iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// 1-based page number.
    Number(u32),
    /// Cursor token; `None` requests the first page.
    Token(Option<String>),
}

/// A single page request handed to a [`crate::fetch::PagedSource`].
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub cursor: PageCursor,
    /// Records requested per page.
    pub per_page: u32,
}

impl PageRequest {
    /// Short human-readable position, attached to error context.
    pub fn describe(&self) -> String {
        match &self.cursor {
            PageCursor::Number(page) => format!("page {page}"),
            PageCursor::Token(None) => "first page".to_string(),
            PageCursor::Token(Some(token)) => format!("cursor {token}"),
        }
    }
}

/// A decoded page of records plus the continuation token, if any.
#[derive(Debug, Clone, Default)]
pub struct PageResponse {
    pub records: Vec<Value>,
    pub next_cursor: Option<String>,
}
