//! Provider query construction
//!
//! Turns a semantic mailbox category plus optional free-text hints into a
//! Gmail search string. Each free-text token is classified in a fixed
//! precedence: address, date, file extension, size, then plain text.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

static DATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex"));
static SIZE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\d+[kmg]b$").expect("valid size regex"));

/// One of the five semantic mailbox partitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Inbox,
    Starred,
    Sent,
    Drafts,
    Trash,
}

impl Category {
    /// All categories in display order
    pub const ALL: [Category; 5] = [
        Category::Inbox,
        Category::Starred,
        Category::Sent,
        Category::Drafts,
        Category::Trash,
    ];

    /// Fixed provider query term for the category
    pub fn base_term(self) -> &'static str {
        match self {
            Category::Inbox => "in:inbox",
            Category::Starred => "is:starred",
            Category::Sent => "in:sent",
            Category::Drafts => "in:draft",
            Category::Trash => "in:trash",
        }
    }
}

/// Classification of a single free-text token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Address,
    Date,
    Extension,
    Size,
    Text,
}

fn classify(token: &str) -> TokenKind {
    if token.contains('@') {
        TokenKind::Address
    } else if DATE_TOKEN.is_match(token) {
        TokenKind::Date
    } else if token.starts_with('.') {
        TokenKind::Extension
    } else if SIZE_TOKEN.is_match(token) {
        TokenKind::Size
    } else {
        TokenKind::Text
    }
}

fn expand(token: &str) -> String {
    match classify(token) {
        TokenKind::Address => format!("(from:{token} OR to:{token})"),
        TokenKind::Date => format!("after:{token}"),
        TokenKind::Extension => format!("filename:{token}"),
        TokenKind::Size => format!("size:{token}"),
        TokenKind::Text => format!("(subject:{token} OR body:{token})"),
    }
}

/// Build the provider query for a category and optional free text
///
/// Without free text (or with only whitespace) the result is exactly the
/// category's base term.
///
/// # Example
///
/// ```text
/// build_query(Category::Inbox, Some("alice@x.com .pdf"))
///   == "in:inbox ((from:alice@x.com OR to:alice@x.com) AND filename:.pdf)"
/// ```
pub fn build_query(category: Category, free_text: Option<&str>) -> String {
    let clauses = free_text
        .map(|text| text.split_whitespace().map(expand).collect::<Vec<_>>())
        .unwrap_or_default();

    if clauses.is_empty() {
        return category.base_term().to_owned();
    }
    format!("{} ({})", category.base_term(), clauses.join(" AND "))
}

/// Page token actually forwarded to the provider
///
/// A supplied token is only honored for pages after the first; on page 1 it
/// is discarded.
pub fn effective_page_token(page: u32, page_token: Option<&str>) -> Option<&str> {
    if page > 1 {
        page_token.filter(|t| !t.is_empty())
    } else {
        None
    }
}

/// Transient listing request: category or raw query plus paging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryQuery {
    /// Fully-formed provider query string
    pub query: String,
    /// Clamped page size
    pub page_size: usize,
    /// Token to forward, already filtered by [`effective_page_token`]
    pub page_token: Option<String>,
}

impl CategoryQuery {
    /// Build from a category and free-text hints
    pub fn for_category(
        category: Category,
        free_text: Option<&str>,
        page_size: usize,
        max_page_size: usize,
        page: u32,
        page_token: Option<&str>,
    ) -> Self {
        Self::raw(
            build_query(category, free_text),
            page_size,
            max_page_size,
            page,
            page_token,
        )
    }

    /// Build from an already-formed provider query
    pub fn raw(
        query: String,
        page_size: usize,
        max_page_size: usize,
        page: u32,
        page_token: Option<&str>,
    ) -> Self {
        Self {
            query,
            page_size: page_size.clamp(1, max_page_size.max(1)),
            page_token: effective_page_token(page, page_token).map(str::to_owned),
        }
    }
}
