//! Offset cursors and pages shared by result reads and job listings.
//!
//! A [`Cursor`] is an opaque token over a position in an append-only
//! sequence. Because positions are never renumbered, the same cursor keeps
//! yielding the same page until something is appended past it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Upper bound applied to every page request.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 1000;

/// Page size used when a caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Opaque position token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cursor(u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn at(position: u64) -> Self {
        Cursor(position)
    }

    pub fn position(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{:x}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('c')
            .filter(|hex| !hex.is_empty())
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(Cursor)
            .ok_or_else(|| AppError::InvalidCursor(s.to_string()))
    }
}

impl Serialize for Cursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Where to start reading and how much to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }

    pub fn after(cursor: Cursor, limit: usize) -> Self {
        Self {
            cursor: Some(cursor),
            limit,
        }
    }

    /// Parse a request from the string form handed out to callers.
    pub fn parse(cursor: Option<&str>, limit: usize) -> Result<Self, AppError> {
        let cursor = cursor.map(str::parse).transpose()?;
        Ok(Self { cursor, limit })
    }

    pub fn offset(&self) -> u64 {
        self.cursor.map_or(0, |c| c.position())
    }

    /// Limit clamped to `[1, max]`.
    pub fn clamped_limit(&self, max: usize) -> usize {
        self.limit.clamp(1, max.max(1))
    }
}

/// One page of an ordered sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` once every item written so far has been returned.
    pub next_cursor: Option<Cursor>,
    /// Position just past the last returned item; valid even when
    /// `next_cursor` is `None`, for tailing a sequence that is still growing.
    pub resume_cursor: Cursor,
}

impl<T> Page<T> {
    /// Build a page from `items` read at `offset` out of `total` available.
    pub fn from_slice(items: Vec<T>, offset: u64, total: u64) -> Self {
        let end = offset + items.len() as u64;
        let next_cursor = (end < total).then_some(Cursor(end));
        Self {
            items,
            next_cursor,
            resume_cursor: Cursor(end.max(offset)),
        }
    }

    pub fn empty_at(offset: u64) -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            resume_cursor: Cursor(offset),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
            resume_cursor: self.resume_cursor,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Slice `all[offset..offset + limit]` into a page.
pub fn paginate<T: Clone>(all: &[T], request: &PageRequest, max_page_size: usize) -> Page<T> {
    let total = all.len() as u64;
    let offset = request.offset();
    if offset >= total {
        return Page::empty_at(offset);
    }
    let start = offset as usize;
    let end = start
        .saturating_add(request.clamped_limit(max_page_size))
        .min(all.len());
    Page::from_slice(all[start..end].to_vec(), offset, total)
}
