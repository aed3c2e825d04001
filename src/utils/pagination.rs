//! Cursor-based pagination for list endpoints
//!
//! Cursors are url-safe base64 JSON documents of the form `{"offset": N}`.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Opaque cursor payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cursor {
    offset: usize,
}

/// One page of results
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in this page
    pub items: Vec<T>,
    /// Cursor for the next page, if any
    pub next_cursor: Option<String>,
}

/// Slice `items` into a page of at most `limit` entries starting at `cursor`
pub fn paginate_array<T: Clone>(items: &[T], cursor: Option<&str>, limit: usize) -> Result<Page<T>> {
    let offset = match cursor {
        Some(c) => {
            let parsed: Cursor = super::b64::decode_json_b64url(c)
                .map_err(|_| BridgeError::validation("Invalid pagination cursor"))?;
            parsed.offset
        }
        None => 0,
    };

    if offset > items.len() {
        return Err(BridgeError::validation("Pagination cursor out of range"));
    }

    let end = (offset + limit).min(items.len());
    let page_items = items[offset..end].to_vec();
    let next_cursor = if end < items.len() {
        Some(super::b64::encode_json_b64url(&Cursor { offset: end })?)
    } else {
        None
    };

    Ok(Page {
        items: page_items,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenating_pages_yields_original() {
        let items: Vec<u32> = (0..237).collect();
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = paginate_array(&items, cursor.as_deref(), 50).unwrap();
            collected.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(collected, items);
    }

    #[test]
    fn test_empty_array() {
        let items: Vec<u32> = vec![];
        let page = paginate_array(&items, None, 50).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_bad_cursor_is_rejected() {
        let items: Vec<u32> = (0..10).collect();
        assert!(paginate_array(&items, Some("garbage"), 50).is_err());
    }

    #[test]
    fn test_exact_page_boundary_has_no_next_cursor() {
        let items: Vec<u32> = (0..50).collect();
        let page = paginate_array(&items, None, 50).unwrap();
        assert_eq!(page.items.len(), 50);
        assert!(page.next_cursor.is_none());
    }
}
