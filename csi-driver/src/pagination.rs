//! Cursor pagination over a stably ordered inventory.
//!
//! A token is the decimal position of the next entry. An empty token starts
//! at the beginning and an empty next token means the inventory is exhausted.

use thiserror::Error;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaginationError {
    #[error("Invalid starting_token: '{0}'")]
    InvalidToken(String),

    #[error("starting_token position {position} is beyond the {size} available entries")]
    OutOfRange { position: usize, size: usize },
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub entries: Vec<T>,
    /// Empty when there are no further entries
    pub next_token: String,
}

/// Slice `items` starting at the position encoded in `starting_token`.
///
/// `max_entries <= 0` selects [`DEFAULT_PAGE_SIZE`].
pub fn paginate<T>(
    items: Vec<T>,
    max_entries: i32,
    starting_token: &str,
) -> Result<Page<T>, PaginationError> {
    let start = parse_token(starting_token)?;
    let size = items.len();
    if start > size {
        return Err(PaginationError::OutOfRange {
            position: start,
            size,
        });
    }

    let page_size = if max_entries > 0 {
        max_entries as usize
    } else {
        DEFAULT_PAGE_SIZE
    };
    let end = start.saturating_add(page_size).min(size);

    let next_token = if end < size {
        end.to_string()
    } else {
        String::new()
    };

    let entries = items.into_iter().skip(start).take(end - start).collect();
    Ok(Page {
        entries,
        next_token,
    })
}

fn parse_token(token: &str) -> Result<usize, PaginationError> {
    if token.is_empty() {
        return Ok(0);
    }
    token
        .parse::<usize>()
        .map_err(|_| PaginationError::InvalidToken(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn test_every_page_size_enumerates_once() {
        let n = 12;
        for k in 1..=n {
            let mut seen = Vec::new();
            let mut token = String::new();
            loop {
                let page = paginate(inventory(n), k as i32, &token).unwrap();
                assert!(page.entries.len() <= k);
                seen.extend(page.entries);
                if page.next_token.is_empty() {
                    break;
                }
                token = page.next_token;
            }
            assert_eq!(seen, inventory(n), "page size {}", k);
        }
    }

    #[test]
    fn test_twelve_entries_in_pages_of_five() {
        let first = paginate(inventory(12), 5, "").unwrap();
        assert_eq!(first.entries.len(), 5);
        assert_eq!(first.next_token, "5");

        let second = paginate(inventory(12), 5, &first.next_token).unwrap();
        assert_eq!(second.entries, vec![5, 6, 7, 8, 9]);
        assert_eq!(second.next_token, "10");

        let third = paginate(inventory(12), 5, &second.next_token).unwrap();
        assert_eq!(third.entries, vec![10, 11]);
        assert!(third.next_token.is_empty());
    }

    #[test]
    fn test_default_page_size() {
        let page = paginate(inventory(250), 0, "").unwrap();
        assert_eq!(page.entries.len(), DEFAULT_PAGE_SIZE);
        assert_eq!(page.next_token, "100");

        let page = paginate(inventory(3), -1, "").unwrap();
        assert_eq!(page.entries.len(), 3);
        assert!(page.next_token.is_empty());
    }

    #[test]
    fn test_invalid_tokens() {
        assert_eq!(
            paginate(inventory(3), 1, "invalid-token").unwrap_err(),
            PaginationError::InvalidToken("invalid-token".to_string())
        );
        assert!(matches!(
            paginate(inventory(3), 1, "-1"),
            Err(PaginationError::InvalidToken(_))
        ));
        assert_eq!(
            paginate(inventory(3), 1, "9999").unwrap_err(),
            PaginationError::OutOfRange {
                position: 9999,
                size: 3
            }
        );
    }

    #[test]
    fn test_token_at_end_yields_empty_page() {
        let page = paginate(inventory(3), 2, "3").unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next_token.is_empty());
    }

    #[test]
    fn test_empty_inventory() {
        let page = paginate(Vec::<usize>::new(), 10, "").unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next_token.is_empty());
    }
}
