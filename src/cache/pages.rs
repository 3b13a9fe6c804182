//! Cursor-paged query results.

use serde::{Deserialize, Serialize};

use super::traits::Identified;

/// Where the next page request should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPage {
  /// No page loaded yet
  Start,
  /// Continue after the item with this id
  After(String),
  /// The last page came back empty
  Exhausted,
}

/// All pages loaded so far for one paged query, in request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfinitePages<T> {
  pub pages: Vec<Vec<T>>,
}

impl<T: Identified> InfinitePages<T> {
  pub fn new() -> Self {
    Self { pages: Vec::new() }
  }

  pub fn first(page: Vec<T>) -> Self {
    Self { pages: vec![page] }
  }

  /// Cursor for the next request, derived from the last page.
  pub fn next_page(&self) -> NextPage {
    match self.pages.last() {
      None => NextPage::Start,
      Some(page) => match page.last() {
        Some(item) => NextPage::After(item.cache_key().to_string()),
        // If there's no data, there are no more pages
        None => NextPage::Exhausted,
      },
    }
  }

  pub fn has_next_page(&self) -> bool {
    self.next_page() != NextPage::Exhausted
  }

  pub fn push(&mut self, page: Vec<T>) {
    self.pages.push(page);
  }

  /// Every item across pages, in order.
  pub fn items(&self) -> impl Iterator<Item = &T> {
    self.pages.iter().flatten()
  }

  pub fn item_count(&self) -> usize {
    self.pages.iter().map(Vec::len).sum()
  }
}

impl<T: Identified> Default for InfinitePages<T> {
  fn default() -> Self {
    Self::new()
  }
}
