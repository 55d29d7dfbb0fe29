//! Offset-based pagination for QIDO-RS searches.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::auth::TokenProvider;
use crate::client::ClientInner;
use crate::error::DicomWebError;
use crate::http_client::HttpClient;
use crate::models::DicomObject;

/// A lazily fetched QIDO-RS result set.
///
/// Pages are requested with `limit`/`offset`. A page shorter than the page size ends the listing,
/// as does an empty (`204`) response. Owns its state through an `Arc`, so it has no lifetime
/// parameters.
pub struct QidoPager<C, T> {
    inner: Arc<ClientInner<C, T>>,
    path: String,
    uid_tag: &'static str,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<DicomObject>,
    done: bool,
}

impl<C: HttpClient, T: TokenProvider> QidoPager<C, T> {
    pub(crate) fn new(inner: Arc<ClientInner<C, T>>, path: String, uid_tag: &'static str) -> Self {
        let page_size = inner.page_size;
        Self {
            inner,
            path,
            uid_tag,
            page_size,
            offset: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Override the page size for this search.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fetch the next individual result, requesting new pages as needed.
    ///
    /// Returns `Ok(None)` once the result set is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates the failure of the underlying page request.
    pub async fn next(&mut self) -> Result<Option<DicomObject>, DicomWebError> {
        if let Some(item) = self.buffer.pop_front() {
            return Ok(Some(item));
        }
        match self.next_page().await? {
            Some(page) => {
                self.buffer = VecDeque::from(page);
                Ok(self.buffer.pop_front())
            }
            None => Ok(None),
        }
    }

    /// Fetch the next full page.
    ///
    /// Returns `Ok(None)` once the result set is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates the failure of the page request. The pager can be polled again afterwards; the
    /// same page is requested.
    pub async fn next_page(&mut self) -> Result<Option<Vec<DicomObject>>, DicomWebError> {
        if self.done {
            return Ok(None);
        }
        let limit = self.page_size.to_string();
        let offset = self.offset.to_string();
        let page = self
            .inner
            .search(&self.path, &[("limit", limit.as_str()), ("offset", offset.as_str())])
            .await?;

        self.offset += page.len();
        if page.len() < self.page_size {
            self.done = true;
        }
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }

    /// Collect every remaining result.
    ///
    /// # Errors
    ///
    /// Fails if any page request fails.
    pub async fn collect(mut self) -> Result<Vec<DicomObject>, DicomWebError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Collect the UID of every remaining result at this search's level, in server order.
    ///
    /// Results without the UID attribute are skipped.
    ///
    /// # Errors
    ///
    /// Fails if any page request fails.
    pub async fn uids(self) -> Result<Vec<String>, DicomWebError> {
        let tag = self.uid_tag;
        Ok(self
            .collect()
            .await?
            .iter()
            .filter_map(|o| o.string(tag).map(ToOwned::to_owned))
            .collect())
    }
}
