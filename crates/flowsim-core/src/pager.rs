//! An in-memory `FlowPager`.

use std::collections::VecDeque;

use async_trait::async_trait;

use flowsim_contracts::{
    error::{FlowsimError, FlowsimResult},
    flow::FlowRecord,
};

use crate::traits::FlowPager;

/// Serves already-ordered records in fixed-size pages, optionally failing
/// once the records run out.
#[derive(Debug, Default)]
pub struct InMemoryPager {
    pages: VecDeque<Vec<FlowRecord>>,
    error: Option<FlowsimError>,
}

impl InMemoryPager {
    /// A `page_size` of zero is treated as one.
    pub fn new(records: Vec<FlowRecord>, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let mut pages = VecDeque::new();
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            pages.push_back(records.by_ref().take(page_size).collect());
        }
        Self { pages, error: None }
    }

    /// Return `error` instead of end-of-stream after the last page.
    pub fn fail_with(mut self, error: FlowsimError) -> Self {
        self.error = Some(error);
        self
    }
}

#[async_trait]
impl FlowPager for InMemoryPager {
    async fn next_page(&mut self) -> FlowsimResult<Option<Vec<FlowRecord>>> {
        if let Some(page) = self.pages.pop_front() {
            return Ok(Some(page));
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}
