//! Per-(timeframe, link) dataset.

use flux_common::consts::UNDEFINED_TIMEFRAME_ID;
use flux_memory::PageRef;

use crate::error::DispatchError;

/// Ordered pages sharing one `(equipment, link, timeframe)` triple, in
/// source-page order.
#[derive(Debug, Default)]
pub struct DataSet {
    pub pages: Vec<PageRef>,
}

impl DataSet {
    pub fn new(pages: Vec<PageRef>) -> Self {
        Self { pages }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Timeframe id of the first page.
    pub fn timeframe_id(&self) -> u64 {
        self.pages
            .first()
            .map_or(UNDEFINED_TIMEFRAME_ID, |p| p.header().timeframe_id)
    }

    /// Link id of the first page.
    pub fn link_id(&self) -> u8 {
        self.pages.first().map_or(0, |p| p.header().link_id)
    }

    /// Whether any page carries the end-of-timeframe flag.
    pub fn end_of_timeframe(&self) -> bool {
        self.pages.iter().any(|p| p.header().end_of_timeframe())
    }

    /// All pages of a dataset must belong to the same timeframe; a
    /// violating dataset is rejected, not processed.
    pub fn check_single_timeframe(&self) -> Result<(), DispatchError> {
        let (Some(first), Some(last)) = (self.pages.first(), self.pages.last()) else {
            return Ok(());
        };
        let (first, last) = (first.header().timeframe_id, last.header().timeframe_id);
        if first != last {
            return Err(DispatchError::MixedTimeframes { first, last });
        }
        Ok(())
    }
}
