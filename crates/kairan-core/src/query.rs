//! Read-side types: listing filters, pagination and status counts.
use serde::Serialize;

use crate::job::{Job, JobStatus, RequestType, UserId};

/// Column a listing is ordered by. Ties are always broken by job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    ProcessedAt,
    Attempts,
}

impl std::str::FromStr for SortField {
    type Err = crate::job::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(SortField::CreatedAt),
            "processed_at" => Ok(SortField::ProcessedAt),
            "attempts" => Ok(SortField::Attempts),
            other => Err(crate::job::ParseEnumError::new("sort field", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = crate::job::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(crate::job::ParseEnumError::new("sort order", other)),
        }
    }
}

/// Conjunctive filter; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub request_type: Option<RequestType>,
    pub user_id: Option<UserId>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
            && self
                .request_type
                .is_none_or(|request_type| job.request_type == request_type)
            && self.user_id.is_none_or(|user_id| job.user_id == Some(user_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Options to list jobs with offset pagination.
pub struct ListJobsOptions {
    pub filter: JobFilter,
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    /// Clamped to `1..=MAX_PAGE_SIZE`.
    pub page_size: u32,
    pub sort: SortField,
    pub order: SortOrder,
}

impl ListJobsOptions {
    pub const DEFAULT_PAGE_SIZE: u32 = 20;
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.clamp(1, Self::MAX_PAGE_SIZE)
    }

    /// Rows to skip before the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.page_size())
    }
}

impl Default for ListJobsOptions {
    fn default() -> Self {
        Self {
            filter: JobFilter::default(),
            page: 1,
            page_size: Self::DEFAULT_PAGE_SIZE,
            sort: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

/// One page of results plus the metadata needed to render pagination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, options: &ListJobsOptions) -> Self {
        let page_size = options.page_size();
        let total_pages = total.div_ceil(u64::from(page_size));
        Self {
            items,
            total,
            page: options.page(),
            page_size,
            total_pages: u32::try_from(total_pages).unwrap_or(u32::MAX),
        }
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Aggregate counts of jobs by status.
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dead_letter: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
            JobStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += count;
        self.total += count;
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
            JobStatus::DeadLetter => self.dead_letter,
        }
    }
}

impl FromIterator<(JobStatus, u64)> for QueueStats {
    fn from_iter<I: IntoIterator<Item = (JobStatus, u64)>>(iter: I) -> Self {
        let mut stats = QueueStats::default();
        for (status, count) in iter {
            stats.record(status, count);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_size_are_normalized() {
        let options = ListJobsOptions {
            page: 0,
            page_size: 10_000,
            ..Default::default()
        };
        assert_eq!(options.page(), 1);
        assert_eq!(options.page_size(), ListJobsOptions::MAX_PAGE_SIZE);
        assert_eq!(options.offset(), 0);

        let third = ListJobsOptions {
            page: 3,
            page_size: 25,
            ..Default::default()
        };
        assert_eq!(third.offset(), 50);
    }

    #[test]
    fn total_pages_rounds_up() {
        let options = ListJobsOptions {
            page_size: 20,
            ..Default::default()
        };
        let page = Page::new(vec![(); 20], 41, &options);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next());

        let empty = Page::<()>::new(Vec::new(), 0, &options);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next());
    }

    #[test]
    fn stats_total_is_sum_of_statuses() {
        let stats: QueueStats = [
            (JobStatus::Pending, 4),
            (JobStatus::Completed, 2),
            (JobStatus::DeadLetter, 1),
        ]
        .into_iter()
        .collect();
        assert_eq!(stats.total, 7);
        assert_eq!(stats.count(JobStatus::Pending), 4);
        assert_eq!(stats.count(JobStatus::Failed), 0);
    }
}
