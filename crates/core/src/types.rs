/// Status values stored in `urls_frontier.status`. The database holds the
/// uppercase string form so other processes can cooperate on the same tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Scheduled,
    InProgress,
    Done,
    /// Terminal state reserved for operator intervention; the crawler itself
    /// never writes it — failed tasks return to `Scheduled` with backoff.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }
}

/// A leased unit of work handed out by the frontier. The row is
/// `IN_PROGRESS` for as long as the lease is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierTask {
    pub id: i64,
    pub url: String,
    pub source_id: i32,
    pub depth: i32,
    pub priority: i32,
}

/// Why a fetch was abandoned without being treated as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BodyTooLarge,
    NonHtmlContent,
    RedirectLoop,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::BodyTooLarge => "body_too_large",
            SkipReason::NonHtmlContent => "non_html_content",
            SkipReason::RedirectLoop => "redirect_loop",
        }
    }
}

/// Coarse failure classification written to `urls_frontier.error_category`
/// and the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NetworkTimeout,
    ConnectionError,
    DbError,
    ParseError,
    Unexpected,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NetworkTimeout => "network_timeout",
            ErrorCategory::ConnectionError => "connection_error",
            ErrorCategory::DbError => "db_error",
            ErrorCategory::ParseError => "parse_error",
            ErrorCategory::Unexpected => "unexpected",
        }
    }
}

/// Result of one page fetch. Skips and failures are ordinary values here,
/// not errors: the worker loop turns them into `mark_done`/`mark_failed`
/// transitions.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched {
        status: u16,
        body: String,
    },
    Skipped {
        reason: SkipReason,
        status: Option<u16>,
    },
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_schema_values() {
        assert_eq!(TaskStatus::Scheduled.as_str(), "SCHEDULED");
        assert_eq!(TaskStatus::InProgress.as_str(), "IN_PROGRESS");
        assert_eq!(TaskStatus::Done.as_str(), "DONE");
        assert_eq!(TaskStatus::Failed.as_str(), "FAILED");
    }

    #[test]
    fn skip_reasons_are_metric_labels() {
        assert_eq!(SkipReason::BodyTooLarge.as_str(), "body_too_large");
        assert_eq!(SkipReason::NonHtmlContent.as_str(), "non_html_content");
        assert_eq!(SkipReason::RedirectLoop.as_str(), "redirect_loop");
    }
}
