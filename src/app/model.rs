use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::assemble::OutputFormat;

/// Lifecycle of a download task. `Ready` and `Failed` are sticky.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    FetchingMeta,
    FetchingChapters,
    Assembling,
    Ready,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::FetchingMeta => 1,
            Self::FetchingChapters => 2,
            Self::Assembling => 3,
            Self::Ready | Self::Failed => 4,
        }
    }
}

/// One background download job. Owned by its worker; the registry keeps it
/// behind one mutex per task for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub task_id: Uuid,
    pub detail_url: String,
    pub source_id: u32,
    pub format: OutputFormat,
    pub state: TaskState,
    pub total_chapters: u32,
    pub completed_chapters: u32,
    pub failed_chapters: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_chapter_title: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadTask {
    pub fn new(task_id: Uuid, detail_url: String, source_id: u32, format: OutputFormat) -> Self {
        Self {
            task_id,
            detail_url,
            source_id,
            format,
            state: TaskState::Pending,
            total_chapters: 0,
            completed_chapters: 0,
            failed_chapters: 0,
            current_chapter_title: None,
            started_at: Utc::now(),
            finished_at: None,
            artifact_path: None,
            error: None,
        }
    }

    /// Move to a later state. Terminal states are sticky and the lifecycle
    /// never goes backwards; a violating transition is ignored and logged.
    pub fn advance(&mut self, next: TaskState) {
        if self.state.is_terminal() {
            tracing::warn!(task = %self.task_id, ?next, current = ?self.state, "ignored transition out of terminal state");
            return;
        }
        if next.rank() < self.state.rank() {
            tracing::warn!(task = %self.task_id, ?next, current = ?self.state, "ignored backwards transition");
            return;
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.error = Some(reason.into());
        self.advance(TaskState::Failed);
    }

    pub fn progress_percentage(&self) -> u32 {
        match self.state {
            TaskState::Ready => 100,
            _ if self.total_chapters == 0 => 0,
            _ => {
                let done = self.completed_chapters + self.failed_chapters;
                (done * 100 / self.total_chapters).min(99)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DownloadTask {
        DownloadTask::new(
            Uuid::new_v4(),
            "http://s/book/1".to_string(),
            1,
            OutputFormat::Txt,
        )
    }

    #[test]
    fn lifecycle_advances_forward() {
        let mut t = task();
        t.advance(TaskState::FetchingMeta);
        t.advance(TaskState::FetchingChapters);
        t.advance(TaskState::Assembling);
        t.advance(TaskState::Ready);
        assert_eq!(t.state, TaskState::Ready);
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut t = task();
        t.fail("toc empty");
        assert_eq!(t.state, TaskState::Failed);
        t.advance(TaskState::Ready);
        assert_eq!(t.state, TaskState::Failed);
        assert_eq!(t.error.as_deref(), Some("toc empty"));
    }

    #[test]
    fn no_backwards_transitions() {
        let mut t = task();
        t.advance(TaskState::Assembling);
        t.advance(TaskState::FetchingMeta);
        assert_eq!(t.state, TaskState::Assembling);
    }

    #[test]
    fn progress_percentage_caps_below_ready() {
        let mut t = task();
        assert_eq!(t.progress_percentage(), 0);
        t.total_chapters = 50;
        t.completed_chapters = 48;
        t.failed_chapters = 2;
        t.advance(TaskState::FetchingChapters);
        assert_eq!(t.progress_percentage(), 99);
        t.advance(TaskState::Assembling);
        t.advance(TaskState::Ready);
        assert_eq!(t.progress_percentage(), 100);
    }
}
