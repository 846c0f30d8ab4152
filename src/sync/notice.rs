use time::OffsetDateTime;

use crate::model::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A dismissible, toast-style message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub severity: Severity,
    pub message: String,
    pub target: Option<EntityId>,
    pub raised_at: OffsetDateTime,
}

#[derive(Debug, Default)]
pub struct NoticeBoard {
    next_id: u64,
    notices: Vec<Notice>,
}

impl NoticeBoard {
    pub fn raise<S: Into<String>>(
        &mut self,
        severity: Severity,
        target: Option<EntityId>,
        message: S,
    ) -> u64 {
        self.next_id += 1;
        let notice = Notice {
            id: self.next_id,
            severity,
            message: message.into(),
            target,
            raised_at: OffsetDateTime::now_utc(),
        };
        match severity {
            Severity::Info => tracing::info!(notice = %notice.message, "notice raised"),
            Severity::Warning => tracing::warn!(notice = %notice.message, "notice raised"),
            Severity::Error => tracing::error!(notice = %notice.message, "notice raised"),
        }
        self.notices.push(notice);
        self.next_id
    }

    pub fn all(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.notices.len();
        self.notices.retain(|notice| notice.id != id);
        before != self.notices.len()
    }
}
