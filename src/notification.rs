//! User-facing notifications
//!
//! Fire-and-forget: a notifier never fails the operation that triggered it.
//! The front-end injects its own toast implementation; the CLI logs.

use serde::Serialize;

use crate::error::{CrmError, UserFacingError};

const MAX_BODY_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// Sink for success / info / error messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, title: &str, body: &str);

    fn success(&self, title: &str, body: &str) {
        self.notify(NoticeLevel::Success, title, body);
    }

    fn info(&self, title: &str, body: &str) {
        self.notify(NoticeLevel::Info, title, body);
    }

    fn error(&self, title: &str, body: &str) {
        self.notify(NoticeLevel::Error, title, body);
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, title: &str, body: &str) {
        match level {
            NoticeLevel::Error => log::error!("{}: {}", title, body),
            _ => log::info!("{}: {}", title, body),
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() > MAX_BODY_CHARS {
        let cut: String = body.chars().take(MAX_BODY_CHARS).collect();
        format!("{}...", cut)
    } else {
        body.to_string()
    }
}

/// Success notification for a finished bulk action.
pub fn notify_bulk_complete(notifier: &dyn Notifier, action: &str, collection: &str, affected: usize) {
    let title = match action {
        "delete" => "Records deleted",
        "update" => "Records updated",
        _ => "Bulk action complete",
    };
    let body = format!("{} {} {}.", affected, collection, past_tense(action));
    notifier.success(title, &body);
}

fn past_tense(action: &str) -> &'static str {
    match action {
        "delete" => "deleted",
        "update" => "updated",
        "import" => "imported",
        _ => "processed",
    }
}

/// Error notification for a failed operation, with its recovery hint.
pub fn notify_failure(notifier: &dyn Notifier, action: &str, err: &CrmError) {
    let facing = UserFacingError::from(err);
    let title = format!("{} failed", capitalize(action));
    let body = format!("{} {}", facing.message, facing.recovery_suggestion);
    notifier.error(&title, &truncate_body(&body));
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
