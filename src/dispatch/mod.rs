mod audit;
mod notifier;

pub use audit::{AuditAction, AuditEntry, AuditSink, MemoryAudit};
pub use notifier::{
    LogNotifier, MemoryNotifier, Notification, NotificationKind, Notifier, WebhookNotifier,
};
