//! Workflow notifications
//!
//! Transitions produce [`Notification`]s; they are handed to a [`Notifier`]
//! only after the transaction committed, on a detached task. Failures are
//! logged and never reach the caller.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::AppResult;

/// Event codes understood by the notification templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventCode {
    /// New request waiting for technical staff
    NewForTechnical,
    /// New request waiting for quality
    NewForQuality,
    /// Confirmation to the requester
    Received,
    InReview,
    /// Forwarded to quality by technical staff
    Derived,
    RejectedTechnical,
    Approved,
    Rejected,
    /// Handed back to technical staff for execution
    PendingTechnical,
    ItemProcessed,
}

impl EventCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCode::NewForTechnical => "EQUIPO_SOLICITUD_NUEVA_TECNICA",
            EventCode::NewForQuality => "EQUIPO_SOLICITUD_NUEVA_CALIDAD",
            EventCode::Received => "EQUIPO_SOLICITUD_RECIBIDA",
            EventCode::InReview => "EQUIPO_SOLICITUD_EN_REVISION",
            EventCode::Derived => "EQUIPO_SOLICITUD_DERIVADA",
            EventCode::RejectedTechnical => "EQUIPO_SOLICITUD_RECHAZADA_TECNICA",
            EventCode::Approved => "EQUIPO_SOLICITUD_APROBADA",
            EventCode::Rejected => "EQUIPO_SOLICITUD_RECHAZADA",
            EventCode::PendingTechnical => "EQUIPO_SOLICITUD_PENDIENTE_TECNICA",
            EventCode::ItemProcessed => "EQUIPO_SOLICITUD_ITEM_PROCESADO",
        }
    }
}

impl std::fmt::Display for EventCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event: EventCode,
    pub context: Value,
}

impl Notification {
    pub fn new(event: EventCode, context: Value) -> Self {
        Self { event, context }
    }
}

/// Outbound notification trigger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: EventCode, context: Value) -> AppResult<()>;
}

/// Writes notifications to the log
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: EventCode, context: Value) -> AppResult<()> {
        tracing::info!(event = %event, context = %context, "Notification triggered");
        Ok(())
    }
}

/// Drops every notification (notifications disabled)
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: EventCode, _context: Value) -> AppResult<()> {
        Ok(())
    }
}

/// Send notifications in order on a detached task
pub fn dispatch(
    notifier: Arc<dyn Notifier>,
    notifications: Vec<Notification>,
) -> Option<tokio::task::JoinHandle<()>> {
    if notifications.is_empty() {
        return None;
    }
    Some(tokio::spawn(async move {
        for notification in notifications {
            let event = notification.event;
            if let Err(e) = notifier.notify(event, notification.context).await {
                tracing::warn!(event = %event, "Notification failed: {}", e);
            }
        }
    }))
}
