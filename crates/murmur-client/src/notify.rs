//! Best-effort alerts for incoming calls when the app is not focused.

use thiserror::Error;
use tracing::info;

use crate::incoming::IncomingCall;

#[derive(Error, Debug)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

pub trait Notifier: Send + Sync {
    fn notify_incoming_call(&self, call: &IncomingCall) -> Result<(), NotifyError>;
}

/// Writes the alert to the log. Used when no desktop notifier is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_incoming_call(&self, call: &IncomingCall) -> Result<(), NotifyError> {
        info!(
            call_id = %call.call_id,
            caller = %call.caller.id.short(),
            name = %call.caller.name,
            "Incoming call"
        );
        Ok(())
    }
}
