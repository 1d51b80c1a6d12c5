//! # murmur-client
//!
//! One-to-one voice calls between signed-in users. Signaling goes through a
//! shared document store, media flows peer to peer over WebRTC.
//!
//! [`CallSessionManager`] is the entry point: it places, answers and ends
//! calls, watches for incoming ones and keeps the call history.

pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod incoming;
pub mod notify;
pub mod session;
pub mod timer;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use murmur_media::{AudioConfig, WebRtcBackend};
use murmur_shared::Profile;
use murmur_store::{Database, SignalingStore};

pub use config::CallConfig;
pub use error::CallError;
pub use events::{CallEvent, CallSessionView, SessionStatus};
pub use history::{CallHistoryRecorder, HistoryFeed};
pub use incoming::{IncomingCall, IncomingCallWatcher};
pub use notify::{LogNotifier, Notifier, NotifyError};
pub use session::CallSessionManager;
pub use timer::CallTimer;

/// Install the global log subscriber. `RUST_LOG` overrides the defaults.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("murmur_client=debug,murmur_media=info,murmur_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Build a manager for `local` on the real audio devices and WebRTC stack,
/// with the call history in the default on-disk database.
pub fn connect(
    local: Profile,
    store: Arc<dyn SignalingStore>,
    notifier: Arc<dyn Notifier>,
    config: CallConfig,
) -> Result<CallSessionManager, CallError> {
    let db = Database::new()?;
    let history = CallHistoryRecorder::new(db, store.clone(), local.id.clone());
    let media = WebRtcBackend::new(config.ice_servers(), AudioConfig::default());

    tracing::info!(
        user = %local.id.short(),
        ice_servers = config.ice_urls.len(),
        "Call client ready"
    );
    Ok(CallSessionManager::new(
        local,
        store,
        Arc::new(media),
        history,
        notifier,
        config,
    ))
}
