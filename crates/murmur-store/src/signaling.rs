//! Signaling channel adapter.
//!
//! [`SignalingStore`] is the thin seam between call orchestration and the
//! external, eventually-consistent document store that carries call records
//! between the two parties. Every subscription is push-based and cancelled
//! by dropping the returned [`Subscription`].

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use murmur_shared::{CallId, CallRecord, CallRole, NewCallRecord, RecordUpdate, UserId};

use crate::error::{Result, StoreError};

#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Create a `ringing` record with empty candidate lists and a
    /// server-assigned timestamp.
    async fn create_record(&self, new: NewCallRecord) -> Result<CallId>;

    /// Merge `update` into an existing record. Candidate appends are atomic
    /// so both parties can write concurrently without losing entries.
    async fn update_record(&self, id: &CallId, update: RecordUpdate) -> Result<()>;

    /// [`update_record`](Self::update_record) on behalf of one party. Fields
    /// owned by the other party are refused before anything is written.
    async fn update_as(&self, role: CallRole, id: &CallId, update: RecordUpdate) -> Result<()> {
        if !update.permitted_for(role) {
            return Err(StoreError::NotPermitted {
                role,
                fields: format!("{:?}", update.fields()),
            });
        }
        self.update_record(id, update).await
    }

    /// Every snapshot of one record, starting with the current value.
    /// `None` means the record does not exist (or was deleted).
    async fn subscribe(&self, id: &CallId) -> Result<Subscription<Option<CallRecord>>>;

    /// Live set of `ringing` records addressed to `user`, newest first.
    async fn subscribe_incoming(&self, user: &UserId) -> Result<Subscription<Vec<CallRecord>>>;

    /// All records involving `user`, newest first.
    async fn subscribe_history(&self, user: &UserId) -> Result<Subscription<Vec<CallRecord>>>;
}

/// Receiving end of a store subscription.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) cancels delivery.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Create a connected sender/subscription pair.
    pub fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next delivery. `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a delivery that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
