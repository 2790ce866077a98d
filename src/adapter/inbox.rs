//! Request inboxes
//!
//! A request listens for its reply on a throwaway subject
//! `_INBOX.<unique-id>`. The id comes from an `IdGenerator` (v4 UUIDs by
//! default). The inbox is not stored for replay: it is released on the first
//! reply or when the request times out, whichever comes first.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::debug;
use uuid::Uuid;

use crate::transport::{BrokerClient, SubscriptionId};
use crate::utils::error::BoxError;
use crate::utils::lock;

pub const INBOX_PREFIX: &str = "_INBOX";

/// Source of the unique part of inbox subjects.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String, BoxError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> Result<String, BoxError> {
        Ok(Uuid::new_v4().to_string())
    }
}

pub fn inbox_subject(id: &str) -> String {
    format!("{INBOX_PREFIX}.{id}")
}

pub type ReplyCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

/// One outstanding request: its callback runs at most once.
pub(crate) struct PendingRequest<C: BrokerClient> {
    inbox: String,
    client: Weak<C>,
    sid: OnceLock<SubscriptionId>,
    callback: Mutex<Option<ReplyCallback>>,
}

impl<C: BrokerClient> PendingRequest<C> {
    pub(crate) fn new(inbox: &str, client: &Arc<C>, callback: ReplyCallback) -> Arc<Self> {
        Arc::new(Self {
            inbox: inbox.to_string(),
            client: Arc::downgrade(client),
            sid: OnceLock::new(),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub(crate) fn bind(&self, sid: SubscriptionId) {
        let _ = self.sid.set(sid);
    }

    /// Take the callback and release the inbox. `None` once finished.
    pub(crate) fn finish(&self) -> Option<ReplyCallback> {
        let callback = lock(&self.callback).take()?;

        if let (Some(sid), Some(client)) = (self.sid.get(), self.client.upgrade()) {
            if let Err(e) = client.unsubscribe(*sid) {
                debug!(inbox = %self.inbox, error = %e, "failed to release inbox");
            }
        }
        Some(callback)
    }

    pub(crate) async fn expire_after(self: Arc<Self>, timeout: std::time::Duration) {
        tokio::time::sleep(timeout).await;
        if self.finish().is_some() {
            debug!(inbox = %self.inbox, ?timeout, "request timed out; inbox released");
        }
    }
}
