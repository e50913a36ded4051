//! Live notification fan-out and the durable notification log.
//!
//! Live delivery is best-effort over per-owner broadcast channels; the
//! durable record is written unconditionally. The stored image bytes are
//! recovered from the payload's base64 field rather than taken from the
//! source buffer, so the wire encoding and the audit record can never
//! drift apart.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Local};
use facewatch_store::{FaceStore, NotificationRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::recorder::LAST_SEEN_FMT;
use crate::PipelineError;

// Lagging subscribers lose old events, never block the pipeline.
const CHANNEL_CAPACITY: usize = 16;

/// Payload delivered to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveNotification {
    pub alias: String,
    pub camera: String,
    /// Detection time formatted for display, e.g. "03:41 PM".
    pub detected_at: String,
    /// Base64-encoded JPEG of the face exemplar.
    pub image: String,
}

/// Per-owner broadcast channels. Cheap to clone behind an `Arc`; channels
/// are created lazily on first subscribe or publish.
#[derive(Default)]
pub struct NotificationHub {
    channels: Mutex<HashMap<i64, broadcast::Sender<LiveNotification>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, owner_id: i64) -> broadcast::Receiver<LiveNotification> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to the owner's channel. Returns the number of live
    /// subscribers that received the event.
    pub fn publish(&self, owner_id: i64, event: LiveNotification) -> usize {
        let channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match channels.get(&owner_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }
}

/// Dispatches one detection event to the live channel and the durable log.
pub struct Notifier {
    hub: Arc<NotificationHub>,
    store: Arc<FaceStore>,
    camera: String,
}

impl Notifier {
    pub fn new(hub: Arc<NotificationHub>, store: Arc<FaceStore>, camera: String) -> Self {
        Self { hub, store, camera }
    }

    /// Publish the live event, then append the durable record. Absence of
    /// live subscribers is logged, not an error; only a store failure
    /// propagates.
    pub fn notify(
        &self,
        owner_id: i64,
        alias: &str,
        detected_at: DateTime<Local>,
        image: &[u8],
    ) -> Result<(), PipelineError> {
        let encoded = BASE64.encode(image);
        let event = LiveNotification {
            alias: alias.to_string(),
            camera: self.camera.clone(),
            detected_at: detected_at.format(LAST_SEEN_FMT).to_string(),
            image: encoded.clone(),
        };

        let receivers = self.hub.publish(owner_id, event);
        let delivered = receivers > 0;
        if delivered {
            tracing::debug!(owner_id, alias, receivers, "notification delivered");
        } else {
            tracing::debug!(owner_id, alias, "no live subscribers, durable record only");
        }

        // Decode the wire encoding back to bytes for storage; the stored
        // image is bit-exact with what subscribers received.
        let stored = BASE64.decode(encoded.as_bytes())?;
        self.store.insert_notification(&NotificationRecord {
            id: 0,
            owner_id,
            alias: alias.to_string(),
            camera: self.camera.clone(),
            detected_at,
            delivered,
            image: stored,
        })?;
        Ok(())
    }
}
