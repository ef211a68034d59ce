use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};

use crate::backend::Backend;
use crate::events::EventSender;
use crate::media::{StreamCommand, StreamState};
use crate::models::{ConnectionQuality, NotificationPrefs};
use crate::services::calls::CallWatcherHandle;
use crate::services::presence::PresenceHandle;
use crate::services::viewers::ViewerRegistry;

/// Transport-agnostic context shared by services and API routes.
#[derive(Clone)]
pub struct ServiceContext {
    pub backend: Backend,
    pub presence: PresenceHandle,
    pub viewers: ViewerRegistry,
    pub calls: CallWatcherHandle,
    pub notification_prefs: Arc<TokioMutex<NotificationPrefs>>,
    pub event_tx: EventSender,
    pub media_tx: mpsc::Sender<StreamCommand>,
    pub stream_state_rx: watch::Receiver<StreamState>,
    pub quality_rx: watch::Receiver<Option<ConnectionQuality>>,
}
