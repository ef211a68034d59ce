//! Channel handles over the realtime socket. A handle is an owned,
//! lifecycle-scoped resource: dropping it leaves the topic.

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use super::protocol::{
    ChangeData, JoinConfig, PostgresChangeFilter, PresenceDiff, PresenceState, EVENT_BROADCAST,
    EVENT_PRESENCE,
};
use super::socket::SocketCommand;
use crate::backend::BackendError;

/// Events delivered to a subscribed channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    PresenceState(PresenceState),
    PresenceDiff(PresenceDiff),
    PostgresChange(ChangeData),
    Broadcast { event: String, payload: Value },
    Closed,
}

pub struct ChannelBuilder {
    cmd_tx: mpsc::Sender<SocketCommand>,
    topic: String,
    config: JoinConfig,
    buffer: usize,
}

impl ChannelBuilder {
    pub(super) fn new(cmd_tx: mpsc::Sender<SocketCommand>, topic: String, buffer: usize) -> Self {
        Self {
            cmd_tx,
            topic,
            config: JoinConfig::default(),
            buffer,
        }
    }

    /// Key our own presence entries on this channel.
    pub fn presence_key(mut self, key: &str) -> Self {
        self.config.presence.key = key.to_string();
        self
    }

    /// Echo our own broadcasts back to us.
    pub fn broadcast_echo(mut self) -> Self {
        self.config.broadcast.echo = true;
        self
    }

    pub fn on_postgres_changes(mut self, filter: PostgresChangeFilter) -> Self {
        self.config.postgres_changes.push(filter);
        self
    }

    /// Join the topic. Resolves once the server acknowledges the join.
    pub async fn subscribe(self) -> Result<Channel, BackendError> {
        let Self {
            cmd_tx,
            topic,
            config,
            buffer,
        } = self;
        let (events_tx, events) = mpsc::channel(buffer);
        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(SocketCommand::Join {
                topic: topic.clone(),
                config,
                events: events_tx,
                done: done_tx,
            })
            .await
            .map_err(|_| BackendError::SocketClosed)?;
        done_rx.await.map_err(|_| BackendError::SocketClosed)??;
        Ok(Channel {
            topic,
            cmd_tx,
            events,
        })
    }
}

/// Live subscription to one topic.
pub struct Channel {
    topic: String,
    cmd_tx: mpsc::Sender<SocketCommand>,
    events: mpsc::Receiver<ChannelEvent>,
}

impl Channel {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event on this channel; `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Publish our presence payload on this topic.
    pub async fn track(&self, payload: Value) -> Result<(), BackendError> {
        self.push(
            EVENT_PRESENCE,
            json!({ "type": "presence", "event": "track", "payload": payload }),
        )
        .await
    }

    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<(), BackendError> {
        self.push(
            EVENT_BROADCAST,
            json!({ "type": "broadcast", "event": event, "payload": payload }),
        )
        .await
    }

    async fn push(&self, event: &str, payload: Value) -> Result<(), BackendError> {
        self.cmd_tx
            .send(SocketCommand::Push {
                topic: self.topic.clone(),
                event: event.to_string(),
                payload,
            })
            .await
            .map_err(|_| BackendError::SocketClosed)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(SocketCommand::Leave {
            topic: self.topic.clone(),
        });
    }
}

#[cfg(test)]
impl Channel {
    /// Detached handle for driving subscriber loops without a socket.
    /// Feed events through the returned sender; pushes and the leave on
    /// drop show up on the command receiver.
    pub(crate) fn test_rig(
        topic: &str,
    ) -> (
        Self,
        mpsc::Sender<ChannelEvent>,
        mpsc::Receiver<SocketCommand>,
    ) {
        let (events_tx, events) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        (
            Self {
                topic: format!("realtime:{topic}"),
                cmd_tx,
                events,
            },
            events_tx,
            cmd_rx,
        )
    }
}
