/// Session: wires transport, multiplexer, stores and polling for one
/// logged-in viewer
///
/// Created at login with [`Session::start`] and destroyed at logout with
/// [`Session::teardown`]. Nothing it spawns outlives the teardown, or the
/// session itself when it is dropped without one.
use crate::config::Config;
use crate::conversation_store::ConversationStore;
use crate::error::Result;
use crate::events::{EventBus, StoreEvent};
use crate::multiplexer::{Subscription, TopicMultiplexer};
use crate::notification_store::NotificationStore;
use crate::polling::PollingFallback;
use crate::rest::RestApi;
use crate::transport::{ConnectionManager, ConnectionState, Connector};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Session {
    config: Config,
    events: EventBus,
    connection: ConnectionManager,
    notifications: NotificationStore,
    conversations: ConversationStore,
    subscriptions: Vec<Subscription>,
    polling: Option<PollingFallback>,
    state_forwarder: JoinHandle<()>,
}

impl Session {
    /// Connect the push channel, load both stores and start polling.
    ///
    /// Initial load failures are recorded in the stores' `last_error`; the
    /// session still starts and converges through polling and reloads.
    pub async fn start(config: Config, rest: Arc<dyn RestApi>, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let viewer = config.viewer();
        info!("Starting session for {} {}", viewer.role, viewer.id);

        let events = EventBus::new(config.event_capacity);
        let multiplexer = TopicMultiplexer::new();
        let connection = ConnectionManager::new(
            connector,
            multiplexer.clone(),
            config.reconnect_policy(),
            config.connect_timeout,
        );
        let notifications = NotificationStore::new(rest.clone(), events.clone());
        let conversations = ConversationStore::with_watcher(
            rest.clone(),
            events.clone(),
            viewer.clone(),
            config.echo_match_window,
            Arc::new(connection.clone()),
        );

        let mut subscriptions = notifications.attach(&multiplexer);
        subscriptions.push(conversations.attach(&multiplexer));

        let state_forwarder = tokio::spawn(forward_connection_state(
            connection.clone(),
            events.clone(),
            notifications.clone(),
            conversations.clone(),
        ));

        connection.connect(viewer.id.clone());

        if let Err(e) = notifications.load(&viewer.id).await {
            warn!("Initial notification load failed: {}", e);
        }
        if let Err(e) = conversations.load_conversations().await {
            warn!("Initial conversation load failed: {}", e);
        }

        let polling = PollingFallback::start(notifications.clone(), rest, config.poll_interval);

        Ok(Self {
            config,
            events,
            connection,
            notifications,
            conversations,
            subscriptions,
            polling: Some(polling),
            state_forwarder,
        })
    }

    /// Stop polling, close the push channel and drop every subscription.
    pub async fn teardown(mut self) {
        if let Some(polling) = self.polling.take() {
            polling.stop().await;
        }
        self.connection.disconnect().await;
        self.subscriptions.clear();
        self.state_forwarder.abort();
        info!("Session for user {} closed", self.config.user_id);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.notifications
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropped without teardown
        if self.polling.take().is_some() {
            self.connection.abort();
        }
        self.state_forwarder.abort();
    }
}

/// Republish connection state as store events and resync after a reconnect.
async fn forward_connection_state(
    connection: ConnectionManager,
    events: EventBus,
    notifications: NotificationStore,
    conversations: ConversationStore,
) {
    let mut state_rx = connection.subscribe_state();
    let mut was_connected = false;
    while state_rx.changed().await.is_ok() {
        let state = *state_rx.borrow_and_update();
        events.emit(StoreEvent::ConnectionChanged { state });

        match state {
            ConnectionState::Connected if was_connected => {
                info!("Push channel back, resyncing stores");
                // Pushes sent while the link was down are gone
                if let Some(user_id) = notifications.user_id() {
                    if let Err(e) = notifications.load(&user_id).await {
                        warn!("Resync of notifications failed: {}", e);
                    }
                }
                if let Some(active) = conversations.active_conversation() {
                    if let Err(e) = conversations.load_messages(&active).await {
                        warn!("Resync of conversation {} failed: {}", active, e);
                    }
                }
            }
            ConnectionState::Connected => was_connected = true,
            ConnectionState::Unavailable => {
                warn!("Push channel unavailable, relying on polling");
            }
            _ => {}
        }
    }
}
