//! Wires the bridge components together and owns their lifetime.
//!
//! Task layout:
//! - event adapter: driver notifications -> state store -> publish queue
//! - issue worker: dispatcher -> driver
//! - timeout driver: dispatcher retries and failures
//! - outcome reporter: command events -> log and result topics
//! - mesh and MQTT supervisors: connection health and reconnects
//! - publish worker and inbound consumer: the broker connection itself
//!
//! All of them stop on the shared cancellation token.

use crate::config::Config;
use crate::dispatch::{
    CommandDispatcher, CommandEvent, CommandOutcome, DispatcherConfig, IssueRequest,
    run_issue_worker,
};
use crate::error::{BridgeError, Result};
use crate::mqtt::{MqttClient, MqttMessage, Publication, Publisher, run_publish_worker};
use crate::reconnect::{ReconnectManager, SessionSignal};
use crate::state::StateStore;
use crate::topic::TopicMapper;
use crate::zwave::{MeshSession, NetworkEventAdapter, Notification, ZWaveDriver};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct BridgeCore {
    config: Config,
    store: Arc<StateStore>,
    mapper: TopicMapper,
    dispatcher: Arc<CommandDispatcher>,
    reconnect: Arc<ReconnectManager>,
    session: Arc<MeshSession>,
    publisher: Publisher,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
    cancel: CancellationToken,

    publish_rx: Option<mpsc::Receiver<Publication>>,
    notify_rx: Option<mpsc::Receiver<Notification>>,
    issue_rx: Option<mpsc::UnboundedReceiver<IssueRequest>>,
    events_rx: Option<mpsc::UnboundedReceiver<CommandEvent>>,
    signal_rx: Option<mpsc::UnboundedReceiver<SessionSignal>>,

    tasks: Vec<JoinHandle<()>>,
    mesh_task: Option<JoinHandle<Result<()>>>,
}

impl BridgeCore {
    pub fn new(config: Config, driver: Arc<dyn ZWaveDriver>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(StateStore::new());
        let mapper = TopicMapper::new(config.bridge.topic_prefix.as_str());
        let (issue_tx, issue_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(CommandDispatcher::new(
            DispatcherConfig::from(&config.bridge),
            mapper.clone(),
            store.clone(),
            issue_tx,
            events_tx,
        ));

        let (publisher, publish_rx) = Publisher::channel(config.bridge.publish_queue_capacity);
        let (notify_tx, notify_rx) = mpsc::channel(config.bridge.event_queue_capacity);
        let session = Arc::new(MeshSession::new(
            driver,
            config.zwave.device.as_str(),
            notify_tx,
        ));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let reconnect = Arc::new(ReconnectManager::new(
            &config.reconnect,
            Duration::from_secs(config.bridge.reconnect_grace_secs),
            store.clone(),
            mapper.clone(),
            dispatcher.clone(),
            publisher.clone(),
            session.clone(),
        ));

        Ok(Self {
            config,
            store,
            mapper,
            dispatcher,
            reconnect,
            session,
            publisher,
            signal_tx,
            cancel: CancellationToken::new(),
            publish_rx: Some(publish_rx),
            notify_rx: Some(notify_rx),
            issue_rx: Some(issue_rx),
            events_rx: Some(events_rx),
            signal_rx: Some(signal_rx),
            tasks: Vec::new(),
            mesh_task: None,
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn session(&self) -> &Arc<MeshSession> {
        &self.session
    }

    pub fn mapper(&self) -> &TopicMapper {
        &self.mapper
    }

    /// Token that stops every bridge task when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask a running bridge to stop. The MQTT supervisor publishes
    /// `offline` on the bridge status topic and the mesh supervisor closes
    /// the driver before `run` returns.
    pub fn shutdown(&self) {
        info!("[MQTT] Shutdown requested");
        self.cancel.cancel();
    }

    /// Start the mesh-network side: adapter, command pipeline and the mesh
    /// supervisor. Does nothing if already started.
    pub fn start_mesh(&mut self) {
        let (Some(notify_rx), Some(issue_rx), Some(events_rx), Some(signal_rx)) = (
            self.notify_rx.take(),
            self.issue_rx.take(),
            self.events_rx.take(),
            self.signal_rx.take(),
        ) else {
            debug!("[ZWave] Mesh side already started");
            return;
        };

        let adapter = NetworkEventAdapter::new(
            self.store.clone(),
            self.mapper.clone(),
            self.dispatcher.clone(),
            self.publisher.clone(),
            self.session.clone(),
            self.signal_tx.clone(),
        );
        self.tasks
            .push(tokio::spawn(adapter.run(notify_rx, self.cancel.clone())));

        let session = self.session.clone();
        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = run_issue_worker(session, dispatcher, issue_rx) => {}
            }
        }));

        self.tasks.push(tokio::spawn(
            self.dispatcher.clone().run_timeouts(self.cancel.clone()),
        ));

        self.tasks.push(tokio::spawn(report_outcomes(
            events_rx,
            self.mapper.clone(),
            self.publisher.clone(),
            self.config.bridge.publish_command_results,
            self.cancel.clone(),
        )));

        self.mesh_task = Some(tokio::spawn(
            self.reconnect
                .clone()
                .supervise_mesh(signal_rx, self.cancel.clone()),
        ));
    }

    /// Run the bridge until cancelled or a session gives up reconnecting.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "[MQTT] Connecting to {}:{} as {}",
            self.config.mqtt.broker_host, self.config.mqtt.broker_port, self.config.mqtt.client_id
        );
        let mqtt = MqttClient::new(&self.config.mqtt, &self.mapper.bridge_status_topic());
        let publish_rx = self
            .publish_rx
            .take()
            .ok_or(BridgeError::ChannelClosed("publish queue"))?;
        let client = mqtt.client();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = run_publish_worker(client, publish_rx) => {}
            }
        }));

        let (message_tx, message_rx) = mpsc::channel(self.config.bridge.event_queue_capacity);
        self.tasks.push(tokio::spawn(consume_commands(
            message_rx,
            self.dispatcher.clone(),
        )));

        self.start_mesh();
        let mqtt_task = tokio::spawn(
            self.reconnect
                .clone()
                .supervise_mqtt(mqtt, message_tx, self.cancel.clone()),
        );
        let mesh_task = self
            .mesh_task
            .take()
            .ok_or(BridgeError::ChannelClosed("mesh supervisor"))?;

        info!(
            "[MQTT] Bridge running, commands on {}",
            self.mapper.command_filter()
        );

        // Whichever supervisor ends first takes the other down with it.
        let cancel = self.cancel.clone();
        let (mesh_result, mqtt_result) = tokio::join!(
            supervised(mesh_task, cancel.clone()),
            supervised(mqtt_task, cancel),
        );

        self.finish().await;
        mesh_result.and(mqtt_result)
    }

    async fn finish(&mut self) {
        self.shutdown();
        if let Some(task) = self.mesh_task.take()
            && let Ok(Err(e)) = task.await
        {
            warn!("[ZWave] Mesh supervisor stopped with error: {}", e);
        }
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(3), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[MQTT] Bridge task ended abnormally: {}", e),
                Err(_) => warn!("[MQTT] Bridge task did not stop in time"),
            }
        }
        info!(
            "[MQTT] Bridge stopped ({} publishes dropped)",
            self.publisher.dropped()
        );
    }
}

async fn supervised(task: JoinHandle<Result<()>>, cancel: CancellationToken) -> Result<()> {
    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(BridgeError::TaskFailed(e.to_string())),
    };
    if let Err(e) = &result {
        error!("[Reconnect] {}", e);
    }
    cancel.cancel();
    result
}

async fn consume_commands(
    mut messages: mpsc::Receiver<MqttMessage>,
    dispatcher: Arc<CommandDispatcher>,
) {
    while let Some(message) = messages.recv().await {
        let submission = dispatcher.submit(&message.topic, &message.payload);
        debug!("[Dispatch] {} -> {:?}", message.topic, submission);
    }
}

/// Log every terminal command outcome and optionally publish it.
async fn report_outcomes(
    mut events: mpsc::UnboundedReceiver<CommandEvent>,
    mapper: TopicMapper,
    publisher: Publisher,
    publish_results: bool,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event.outcome {
            CommandOutcome::Confirmed => info!(
                "[Dispatch] {} {} confirmed",
                event.value_id, event.correlation
            ),
            CommandOutcome::Rejected(e) => {
                warn!("[Dispatch] {} {} rejected: {}", event.value_id, event.correlation, e)
            }
            CommandOutcome::Failed(e) => {
                warn!("[Dispatch] {} {} failed: {}", event.value_id, event.correlation, e)
            }
        }

        if publish_results {
            publisher.publish(Publication::transient(
                mapper.result_topic(&event.value_id),
                event.to_payload(),
            ));
        }
    }
}
