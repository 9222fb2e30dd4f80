//! Session supervision for the mesh network and the MQTT broker.
//!
//! Each session runs the same small state machine
//! (`Connected -> Disconnected -> Reconnecting -> Connected`) with its own
//! exponential backoff. Losing the mesh network pauses command issuing;
//! regaining the broker republishes the whole state store, since retained
//! messages or updates may have been lost during the outage.

use crate::config::ReconnectConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::{BridgeError, Result};
use crate::mqtt::{MqttClient, MqttMessage, Publication, Publisher};
use crate::state::StateStore;
use crate::topic::{Direction, PAYLOAD_OFFLINE, PAYLOAD_ONLINE, TopicMapper, encode_payload};
use crate::zwave::MeshSession;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Capped exponential backoff with additive jitter.
///
/// The base delay doubles per attempt up to `max`; up to `jitter` times the
/// base delay is added on top so that many bridges don't retry in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before attempt `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let spread = base.as_secs_f64() * self.jitter;
        if spread <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        base + Duration::from_secs_f64(extra)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Health of one supervised session.
#[derive(Debug)]
pub struct SessionHealth {
    name: &'static str,
    state: SessionState,
    backoff: Backoff,
    failures: u32,
    max_attempts: u32,
}

impl SessionHealth {
    pub fn new(name: &'static str, config: &ReconnectConfig) -> Self {
        Self {
            name,
            state: SessionState::Disconnected,
            backoff: Backoff::new(
                Duration::from_millis(config.initial_ms),
                Duration::from_millis(config.max_ms),
                config.jitter,
            ),
            failures: 0,
            max_attempts: config.max_attempts,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the session up. Returns true if it was not up before.
    pub fn connected(&mut self) -> bool {
        let recovered = self.state != SessionState::Connected;
        self.state = SessionState::Connected;
        self.failures = 0;
        self.backoff.reset();
        recovered
    }

    /// Mark the session down. Returns true if it was up before.
    pub fn disconnected(&mut self) -> bool {
        let was_up = self.state == SessionState::Connected;
        self.state = SessionState::Disconnected;
        was_up
    }

    /// Start another reconnect attempt and get the delay to wait first.
    ///
    /// Fails once the configured number of consecutive attempts is used up.
    pub fn begin_attempt(&mut self) -> Result<Duration> {
        if self.max_attempts > 0 && self.failures >= self.max_attempts {
            return Err(BridgeError::ReconnectExhausted {
                session: self.name,
                attempts: self.failures,
            });
        }
        self.failures += 1;
        self.state = SessionState::Reconnecting;
        Ok(self.backoff.next_delay())
    }
}

/// Mesh session health changes reported by the network adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Up { home_id: u32 },
    Down { reason: String },
}

pub struct ReconnectManager {
    mesh: Mutex<SessionHealth>,
    mqtt: Mutex<SessionHealth>,
    grace: Duration,
    store: Arc<StateStore>,
    mapper: TopicMapper,
    dispatcher: Arc<CommandDispatcher>,
    publisher: Publisher,
    session: Arc<MeshSession>,
}

impl ReconnectManager {
    pub fn new(
        config: &ReconnectConfig,
        grace: Duration,
        store: Arc<StateStore>,
        mapper: TopicMapper,
        dispatcher: Arc<CommandDispatcher>,
        publisher: Publisher,
        session: Arc<MeshSession>,
    ) -> Self {
        Self {
            mesh: Mutex::new(SessionHealth::new("mesh", config)),
            mqtt: Mutex::new(SessionHealth::new("mqtt", config)),
            grace,
            store,
            mapper,
            dispatcher,
            publisher,
            session,
        }
    }

    pub fn mesh_state(&self) -> SessionState {
        self.mesh.lock().state()
    }

    pub fn mqtt_state(&self) -> SessionState {
        self.mqtt.lock().state()
    }

    pub fn on_mesh_down(&self, reason: &str) {
        self.session.mark_failed();
        if self.mesh.lock().disconnected() {
            warn!("[Reconnect] Mesh network lost: {}", reason);
        }
        self.dispatcher.pause();
    }

    pub fn on_mesh_up(&self, now: Instant) {
        if self.mesh.lock().connected() {
            info!("[Reconnect] Mesh network ready");
        }
        self.dispatcher.resume(now, self.grace);
    }

    pub fn on_mqtt_down(&self, reason: &str) {
        if self.mqtt.lock().disconnected() {
            warn!("[Reconnect] MQTT connection lost: {}", reason);
        }
    }

    pub fn on_mqtt_up(&self) {
        if self.mqtt.lock().connected() {
            info!("[Reconnect] MQTT connected");
        }
    }

    /// Announce the bridge and republish every known value once, retained.
    /// Waits for room in the publish queue rather than dropping anything.
    /// Returns how many values were queued.
    pub async fn replay_snapshot(&self) -> usize {
        self.publisher
            .send(Publication::retained(
                self.mapper.bridge_status_topic(),
                PAYLOAD_ONLINE,
            ))
            .await;
        for node in self.store.nodes() {
            self.publisher
                .send(Publication::retained(
                    self.mapper.node_status_topic(node),
                    PAYLOAD_ONLINE,
                ))
                .await;
        }

        let snapshot = self.store.snapshot();
        let mut queued = 0;
        for model in &snapshot {
            let topic = self.mapper.topic_for(&model.id, Direction::State);
            if !self
                .publisher
                .send(Publication::retained(topic, encode_payload(model)))
                .await
            {
                break;
            }
            queued += 1;
        }
        info!(
            "[Reconnect] Replayed {}/{} values to MQTT",
            queued,
            snapshot.len()
        );
        queued
    }

    /// Keep the mesh session open, reopening it with backoff after failures.
    pub async fn supervise_mesh(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<SessionSignal>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut open_needed = true;
        loop {
            if open_needed {
                match self.session.open() {
                    Ok(epoch) => {
                        debug!("[Reconnect] Mesh session epoch {} opened", epoch);
                        open_needed = false;
                    }
                    Err(e) => {
                        self.on_mesh_down(&e.to_string());
                        let delay = self.mesh.lock().begin_attempt()?;
                        info!("[Reconnect] Reopening mesh network in {:?}", delay);
                        if !sleep_or_cancel(delay, &cancel).await {
                            self.session.close();
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.session.close();
                    return Ok(());
                }
                signal = signals.recv() => match signal {
                    Some(SessionSignal::Up { home_id }) => {
                        debug!("[Reconnect] Mesh home id {:08x}", home_id);
                        self.on_mesh_up(Instant::now());
                    }
                    Some(SessionSignal::Down { reason }) => {
                        self.on_mesh_down(&reason);
                        self.session.close();
                        let delay = self.mesh.lock().begin_attempt()?;
                        info!("[Reconnect] Reopening mesh network in {:?}", delay);
                        if !sleep_or_cancel(delay, &cancel).await {
                            return Ok(());
                        }
                        open_needed = true;
                    }
                    None => return Err(BridgeError::ChannelClosed("mesh session signals")),
                },
            }
        }
    }

    /// Poll the MQTT event loop forever, forwarding inbound messages and
    /// backing off between reconnects.
    ///
    /// Anything that waits on the client's request queue runs in its own task:
    /// that queue only drains while this loop keeps polling.
    pub async fn supervise_mqtt(
        self: Arc<Self>,
        mqtt: MqttClient,
        messages: mpsc::Sender<MqttMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (client, mut event_loop) = mqtt.into_parts();
        let mut announce: Option<JoinHandle<()>> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(task) = announce.take() {
                        task.abort();
                    }
                    self.go_offline(client, event_loop).await;
                    return Ok(());
                }
                event = event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        warn!("[MQTT] Broker refused connection: {:?}", ack.code);
                        continue;
                    }
                    self.on_mqtt_up();
                    if let Some(task) = announce.take() {
                        task.abort();
                    }
                    let task = self.clone().resubscribe_and_replay(client.clone());
                    announce = Some(tokio::spawn(task));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("[MQTT] Subscription acknowledged ({:?})", ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = MqttMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if messages.send(message).await.is_err() {
                        return Err(BridgeError::ChannelClosed("mqtt messages"));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.on_mqtt_down(&e.to_string());
                    let delay = self.mqtt.lock().begin_attempt()?;
                    debug!("[MQTT] Reconnecting in {:?}", delay);
                    if !sleep_or_cancel(delay, &cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn resubscribe_and_replay(self: Arc<Self>, client: AsyncClient) {
        // Clean sessions drop subscriptions, so subscribe on every connect.
        let filter = self.mapper.command_filter();
        match client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
            Ok(()) => info!("[MQTT] Subscribed to {}", filter),
            Err(e) => error!("[MQTT] Failed to subscribe to {}: {:?}", filter, e),
        }
        self.replay_snapshot().await;
    }

    /// Publish the retained `offline` status and disconnect cleanly, giving up
    /// after a short while if the broker is unreachable.
    async fn go_offline(&self, client: AsyncClient, mut event_loop: EventLoop) {
        info!("[MQTT] Disconnecting");
        let status_topic = self.mapper.bridge_status_topic();
        let farewell = tokio::spawn(async move {
            if let Err(e) = client
                .publish(status_topic, QoS::AtLeastOnce, true, PAYLOAD_OFFLINE)
                .await
            {
                debug!("[MQTT] Failed to queue offline status: {:?}", e);
            }
            let _ = client.disconnect().await;
        });
        let flush = async {
            while let Ok(event) = event_loop.poll().await {
                if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                    break;
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
            warn!("[MQTT] Timed out waiting for a clean disconnect");
        }
        farewell.abort();
    }
}

/// Sleep for `delay`. Returns false if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherConfig;
    use crate::model::{NodeId, Value, ValueClass, ValueId, ValueUpdate};
    use crate::config::MqttConfig;
    use crate::mqtt::run_publish_worker;
    use crate::zwave::SimulatedDriver;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 100,
            max_ms: 1_000,
            jitter: 0.0,
            max_attempts,
        }
    }

    struct Harness {
        store: Arc<StateStore>,
        dispatcher: Arc<CommandDispatcher>,
        manager: Arc<ReconnectManager>,
        published: mpsc::Receiver<Publication>,
    }

    fn harness() -> Harness {
        harness_with_queue(64)
    }

    fn harness_with_queue(capacity: usize) -> Harness {
        let store = Arc::new(StateStore::new());
        let mapper = TopicMapper::new("zwave");
        let (issue_tx, _issue_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(CommandDispatcher::new(
            DispatcherConfig {
                retry_limit: 1,
                ack_timeout: Duration::from_secs(5),
                confirm_timeout: Duration::from_secs(5),
            },
            mapper.clone(),
            store.clone(),
            issue_tx,
            events_tx,
        ));
        let (publisher, published) = Publisher::channel(capacity);
        let (notify_tx, _notify_rx) = mpsc::channel(8);
        let session = Arc::new(MeshSession::new(
            Arc::new(SimulatedDriver::new(1)),
            "sim",
            notify_tx,
        ));
        let manager = Arc::new(ReconnectManager::new(
            &config(0),
            Duration::from_secs(30),
            store.clone(),
            mapper,
            dispatcher.clone(),
            publisher,
            session,
        ));
        Harness {
            store,
            dispatcher,
            manager,
            published,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Publication>) -> Vec<Publication> {
        let mut out = Vec::new();
        while let Ok(publication) = rx.try_recv() {
            out.push(publication);
        }
        out
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000), 0.0);
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bound() {
        let mut backoff = Backoff::new(Duration::from_millis(1_000), Duration::from_secs(60), 0.5);
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn test_session_state_machine() {
        let mut health = SessionHealth::new("mqtt", &config(0));
        assert_eq!(health.state(), SessionState::Disconnected);
        assert!(health.connected());
        assert!(!health.connected());
        assert!(health.disconnected());
        assert_eq!(health.begin_attempt().unwrap(), Duration::from_millis(100));
        assert_eq!(health.state(), SessionState::Reconnecting);
        assert_eq!(health.begin_attempt().unwrap(), Duration::from_millis(200));
        assert!(health.connected());
        assert_eq!(health.begin_attempt().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_supervision_limit_escalates() {
        let mut health = SessionHealth::new("mesh", &config(2));
        health.disconnected();
        assert!(health.begin_attempt().is_ok());
        assert!(health.begin_attempt().is_ok());
        match health.begin_attempt() {
            Err(BridgeError::ReconnectExhausted { session, attempts }) => {
                assert_eq!(session, "mesh");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_mesh_down_pauses_and_up_resumes_dispatcher() {
        let h = harness();
        h.manager.on_mesh_up(Instant::now());
        assert!(!h.dispatcher.is_paused());
        h.manager.on_mesh_down("serial port closed");
        assert!(h.dispatcher.is_paused());
        assert_eq!(h.manager.mesh_state(), SessionState::Disconnected);
        h.manager.on_mesh_up(Instant::now());
        assert!(!h.dispatcher.is_paused());
        assert_eq!(h.manager.mesh_state(), SessionState::Connected);
    }

    fn switch(node: u8) -> ValueId {
        ValueId::new(NodeId(node), ValueClass::new("switch").unwrap(), 0)
    }

    fn state_counts(published: &[Publication]) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for publication in published.iter().filter(|p| p.topic.ends_with("/state")) {
            assert!(publication.retain);
            *counts.entry(publication.topic.clone()).or_default() += 1;
        }
        counts
    }

    #[tokio::test]
    async fn test_mqtt_reconnect_replays_every_value_once_with_latest_value() {
        let mut h = harness();
        let ids: Vec<ValueId> = (1..=3).map(switch).collect();
        for id in &ids {
            h.store.apply(id, ValueUpdate::new(Value::Boolean(false), 1));
        }

        h.manager.on_mqtt_up();
        h.manager.replay_snapshot().await;
        drain(&mut h.published);

        h.manager.on_mqtt_down("connection reset");
        assert_eq!(h.manager.mqtt_state(), SessionState::Disconnected);
        h.store.apply(&ids[1], ValueUpdate::new(Value::Boolean(true), 2));

        h.manager.on_mqtt_up();
        assert_eq!(h.manager.mqtt_state(), SessionState::Connected);
        assert_eq!(h.manager.replay_snapshot().await, 3);

        let published = drain(&mut h.published);
        let counts = state_counts(&published);
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&count| count == 1));

        let updated = published
            .iter()
            .find(|p| p.topic == "zwave/2/switch/0/state")
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&updated.payload).unwrap();
        assert_eq!(json["value"], true);

        assert!(published
            .iter()
            .any(|p| p.topic == "zwave/bridge/status" && p.payload == PAYLOAD_ONLINE.as_bytes()));
    }

    #[tokio::test]
    async fn test_replay_waits_out_a_backlogged_queue() {
        let mut h = harness_with_queue(8);
        for node in 1..=5 {
            h.store.apply(&switch(node), ValueUpdate::new(Value::Boolean(node % 2 == 0), 1));
        }
        let publisher = h.manager.publisher.clone();
        for n in 0..6 {
            assert!(publisher.publish(Publication::transient(format!("zwave/backlog/{}", n), "x")));
        }

        let manager = h.manager.clone();
        let replay = tokio::spawn(async move { manager.replay_snapshot().await });

        // backlog + bridge status + one node status and one state per value
        let mut published = Vec::new();
        while published.len() < 6 + 1 + 5 + 5 {
            let next = tokio::time::timeout(Duration::from_secs(5), h.published.recv()).await;
            published.push(next.unwrap().unwrap());
        }
        assert_eq!(tokio_test::assert_ok!(replay.await), 5);
        assert_eq!(publisher.dropped(), 0);

        let counts = state_counts(&published);
        assert_eq!(counts.len(), 5);
        assert!(counts.values().all(|&count| count == 1));
        let node_four = published
            .iter()
            .find(|p| p.topic == "zwave/4/switch/0/state")
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&node_four.payload).unwrap();
        assert_eq!(json["value"], true);
    }

    #[derive(Default)]
    struct BrokerLog {
        subscriptions: Vec<String>,
        publishes: Vec<(String, Vec<u8>, bool)>,
    }

    impl BrokerLog {
        fn published(&self, topic: &str) -> usize {
            self.publishes.iter().filter(|(t, _, _)| t == topic).count()
        }
    }

    /// Minimal MQTT 3.1.1 broker for one client: acknowledges CONNECT,
    /// PUBLISH (QoS 1), SUBSCRIBE and PINGREQ, and records what it sees.
    async fn fake_broker(listener: TcpListener, log: Arc<Mutex<BrokerLog>>) {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        loop {
            let Ok(header) = stream.read_u8().await else {
                return;
            };
            let mut length = 0usize;
            let mut shift = 0;
            loop {
                let Ok(byte) = stream.read_u8().await else {
                    return;
                };
                length |= ((byte & 0x7f) as usize) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            let mut body = vec![0u8; length];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }

            let reply = match header >> 4 {
                1 => vec![0x20, 0x02, 0x00, 0x00],
                3 => {
                    let qos = (header >> 1) & 0x03;
                    let retain = header & 0x01 == 1;
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).to_string();
                    let mut offset = 2 + topic_len;
                    let packet_id = (qos > 0).then(|| [body[offset], body[offset + 1]]);
                    if packet_id.is_some() {
                        offset += 2;
                    }
                    log.lock().publishes.push((topic, body[offset..].to_vec(), retain));
                    match packet_id {
                        Some([hi, lo]) => vec![0x40, 0x02, hi, lo],
                        None => continue,
                    }
                }
                8 => {
                    let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                    let filter = String::from_utf8_lossy(&body[4..4 + topic_len]).to_string();
                    log.lock().subscriptions.push(filter);
                    vec![0x90, 0x03, body[0], body[1], 0x01]
                }
                12 => vec![0xd0, 0x00],
                14 => return,
                _ => continue,
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    async fn eventually(log: &Arc<Mutex<BrokerLog>>, check: impl Fn(&BrokerLog) -> bool) {
        let wait = async {
            while !check(&log.lock()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("broker never saw the expected traffic");
    }

    #[tokio::test]
    async fn test_mqtt_session_subscribes_replays_and_goes_offline() {
        let h = harness();
        for node in 1..=5 {
            h.store.apply(&switch(node), ValueUpdate::new(Value::Boolean(true), 1));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        let broker = tokio::spawn(fake_broker(listener, log.clone()));

        let mqtt = MqttClient::new(
            &MqttConfig {
                broker_host: "127.0.0.1".into(),
                broker_port: port,
                ..MqttConfig::default()
            },
            "zwave/bridge/status",
        );

        // Fill the client's request queue before the connection is up.
        let client = mqtt.client();
        let mut queued = 0;
        for n in 0..150 {
            if client
                .try_publish(format!("zwave/backlog/{}", n), QoS::AtLeastOnce, false, "x")
                .is_ok()
            {
                queued += 1;
            }
        }
        assert!(queued < 150);

        let worker = tokio::spawn(run_publish_worker(mqtt.client(), h.published));
        let (message_tx, _messages) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let session = tokio::spawn(h.manager.clone().supervise_mqtt(mqtt, message_tx, cancel.clone()));

        eventually(&log, |log| {
            log.subscriptions.iter().any(|f| f == "zwave/+/+/+/set")
                && (1..=5).all(|n| log.published(&format!("zwave/{}/switch/0/state", n)) > 0)
        })
        .await;
        assert_eq!(h.manager.mqtt_state(), SessionState::Connected);
        {
            let log = log.lock();
            assert_eq!(log.subscriptions, vec!["zwave/+/+/+/set".to_string()]);
            assert!((1..=5).all(|n| log.published(&format!("zwave/{}/switch/0/state", n)) == 1));
            assert_eq!(log.published("zwave/backlog/0"), 1);
        }

        cancel.cancel();
        tokio_test::assert_ok!(session.await.unwrap());
        eventually(&log, |log| {
            log.publishes.iter().any(|(topic, payload, retain)| {
                topic == "zwave/bridge/status" && payload == PAYLOAD_OFFLINE.as_bytes() && *retain
            })
        })
        .await;

        worker.abort();
        broker.abort();
    }
}
