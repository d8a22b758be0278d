//! Broker transports.
//!
//! The publisher owns exactly one [`BrokerTransport`]. [`ChannelTransport`]
//! delivers into an in-process queue and backs tests and dry runs;
//! [`MqttTransport`] (feature `mqtt`) talks to a real broker.

use super::unacked::PendingAcks;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&mut self) -> AppResult<()>;

    /// Hand one payload to the broker client; returns the local message id.
    ///
    /// Failures are [`DaqError::DeliveryTransient`].
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: u8) -> AppResult<u64>;

    /// Ids of QoS > 0 messages still unacknowledged after `timeout`.
    /// Each id is returned once and will not show up in
    /// [`poll_acked`](Self::poll_acked) afterwards.
    async fn poll_unacked(&mut self, timeout: Duration) -> Vec<u64>;

    /// Ids of QoS > 0 messages the broker acknowledged since the last call.
    async fn poll_acked(&mut self) -> Vec<u64>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&mut self) -> AppResult<()>;

    fn name(&self) -> &'static str;
}

/// A payload accepted by [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

#[derive(Debug)]
struct ControlState {
    reachable: AtomicBool,
    fail_next: AtomicU32,
    withhold_acks: AtomicBool,
}

/// Fault injection for a [`ChannelTransport`].
#[derive(Debug, Clone)]
pub struct ChannelControl {
    state: Arc<ControlState>,
}

impl ChannelControl {
    /// Make the broker reachable or not. An unreachable broker drops the connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Stop acknowledging QoS > 0 messages.
    pub fn withhold_acks(&self, withhold: bool) {
        self.state.withhold_acks.store(withhold, Ordering::SeqCst);
    }
}

/// In-process transport delivering into a bounded queue.
pub struct ChannelTransport {
    tx: mpsc::Sender<PublishedMessage>,
    control: Arc<ControlState>,
    connected: bool,
    next_id: u64,
    pending: PendingAcks,
    acked: Vec<u64>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PublishedMessage>, ChannelControl) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let control = Arc::new(ControlState {
            reachable: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            withhold_acks: AtomicBool::new(false),
        });
        let transport = Self {
            tx,
            control: Arc::clone(&control),
            connected: false,
            next_id: 1,
            pending: PendingAcks::default(),
            acked: Vec::new(),
        };
        (transport, rx, ChannelControl { state: control })
    }
}

#[async_trait]
impl BrokerTransport for ChannelTransport {
    async fn connect(&mut self) -> AppResult<()> {
        if !self.control.reachable.load(Ordering::SeqCst) || self.tx.is_closed() {
            self.connected = false;
            return Err(DaqError::DeliveryTransient("broker unreachable".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: u8) -> AppResult<u64> {
        if !self.control.reachable.load(Ordering::SeqCst) {
            self.connected = false;
        }
        if !self.connected {
            return Err(DaqError::DeliveryTransient("broker not connected".into()));
        }
        let injected = self
            .control
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DaqError::DeliveryTransient("publish rejected".into()));
        }

        let id = self.next_id;
        let message = PublishedMessage {
            id,
            topic: topic.to_string(),
            payload,
            qos,
        };
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(DaqError::DeliveryTransient("broker queue full".into()));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.connected = false;
                return Err(DaqError::DeliveryTransient("broker connection closed".into()));
            }
        }
        self.next_id += 1;
        if qos > 0 {
            if self.control.withhold_acks.load(Ordering::SeqCst) {
                self.pending.insert(id, Instant::now());
            } else {
                self.acked.push(id);
            }
        }
        Ok(id)
    }

    async fn poll_unacked(&mut self, timeout: Duration) -> Vec<u64> {
        self.pending.take_overdue(Instant::now(), timeout)
    }

    async fn poll_acked(&mut self) -> Vec<u64> {
        if !self.control.withhold_acks.load(Ordering::SeqCst) {
            let released = self.pending.take_all();
            self.acked.extend(released);
        }
        std::mem::take(&mut self.acked)
    }

    fn is_connected(&self) -> bool {
        self.connected && self.control.reachable.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.connected = false;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::*;
    use crate::config::MqttConfig;
    use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::{watch, Mutex};
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    const REQUEST_CAPACITY: usize = 256;
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    const RETRY_DELAY: Duration = Duration::from_secs(1);

    fn qos(level: u8) -> QoS {
        match level {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    /// Delivery bookkeeping shared with the event loop task.
    ///
    /// Publishes are reported by the event loop in request order, so the
    /// local id at the front of `queued` belongs to the next outgoing publish.
    #[derive(Debug, Default)]
    struct AckState {
        queued: VecDeque<u64>,
        in_flight: HashMap<u16, u64>,
        pending: PendingAcks,
        acked: Vec<u64>,
    }

    impl AckState {
        fn outgoing(&mut self, pkid: u16) {
            if pkid != 0 && self.in_flight.contains_key(&pkid) {
                // retransmission after reconnect
                return;
            }
            let Some(id) = self.queued.pop_front() else {
                return;
            };
            if pkid != 0 {
                self.in_flight.insert(pkid, id);
                self.pending.insert(id, Instant::now());
            }
        }

        fn completed(&mut self, pkid: u16) {
            if let Some(id) = self.in_flight.remove(&pkid) {
                if self.pending.ack(id) {
                    self.acked.push(id);
                }
            }
        }

        fn take_overdue(&mut self, timeout: Duration) -> Vec<u64> {
            let overdue = self.pending.take_overdue(Instant::now(), timeout);
            if !overdue.is_empty() {
                self.in_flight.retain(|_, id| !overdue.contains(id));
            }
            overdue
        }
    }

    /// MQTT client transport.
    ///
    /// Ids are local publish counters; packet ids stay internal.
    pub struct MqttTransport {
        config: MqttConfig,
        publish_timeout: Duration,
        client: Option<AsyncClient>,
        event_task: Option<JoinHandle<()>>,
        connected: watch::Receiver<bool>,
        acks: Arc<Mutex<AckState>>,
        next_id: u64,
    }

    impl MqttTransport {
        pub fn new(config: MqttConfig, publish_timeout: Duration) -> Self {
            let (_, connected) = watch::channel(false);
            Self {
                config,
                publish_timeout,
                client: None,
                event_task: None,
                connected,
                acks: Arc::new(Mutex::new(AckState::default())),
                next_id: 1,
            }
        }

        fn options(&self) -> MqttOptions {
            let mut options = MqttOptions::new(
                self.config.client_id.clone(),
                self.config.broker_address.clone(),
                self.config.broker_port,
            );
            options.set_keep_alive(Duration::from_secs(self.config.keepalive_s.max(5)));
            if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
                options.set_credentials(user.clone(), pass.clone());
            }
            options
        }

        async fn drive(
            mut events: EventLoop,
            connected: watch::Sender<bool>,
            acks: Arc<Mutex<AckState>>,
        ) {
            loop {
                match events.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Broker connection established");
                        connected.send_replace(true);
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        acks.lock().await.completed(ack.pkid);
                    }
                    Ok(Event::Incoming(Packet::PubComp(comp))) => {
                        acks.lock().await.completed(comp.pkid);
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        acks.lock().await.outgoing(pkid);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected.send_replace(false) {
                            warn!(error = %e, "Broker connection lost");
                        } else {
                            debug!(error = %e, "Broker still unreachable");
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    #[async_trait]
    impl BrokerTransport for MqttTransport {
        async fn connect(&mut self) -> AppResult<()> {
            if self.client.is_none() {
                let (client, events) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
                let (tx, rx) = watch::channel(false);
                self.event_task = Some(tokio::spawn(Self::drive(
                    events,
                    tx,
                    Arc::clone(&self.acks),
                )));
                self.connected = rx;
                self.client = Some(client);
            }
            let mut connected = self.connected.clone();
            let reached = tokio::time::timeout(CONNECT_TIMEOUT, connected.wait_for(|c| *c))
                .await
                .is_ok_and(|waited| waited.is_ok());
            if reached {
                Ok(())
            } else {
                Err(DaqError::DeliveryTransient(format!(
                    "broker {}:{} not reachable",
                    self.config.broker_address, self.config.broker_port
                )))
            }
        }

        async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos_level: u8) -> AppResult<u64> {
            let client = match &self.client {
                Some(client) if *self.connected.borrow() => client,
                _ => return Err(DaqError::DeliveryTransient("broker not connected".into())),
            };
            let id = self.next_id;
            // Queued before the request so the event loop can never see the
            // publish ahead of its id.
            self.acks.lock().await.queued.push_back(id);
            let send = client.publish(topic, qos(qos_level), false, payload);
            let result = match tokio::time::timeout(self.publish_timeout, send).await {
                Ok(Ok(())) => Ok(id),
                Ok(Err(e)) => Err(DaqError::DeliveryTransient(e.to_string())),
                Err(_) => Err(DaqError::DeliveryTransient(format!(
                    "publish not accepted within {:?}",
                    self.publish_timeout
                ))),
            };
            match result {
                Ok(_) => self.next_id += 1,
                Err(_) => {
                    let mut acks = self.acks.lock().await;
                    if acks.queued.back() == Some(&id) {
                        acks.queued.pop_back();
                    }
                }
            }
            result
        }

        async fn poll_unacked(&mut self, timeout: Duration) -> Vec<u64> {
            self.acks.lock().await.take_overdue(timeout)
        }

        async fn poll_acked(&mut self) -> Vec<u64> {
            std::mem::take(&mut self.acks.lock().await.acked)
        }

        fn is_connected(&self) -> bool {
            *self.connected.borrow()
        }

        async fn disconnect(&mut self) -> AppResult<()> {
            if let Some(client) = self.client.take() {
                if let Err(e) = client.disconnect().await {
                    debug!(error = %e, "Broker disconnect request failed");
                }
            }
            if let Some(task) = self.event_task.take() {
                task.abort();
            }
            let (_, rx) = watch::channel(false);
            self.connected = rx;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "mqtt"
        }
    }

    impl Drop for MqttTransport {
        fn drop(&mut self) {
            if let Some(task) = self.event_task.take() {
                task.abort();
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn packet_ids_resolve_to_local_ids() {
            let mut state = AckState::default();
            state.queued.extend([7, 8, 9]);
            state.outgoing(1);
            state.outgoing(0);
            state.outgoing(2);
            // retransmission of packet 1 must not consume a local id
            state.outgoing(1);
            assert!(state.queued.is_empty());

            state.completed(2);
            state.completed(1);
            assert_eq!(state.acked, vec![9, 7]);
            assert!(state.take_overdue(Duration::ZERO).is_empty());
        }

        #[test]
        fn overdue_ids_are_not_acked_later() {
            let mut state = AckState::default();
            state.queued.push_back(3);
            state.outgoing(5);
            assert_eq!(state.take_overdue(Duration::ZERO), vec![3]);
            state.completed(5);
            assert!(state.acked.is_empty());
        }
    }
}
