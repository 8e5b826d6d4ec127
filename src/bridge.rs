//! Delivery of offsets to the receiving application.
//!
//! A [`MessageBridge`] moves one `(receiver, method, payload)` message across
//! the process boundary. The [`Courier`] wraps a bridge with the retry policy
//! for receivers that are still starting up.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use zenoh::prelude::r#async::*;

use crate::config::DeliveryConfig;
use crate::error::{BridgeError, ErrorWrapper};
use crate::signal::Offset;

#[async_trait]
pub trait MessageBridge: Send + Sync {
    /// Hand `payload` to `method` on `receiver`.
    ///
    /// Returns [`BridgeError::NotReady`] while the receiver is not up yet.
    async fn send_message(
        &self,
        receiver: &str,
        method: &str,
        payload: &str,
    ) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Receiver never became ready
    Dropped { attempts: u32 },
    /// Transport failed for a reason other than readiness
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(30, Duration::from_millis(200))
    }
}

/// Sends offsets to one receiver method, retrying while it is not ready.
#[derive(Clone)]
pub struct Courier {
    bridge: Arc<dyn MessageBridge>,
    receiver: String,
    method: String,
    retry: RetryPolicy,
}

impl Courier {
    pub fn new(
        bridge: Arc<dyn MessageBridge>,
        receiver: impl Into<String>,
        method: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bridge,
            receiver: receiver.into(),
            method: method.into(),
            retry,
        }
    }

    pub fn from_config(bridge: Arc<dyn MessageBridge>, config: &DeliveryConfig) -> Self {
        Self::new(
            bridge,
            &config.receiver,
            &config.method,
            RetryPolicy::new(config.max_attempts, config.retry_delay()),
        )
    }

    pub async fn deliver(&self, offset: Offset) -> DeliveryOutcome {
        let (_sender, mut latest) = watch::channel(Some(offset));
        self.deliver_latest(&mut latest).await
    }

    /// Deliver whatever offset `latest` holds, retrying while the receiver is
    /// not ready.
    ///
    /// Every retry sends the most recent value. A newer offset arriving
    /// mid-retry is sent right away and gets a fresh attempt budget.
    pub async fn deliver_latest(
        &self,
        latest: &mut watch::Receiver<Option<Offset>>,
    ) -> DeliveryOutcome {
        let mut attempts = 0;
        loop {
            let offset = match *latest.borrow_and_update() {
                Some(offset) => offset,
                None => return DeliveryOutcome::Dropped { attempts },
            };
            let payload = match serde_json::to_string(&offset) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!("Failed to encode offset {:?}: {}", offset, err);
                    return DeliveryOutcome::Failed { attempts };
                }
            };

            attempts += 1;
            match self
                .bridge
                .send_message(&self.receiver, &self.method, &payload)
                .await
            {
                Ok(()) => {
                    tracing::trace!(attempts, "Delivered {}", payload);
                    return DeliveryOutcome::Delivered { attempts };
                }
                Err(BridgeError::NotReady(_)) => {}
                Err(err) => {
                    tracing::warn!("Delivery to {} failed: {}", self.receiver, err);
                    return DeliveryOutcome::Failed { attempts };
                }
            }

            if latest.has_changed().unwrap_or(false) {
                attempts = 0;
                continue;
            }
            if attempts >= self.retry.max_attempts {
                tracing::warn!(
                    "{}.{} not ready after {} attempts, dropping offset",
                    self.receiver,
                    self.method,
                    attempts
                );
                return DeliveryOutcome::Dropped { attempts };
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry.delay) => {}
                changed = latest.changed() => {
                    if changed.is_err() {
                        return DeliveryOutcome::Dropped { attempts };
                    }
                    attempts = 0;
                }
            }
        }
    }
}

/// Publishes payloads on `<prefix>/<receiver>/<method>`.
///
/// Before the first publish the bridge queries `<prefix>/<receiver>/ready`.
/// Until a receiver answers that query every send reports not ready.
pub struct ZenohBridge {
    session: Arc<zenoh::Session>,
    key_prefix: String,
    ready_timeout: Duration,
    ready: AtomicBool,
}

impl ZenohBridge {
    pub fn new(session: Arc<zenoh::Session>, key_prefix: impl Into<String>) -> Self {
        Self {
            session,
            key_prefix: key_prefix.into(),
            ready_timeout: Duration::from_millis(100),
            ready: AtomicBool::new(false),
        }
    }

    pub fn offset_key(&self, receiver: &str, method: &str) -> String {
        offset_key(&self.key_prefix, receiver, method)
    }

    async fn query_ready(&self, receiver: &str) -> Result<bool, BridgeError> {
        let key = ready_key(&self.key_prefix, receiver);
        let replies = self
            .session
            .get(key.as_str())
            .timeout(self.ready_timeout)
            .res()
            .await
            .map_err(|err| BridgeError::Transport(ErrorWrapper::ZenohError(err).to_string()))?;
        while let Ok(reply) = replies.recv_async().await {
            if reply.sample.is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl MessageBridge for ZenohBridge {
    async fn send_message(
        &self,
        receiver: &str,
        method: &str,
        payload: &str,
    ) -> Result<(), BridgeError> {
        if !self.ready.load(Ordering::Acquire) {
            if !self.query_ready(receiver).await? {
                return Err(BridgeError::NotReady(receiver.to_string()));
            }
            tracing::info!("Receiver {} is ready", receiver);
            self.ready.store(true, Ordering::Release);
        }

        self.session
            .put(self.offset_key(receiver, method), payload.to_string())
            .res()
            .await
            .map_err(|err| BridgeError::Transport(ErrorWrapper::ZenohError(err).to_string()))
    }
}

pub fn offset_key(prefix: &str, receiver: &str, method: &str) -> String {
    format!("{}/{}/{}", prefix, receiver, method)
}

pub fn ready_key(prefix: &str, receiver: &str) -> String {
    format!("{}/{}/ready", prefix, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Not ready for the first `not_ready_for` calls.
    struct FlakyBridge {
        not_ready_for: u32,
        calls: AtomicU32,
        delivered: Mutex<Vec<(String, String, String)>>,
    }

    impl FlakyBridge {
        fn new(not_ready_for: u32) -> Self {
            Self {
                not_ready_for,
                calls: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageBridge for FlakyBridge {
        async fn send_message(
            &self,
            receiver: &str,
            method: &str,
            payload: &str,
        ) -> Result<(), BridgeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.not_ready_for {
                return Err(BridgeError::NotReady(receiver.to_string()));
            }
            self.delivered.lock().unwrap().push((
                receiver.to_string(),
                method.to_string(),
                payload.to_string(),
            ));
            Ok(())
        }
    }

    struct BrokenBridge;

    #[async_trait]
    impl MessageBridge for BrokenBridge {
        async fn send_message(&self, _: &str, _: &str, _: &str) -> Result<(), BridgeError> {
            Err(BridgeError::Transport("connection reset".to_string()))
        }
    }

    fn courier(bridge: Arc<dyn MessageBridge>, max_attempts: u32) -> Courier {
        Courier::new(
            bridge,
            "FaceReceiver",
            "OnFaceMove",
            RetryPolicy::new(max_attempts, Duration::from_millis(200)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ready_receiver_gets_message_first_try() {
        let bridge = Arc::new(FlakyBridge::new(0));
        let outcome = courier(bridge.clone(), 30).deliver(Offset::new(0.25, -0.5)).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
        let delivered = bridge.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "FaceReceiver");
        assert_eq!(delivered[0].1, "OnFaceMove");
        let payload: serde_json::Value = serde_json::from_str(&delivered[0].2).unwrap();
        assert_eq!(payload, serde_json::json!({"x": 0.25, "y": -0.5}));
    }

    #[tokio::test(start_paused = true)]
    async fn late_receiver_gets_message_exactly_once() {
        let bridge = Arc::new(FlakyBridge::new(6));
        let started = tokio::time::Instant::now();
        let outcome = courier(bridge.clone(), 30).deliver(Offset::new(0.1, 0.1)).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 7 });
        assert_eq!(bridge.delivered.lock().unwrap().len(), 1);
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 7);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(6 * 200), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(7 * 200), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_ready_on_last_attempt() {
        let bridge = Arc::new(FlakyBridge::new(29));
        let outcome = courier(bridge.clone(), 30).deliver(Offset::new(0.0, 0.0)).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 30 });
        assert_eq!(bridge.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_receiver_is_dropped_after_max_attempts() {
        let bridge = Arc::new(FlakyBridge::new(u32::MAX));
        let outcome = courier(bridge.clone(), 30).deliver(Offset::new(0.0, 0.0)).await;
        assert_eq!(outcome, DeliveryOutcome::Dropped { attempts: 30 });
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 30);
        assert!(bridge.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_not_retried() {
        let outcome = courier(Arc::new(BrokenBridge), 30)
            .deliver(Offset::new(0.0, 0.0))
            .await;
        assert_eq!(outcome, DeliveryOutcome::Failed { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn retries_switch_to_newest_offset() {
        let bridge = Arc::new(FlakyBridge::new(3));
        let courier = courier(bridge.clone(), 30);
        let (sender, mut latest) = watch::channel(Some(Offset::new(0.1, 0.1)));
        let delivery = tokio::spawn(async move { courier.deliver_latest(&mut latest).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        sender.send_replace(Some(Offset::new(0.4, -0.2)));

        // newer offset restarts the attempt count
        assert_eq!(
            delivery.await.unwrap(),
            DeliveryOutcome::Delivered { attempts: 2 }
        );
        let delivered = bridge.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&delivered[0].2).unwrap();
        assert_eq!(payload, serde_json::json!({"x": 0.4, "y": -0.2}));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn keys_nest_under_prefix() {
        assert_eq!(
            offset_key("face-tracker", "FaceReceiver", "OnFaceMove"),
            "face-tracker/FaceReceiver/OnFaceMove"
        );
        assert_eq!(
            ready_key("face-tracker", "FaceReceiver"),
            "face-tracker/FaceReceiver/ready"
        );
    }
}
