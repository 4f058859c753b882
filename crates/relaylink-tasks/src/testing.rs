//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relaylink_protocol::{InboundMessage, OutboundMessage, ReflectId, Reflected};

use crate::codec::{IncomingMessageProcessor, MessageFilter, ServerLink, TaskCodec};
use crate::task::Task;
use crate::TaskError;

/// Poll `condition` until it holds; panics after five seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub(crate) struct MockLink {
    connected: AtomicBool,
    sent: Mutex<Vec<OutboundMessage>>,
    restarts: Mutex<Vec<Duration>>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
        }
    }
}

impl MockLink {
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn restarts(&self) -> Vec<Duration> {
        self.restarts.lock().unwrap().clone()
    }
}

impl ServerLink for MockLink {
    fn send_outbound(&self, message: OutboundMessage) -> Result<(), TaskError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TaskError::ConnectionStopped);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn restart_connection(&self, delay: Duration) {
        self.restarts.lock().unwrap().push(delay);
    }
}

/// Records what it processes; acks reflected messages.
#[derive(Default)]
pub(crate) struct RecordingProcessor {
    processed: AtomicUsize,
    csp: Mutex<Vec<Vec<u8>>>,
    reflected: Mutex<Vec<u32>>,
    alerts: Mutex<Vec<String>>,
    errors: Mutex<Vec<(bool, String)>>,
}

impl RecordingProcessor {
    pub(crate) fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub(crate) fn csp_messages(&self) -> Vec<Vec<u8>> {
        self.csp.lock().unwrap().clone()
    }

    pub(crate) fn reflected_ids(&self) -> Vec<u32> {
        self.reflected.lock().unwrap().clone()
    }

    pub(crate) fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }

    pub(crate) fn errors(&self) -> Vec<(bool, String)> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl IncomingMessageProcessor for RecordingProcessor {
    async fn process_incoming_csp_message(
        &self,
        data: Vec<u8>,
        _handle: &dyn TaskCodec,
    ) -> Result<(), TaskError> {
        self.csp.lock().unwrap().push(data);
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process_incoming_reflected(
        &self,
        reflected: Reflected,
        handle: &dyn TaskCodec,
    ) -> Result<(), TaskError> {
        self.reflected.lock().unwrap().push(reflected.reflected_id);
        self.processed.fetch_add(1, Ordering::SeqCst);
        handle
            .write(OutboundMessage::ReflectedAck(reflected.reflected_id))
            .await
    }

    fn process_server_alert(&self, text: &str) {
        self.alerts.lock().unwrap().push(text.to_string());
    }

    fn process_server_error(&self, reconnect_allowed: bool, text: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((reconnect_allowed, text.to_string()));
    }
}

/// Codec without a connection.
pub(crate) struct NoopCodec;

#[async_trait]
impl TaskCodec for NoopCodec {
    async fn read(&self, _filter: MessageFilter<'_>) -> Result<InboundMessage, TaskError> {
        Err(TaskError::ConnectionStopped)
    }

    async fn write(&self, _message: OutboundMessage) -> Result<(), TaskError> {
        Ok(())
    }

    fn next_reflect_id(&self) -> ReflectId {
        0
    }
}

/// Appends its number to a shared log and returns it.
pub(crate) struct CountingTask {
    n: u32,
    order: Arc<Mutex<Vec<u32>>>,
}

impl CountingTask {
    pub(crate) fn new(n: u32, order: Arc<Mutex<Vec<u32>>>) -> Self {
        Self { n, order }
    }
}

#[async_trait]
impl Task for CountingTask {
    type Output = u32;

    fn kind(&self) -> &'static str {
        "counting"
    }

    async fn invoke(&self, _handle: &dyn TaskCodec) -> Result<u32, TaskError> {
        self.order.lock().unwrap().push(self.n);
        Ok(self.n)
    }
}

/// Fails unexpectedly for the first `failures` attempts.
pub(crate) struct FlakyTask {
    failures: u32,
    pub(crate) attempts: Arc<AtomicU32>,
    pub(crate) max_attempts: Option<u32>,
}

impl FlakyTask {
    pub(crate) fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Arc::new(AtomicU32::new(0)),
            max_attempts: None,
        }
    }
}

#[async_trait]
impl Task for FlakyTask {
    type Output = ();

    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn invoke(&self, _handle: &dyn TaskCodec) -> Result<(), TaskError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(TaskError::Unexpected(anyhow::anyhow!(
                "attempt {attempt} failed"
            )));
        }
        Ok(())
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}
