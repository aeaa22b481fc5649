//! Outbound queue and retry engine
//!
//! All outgoing requests go through one FIFO queue drained by a single worker,
//! so exactly one request is in flight at a time. A request that times out or
//! fails to send is retried in place after `retry_delay`, which keeps it ahead
//! of everything queued behind it. After `max_retries` retries it is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::correlator::Correlator;
use super::messages::{Action, Call, CallResult, ErrorCode, OcppError, OcppMessage};
use super::transport::Transport;

/// Retry and timeout settings for the worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub reply_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// Final fate of a queued request
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Correlated CALLRESULT received
    Acknowledged(CallResult),
    /// CSMS answered with a CALLERROR; not retried
    Rejected { code: ErrorCode, description: String },
    /// Retries exhausted or worker cancelled
    Abandoned,
}

impl DeliveryOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, DeliveryOutcome::Acknowledged(_))
    }
}

/// Request waiting in the queue
#[derive(Debug)]
struct OutboundRequest {
    message_id: String,
    action: Action,
    /// Serialized once so every retry carries the same message id
    frame: String,
    transaction_id: Option<String>,
    retry_count: u32,
    notify: Option<oneshot::Sender<DeliveryOutcome>>,
}

/// FIFO of outgoing requests with a single delivery worker
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<OutboundRequest>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<OutboundRequest>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl OutboundQueue {
    pub fn new(
        transport: Arc<Transport>,
        correlator: Arc<Correlator>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            worker: parking_lot::Mutex::new(None),
            transport,
            correlator,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Queue a request; its outcome is only logged
    pub fn submit(&self, call: Call, transaction_id: Option<String>) -> Result<(), OcppError> {
        self.push(call, transaction_id, None)
    }

    /// Queue a request and get its final outcome
    pub fn submit_tracked(
        &self,
        call: Call,
        transaction_id: Option<String>,
    ) -> Result<oneshot::Receiver<DeliveryOutcome>, OcppError> {
        let (notify_tx, notify_rx) = oneshot::channel();
        self.push(call, transaction_id, Some(notify_tx))?;
        Ok(notify_rx)
    }

    fn push(
        &self,
        call: Call,
        transaction_id: Option<String>,
        notify: Option<oneshot::Sender<DeliveryOutcome>>,
    ) -> Result<(), OcppError> {
        let message_id = call.message_id.clone();
        let action = call.action.clone();
        let frame = OcppMessage::Call(call).to_text()?;

        self.tx
            .send(OutboundRequest {
                message_id,
                action,
                frame,
                transaction_id,
                retry_count: 0,
                notify,
            })
            .map_err(|_| OcppError::ConnectionClosed)
    }

    /// Start the worker unless one is already running
    pub fn ensure_running(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        debug!("Starting outbound queue worker");
        *worker = Some(tokio::spawn(run_worker(
            self.rx.clone(),
            self.transport.clone(),
            self.correlator.clone(),
            self.policy,
            self.cancel.clone(),
        )));
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

async fn run_worker(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<OutboundRequest>>>,
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    let mut rx = rx.lock().await;

    loop {
        let mut request = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let notify = request.notify.take();
        let message_id = request.message_id.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                info!(message_id = %message_id, "Abandoning in-flight request on shutdown");
                DeliveryOutcome::Abandoned
            }
            outcome = deliver(&mut request, &transport, &correlator, &policy) => outcome,
        };

        if let Some(notify) = notify {
            let _ = notify.send(outcome);
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    debug!("Outbound queue worker stopped");
}

async fn deliver(
    request: &mut OutboundRequest,
    transport: &Transport,
    correlator: &Correlator,
    policy: &RetryPolicy,
) -> DeliveryOutcome {
    loop {
        match attempt(request, transport, correlator, policy).await {
            Ok(result) => return DeliveryOutcome::Acknowledged(result),
            Err(OcppError::RemoteError {
                code, description, ..
            }) => {
                warn!(
                    message_id = %request.message_id,
                    action = %request.action,
                    "Request rejected by CSMS"
                );
                return DeliveryOutcome::Rejected { code, description };
            }
            Err(e) => {
                request.retry_count += 1;

                if request.retry_count > policy.max_retries {
                    warn!(
                        message_id = %request.message_id,
                        action = %request.action,
                        attempts = request.retry_count,
                        error = %e,
                        "Dropping request after exhausting retries"
                    );
                    return DeliveryOutcome::Abandoned;
                }

                warn!(
                    message_id = %request.message_id,
                    action = %request.action,
                    attempt = request.retry_count,
                    max_retries = policy.max_retries,
                    delay_ms = policy.retry_delay.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
        }
    }
}

async fn attempt(
    request: &OutboundRequest,
    transport: &Transport,
    correlator: &Correlator,
    policy: &RetryPolicy,
) -> Result<CallResult, OcppError> {
    let reply_rx = correlator.register(
        &request.message_id,
        request.action.clone(),
        request.transaction_id.clone(),
    );

    if let Err(e) = transport.send(request.frame.clone()).await {
        correlator.forget(&request.message_id);
        return Err(e.into());
    }

    match tokio::time::timeout(policy.reply_timeout, reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => Err(OcppError::ConnectionClosed),
        Err(_) => {
            correlator.forget(&request.message_id);
            Err(OcppError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::pricing::PriceBoard;
    use crate::ocpp::transport::{ChannelError, Dialer, FrameSink, FrameStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Dialer whose CSMS side is a pair of channels held by the test
    struct ScriptedDialer {
        dials: AtomicUsize,
        refuse: AtomicBool,
        peers: mpsc::UnboundedSender<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self) -> Result<(FrameSink, FrameStream), ChannelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ChannelError::Connect("refused".into()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
            let _ = self.peers.send((out_rx, in_tx));

            let sink = futures_util::sink::unfold(out_tx, |tx, frame: String| async move {
                tx.send(frame).map_err(|_| ChannelError::Closed)?;
                Ok::<_, ChannelError>(tx)
            });
            let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|frame| (Ok(frame), rx))
            });
            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }

    struct Harness {
        dialer: Arc<ScriptedDialer>,
        peers: mpsc::UnboundedReceiver<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>,
        transport: Arc<Transport>,
        queue: OutboundQueue,
        cancel: CancellationToken,
    }

    fn harness(refuse: bool) -> Harness {
        let (peer_tx, peers) = mpsc::unbounded_channel();
        let dialer = Arc::new(ScriptedDialer {
            dials: AtomicUsize::new(0),
            refuse: AtomicBool::new(refuse),
            peers: peer_tx,
        });
        let transport = Arc::new(Transport::new(dialer.clone()));
        let correlator = Arc::new(Correlator::new(Arc::new(PriceBoard::new())));
        let cancel = CancellationToken::new();

        // Receive loop feeding the correlator
        {
            let transport = transport.clone();
            let correlator = correlator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = transport.receive() => {
                            if let Ok(text) = frame {
                                correlator.on_frame(&text);
                            }
                        }
                    }
                }
            });
        }

        let queue = OutboundQueue::new(
            transport.clone(),
            correlator,
            RetryPolicy::default(),
            cancel.clone(),
        );

        Harness {
            dialer,
            peers,
            transport,
            queue,
            cancel,
        }
    }

    fn message_id_of(frame: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        value[1].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_acknowledged_by_matching_reply() {
        let mut h = harness(false);
        assert!(h.transport.connect().await);
        h.queue.ensure_running();
        let (mut from_cp, to_cp) = h.peers.recv().await.unwrap();

        let outcome = h
            .queue
            .submit_tracked(Call::heartbeat().unwrap(), None)
            .unwrap();

        let frame = from_cp.recv().await.unwrap();
        let id = message_id_of(&frame);
        to_cp
            .send(format!(r#"[3,"{}",{{"currentTime":"2024-01-01T00:00:00Z"}}]"#, id))
            .unwrap();

        assert!(outcome.await.unwrap().is_acknowledged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_abandons() {
        let h = harness(true);
        h.queue.ensure_running();

        let started = Instant::now();
        let outcome = h
            .queue
            .submit_tracked(Call::heartbeat().unwrap(), None)
            .unwrap();

        assert!(matches!(outcome.await.unwrap(), DeliveryOutcome::Abandoned));
        // One attempt plus three retries, two seconds apart
        assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_reply_does_not_acknowledge() {
        let mut h = harness(false);
        assert!(h.transport.connect().await);
        h.queue.ensure_running();
        let (mut from_cp, to_cp) = h.peers.recv().await.unwrap();

        let outcome = h
            .queue
            .submit_tracked(Call::heartbeat().unwrap(), None)
            .unwrap();

        let first = from_cp.recv().await.unwrap();
        to_cp.send(r#"[3,"msg-unrelated",{}]"#.to_string()).unwrap();

        // Retry carries the same frame after the reply timeout and retry delay
        let retry = from_cp.recv().await.unwrap();
        assert_eq!(first, retry);

        to_cp
            .send(format!(r#"[3,"{}",{{}}]"#, message_id_of(&retry)))
            .unwrap();
        assert!(outcome.await.unwrap().is_acknowledged());
    }

    #[tokio::test]
    async fn test_call_error_is_not_retried() {
        let mut h = harness(false);
        assert!(h.transport.connect().await);
        h.queue.ensure_running();
        let (mut from_cp, to_cp) = h.peers.recv().await.unwrap();

        let outcome = h
            .queue
            .submit_tracked(Call::heartbeat().unwrap(), None)
            .unwrap();

        let id = message_id_of(&from_cp.recv().await.unwrap());
        to_cp
            .send(format!(r#"[4,"{}","InternalError","boom",{{}}]"#, id))
            .unwrap();

        match outcome.await.unwrap() {
            DeliveryOutcome::Rejected { code, .. } => assert_eq!(code, ErrorCode::InternalError),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_request_in_flight() {
        let mut h = harness(false);
        assert!(h.transport.connect().await);
        h.queue.ensure_running();
        let (mut from_cp, to_cp) = h.peers.recv().await.unwrap();

        let first = h.queue.submit_tracked(Call::heartbeat().unwrap(), None).unwrap();
        let second = h.queue.submit_tracked(Call::heartbeat().unwrap(), None).unwrap();

        let frame = from_cp.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert!(from_cp.try_recv().is_err());

        to_cp.send(format!(r#"[3,"{}",{{}}]"#, message_id_of(&frame))).unwrap();
        assert!(first.await.unwrap().is_acknowledged());

        let frame = from_cp.recv().await.unwrap();
        to_cp.send(format!(r#"[3,"{}",{{}}]"#, message_id_of(&frame))).unwrap();
        assert!(second.await.unwrap().is_acknowledged());
    }

    #[tokio::test]
    async fn test_cancel_abandons_in_flight() {
        let mut h = harness(false);
        assert!(h.transport.connect().await);
        h.queue.ensure_running();
        let (mut from_cp, _to_cp) = h.peers.recv().await.unwrap();

        let outcome = h.queue.submit_tracked(Call::heartbeat().unwrap(), None).unwrap();
        from_cp.recv().await.unwrap();

        h.cancel.cancel();
        assert!(matches!(outcome.await.unwrap(), DeliveryOutcome::Abandoned));
    }
}
