//! Request admission and sequencing.
//!
//! The upstream chat page can run exactly one generation at a time, so all
//! API requests funnel through a single-consumer loop guarded by a
//! processing lock. Waiting requests are re-scanned for client disconnects
//! before every dequeue, connectivity is re-checked around lock
//! acquisition, and quota-exceeded signals are handed to the rotation
//! controller before any further request is consumed. Each in-flight
//! request gets a disconnect watcher task that pre-empts a hung completion
//! wait; watchers are aborted on completion, never leaked.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use chatbridge_core::{
    BrowserPort, CoordinationContext, DisconnectProbe, EventQueue, NormalizedEvent, QuotaFailure,
    QuotaSignal, RotationController, StreamConfig, StreamConsumer, StreamSession, TerminalReason,
};

/// Idle poll interval for the consumer loop and disconnect watchers.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Client-liveness flag shared between an HTTP response and its watcher.
///
/// The guard half lives inside the response stream; axum drops it when the
/// client goes away, which flips the probe half to disconnected.
pub fn client_pair() -> (ClientGuard, Arc<ClientProbe>) {
    let probe = Arc::new(ClientProbe {
        connected: AtomicBool::new(true),
    });
    (
        ClientGuard {
            probe: probe.clone(),
        },
        probe,
    )
}

/// Probe half of a client-liveness pair.
pub struct ClientProbe {
    connected: AtomicBool,
}

impl DisconnectProbe for ClientProbe {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Guard half of a client-liveness pair. Dropping it marks the client
/// disconnected.
pub struct ClientGuard {
    probe: Arc<ClientProbe>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.probe.connected.store(false, Ordering::SeqCst);
    }
}

struct QueuedRequest {
    id: String,
    prompt: String,
    prompt_tokens: u64,
    probe: Arc<dyn DisconnectProbe>,
    events: mpsc::UnboundedSender<NormalizedEvent>,
}

/// Single-consumer request sequencer.
pub struct RequestCoordinator {
    ctx: Arc<CoordinationContext>,
    browser: Arc<dyn BrowserPort>,
    rotation: Arc<RotationController>,
    queue: EventQueue,
    stream_config: StreamConfig,
    waiting: Mutex<VecDeque<QueuedRequest>>,
    wakeup: Notify,
    /// One generation at a time.
    processing: Mutex<()>,
    next_id: AtomicU64,
}

impl RequestCoordinator {
    /// Creates a coordinator over the decoded-event queue.
    pub fn new(
        ctx: Arc<CoordinationContext>,
        browser: Arc<dyn BrowserPort>,
        rotation: Arc<RotationController>,
        queue: EventQueue,
        stream_config: StreamConfig,
    ) -> Self {
        Self {
            ctx,
            browser,
            rotation,
            queue,
            stream_config,
            waiting: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            processing: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueues a request and returns the stream of normalized events for
    /// it. The channel closes without a terminal event if the request is
    /// cancelled before processing starts.
    pub async fn submit(
        &self,
        prompt: String,
        prompt_tokens: u64,
        probe: Arc<dyn DisconnectProbe>,
    ) -> (String, mpsc::UnboundedReceiver<NormalizedEvent>) {
        let id = format!(
            "chatcmpl-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = mpsc::unbounded_channel();

        self.ctx.inc_queued();
        self.waiting.lock().await.push_back(QueuedRequest {
            id: id.clone(),
            prompt,
            prompt_tokens,
            probe,
            events: tx,
        });
        self.wakeup.notify_one();
        debug!(id = %id, queued = self.ctx.queued_requests(), "request queued");
        (id, rx)
    }

    /// Runs the consumer loop until shutdown.
    pub async fn run(&self) {
        loop {
            if self.ctx.is_shutdown() {
                self.fail_waiting(TerminalReason::GlobalShutdown).await;
                info!("request coordinator stopped");
                return;
            }

            // Quota exhaustion observed: recover before consuming anything
            // further.
            if self.ctx.quota_exceeded() && !self.ctx.is_emergency_locked() {
                let failure = classify_failure(self.ctx.quota_signal());
                if let Err(e) = self.rotation.rotate(failure).await {
                    warn!(error = %e, "rotation failed");
                    if self.ctx.is_emergency_locked() {
                        // Pool depleted; nothing queued can be served.
                        self.fail_waiting(TerminalReason::RotationExhausted).await;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            }

            let next = {
                let mut waiting = self.waiting.lock().await;
                waiting.retain(|request| {
                    if request.probe.is_connected() {
                        true
                    } else {
                        debug!(id = %request.id, "dropping disconnected request from queue");
                        self.ctx.dec_queued();
                        false
                    }
                });
                waiting.pop_front()
            };

            let Some(request) = next else {
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                continue;
            };

            self.ctx.dec_queued();
            self.process(request).await;
        }
    }

    async fn process(&self, request: QueuedRequest) {
        if !request.probe.is_connected() {
            debug!(id = %request.id, "client gone before processing");
            return;
        }

        let _processing = self.processing.lock().await;

        // The client may have left while we waited for the lock.
        if !request.probe.is_connected() {
            debug!(id = %request.id, "client gone while awaiting processing lock");
            return;
        }

        // Hold at the rotation gate; in-flight recovery restores service.
        while !self.ctx.wait_rotation_open(POLL_INTERVAL).await {
            if self.ctx.is_shutdown() {
                let _ = request.events.send(NormalizedEvent::Terminal {
                    reason: TerminalReason::GlobalShutdown,
                });
                return;
            }
            if !request.probe.is_connected() {
                return;
            }
        }

        // Claim the active-stream slot; any prior session observing the
        // change aborts as a zombie.
        self.ctx.claim_active(&request.id);
        self.queue.drain();

        let session = StreamSession::new(&request.id, unix_now());
        if let Err(e) = self.browser.submit_prompt(&request.prompt).await {
            warn!(id = %request.id, error = %e, "prompt submission failed");
            self.ctx.release_active(&request.id);
            return;
        }
        info!(id = %request.id, "generation started");

        // Watcher: a vanished client frees the active slot so the consumer
        // exits on its next tick instead of waiting out its timeouts.
        let watcher = {
            let ctx = self.ctx.clone();
            let probe = request.probe.clone();
            let id = request.id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    if !probe.is_connected() {
                        debug!(id = %id, "client disconnected mid-generation");
                        ctx.release_active(&id);
                        return;
                    }
                }
            })
        };

        // Forward events to the handler while counting completion text for
        // usage accounting.
        let (itx, mut irx) = mpsc::unbounded_channel::<NormalizedEvent>();
        let forwarder = {
            let events = request.events.clone();
            tokio::spawn(async move {
                let mut chars: u64 = 0;
                while let Some(event) = irx.recv().await {
                    if let NormalizedEvent::BodyDelta(text) = &event {
                        chars += text.chars().count() as u64;
                    }
                    let _ = events.send(event);
                }
                chars
            })
        };

        let consumer = StreamConsumer::new(
            self.ctx.clone(),
            self.browser.clone(),
            self.stream_config.clone(),
        );
        let reason = consumer.run(&self.queue, session, &itx).await;
        drop(itx);

        watcher.abort();
        let completion_chars = forwarder.await.unwrap_or(0);
        self.ctx.release_active(&request.id);

        let tokens = request.prompt_tokens + completion_chars.div_ceil(4);
        self.rotation.record_usage(tokens).await;
        info!(id = %request.id, %reason, tokens, "generation finished");
    }

    async fn fail_waiting(&self, reason: TerminalReason) {
        let mut waiting = self.waiting.lock().await;
        while let Some(request) = waiting.pop_front() {
            self.ctx.dec_queued();
            let _ = request
                .events
                .send(NormalizedEvent::Terminal { reason });
        }
    }
}

/// Maps the quota signal text onto a failure class. "Rate" phrasing means a
/// short-lived limit; anything else is treated as the daily hard quota.
fn classify_failure(signal: Option<QuotaSignal>) -> QuotaFailure {
    match signal {
        Some(s) if s.matched_text.to_lowercase().contains("rate") => QuotaFailure::RateLimit,
        _ => QuotaFailure::HardQuota,
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
