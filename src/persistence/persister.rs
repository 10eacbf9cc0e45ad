//! # Resilient Persister
//!
//! Owns the in-memory queue between "something happened" and "it
//! reached the collector". Entries flow Queued → Batched → Sending →
//! {Sent | Requeued-on-failure}: a flush atomically swaps the whole
//! queue out, chunks the batch and delivers it with per-chunk retry and
//! exponential backoff, gated by the circuit breaker. A failed flush
//! re-enqueues the entire original batch at the front so it becomes the
//! retry candidate of the next cycle, bounded by the queue size.
//!
//! Callers are never blocked on the network: `persist` only queues and,
//! at the batch threshold, captures the batch under the queue lock and
//! hands only its delivery to a background task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusEvent, DropReason, EventBus, StreamKind};
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::config::{PersisterConfig, RetryConfig};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::MetricEntry;
use crate::persistence::transport::{ChunkMetadata, ChunkTransport};

/// Explicit outcome of a `persist` call; policy drops are not errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistDisposition {
    Queued,
    Dropped(DropReason),
}

/// Optional pre-send batch transformation (lossy compaction)
pub type BatchCompactor<T> = Box<dyn Fn(Vec<T>) -> Vec<T> + Send + Sync>;

/// Bounded queue with batching, chunked delivery and retry/backoff
pub struct Persister<T> {
    stream: StreamKind,
    circuit: String,
    config: PersisterConfig,
    retry: RetryConfig,
    bus: Arc<EventBus>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn ChunkTransport<T>>,
    compactor: Option<BatchCompactor<T>>,
    queue: Mutex<VecDeque<T>>,
    flush_in_flight: AtomicBool,
}

impl<T> Persister<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        stream: StreamKind,
        config: PersisterConfig,
        retry: RetryConfig,
        bus: Arc<EventBus>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn ChunkTransport<T>>,
        compactor: Option<BatchCompactor<T>>,
    ) -> Arc<Self> {
        let circuit = format!("{}-collector", stream.as_str());
        Arc::new(Self {
            stream,
            circuit,
            config,
            retry,
            bus,
            breaker,
            transport,
            compactor,
            queue: Mutex::new(VecDeque::new()),
            flush_in_flight: AtomicBool::new(false),
        })
    }

    /// Name of the circuit gating this persister's sends
    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Queue one entry for delivery
    ///
    /// An open circuit drops immediately rather than queuing behind a
    /// known-bad collector; a full queue records a circuit error and
    /// drops. Reaching the batch threshold triggers an immediate flush:
    /// the batch is captured synchronously, only delivery runs in the
    /// background.
    pub async fn persist(self: &Arc<Self>, entry: T) -> PipelineResult<PersistDisposition> {
        if self.breaker.is_open(&self.circuit) {
            self.note_dropped(DropReason::CircuitOpen, 1)?;
            return Ok(PersistDisposition::Dropped(DropReason::CircuitOpen));
        }

        let (queue_len, batch) = {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.config.max_queue_size {
                drop(queue);
                self.breaker.record_error(&self.circuit)?;
                self.note_dropped(DropReason::QueueFull, 1)?;
                return Ok(PersistDisposition::Dropped(DropReason::QueueFull));
            }
            queue.push_back(entry);
            let queue_len = queue.len();

            // Threshold crossing: take the batch while the lock is
            // still held, so entries queued after this call land in the
            // fresh queue rather than in the batch being sent.
            let batch = if queue_len == self.config.batch_threshold
                && !self.flush_in_flight.swap(true, Ordering::SeqCst)
            {
                Some(queue.drain(..).collect::<Vec<T>>())
            } else {
                None
            };
            (queue_len, batch)
        };

        self.bus.emit(&self.queued_event(queue_len))?;

        if let Some(batch) = batch {
            debug!(stream = self.stream.as_str(), queue_len, "batch threshold reached");
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let delivered = this.deliver_batch(batch).await;
                this.flush_in_flight.store(false, Ordering::SeqCst);
                if let Err(e) = delivered {
                    warn!(stream = this.stream.as_str(), error = %e, "threshold flush failed");
                }
            });
        }
        Ok(PersistDisposition::Queued)
    }

    /// Deliver everything currently queued
    ///
    /// No-op when the queue is empty, a flush is already in flight, or
    /// the circuit is open. Returns the number of entries delivered.
    pub async fn flush(&self) -> PipelineResult<usize> {
        if self.breaker.is_open(&self.circuit) {
            return Ok(0);
        }
        if self.flush_in_flight.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        // Swap the whole queue out; concurrent arrivals land in the
        // fresh queue, not in the batch being sent.
        let batch: Vec<T> = self.queue.lock().await.drain(..).collect();
        let result = if batch.is_empty() {
            Ok(0)
        } else {
            self.deliver_batch(batch).await
        };
        self.flush_in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Deliver one captured batch: compact, chunk, send with retry. A
    /// failed chunk re-enqueues the entire original batch at the front.
    async fn deliver_batch(&self, batch: Vec<T>) -> PipelineResult<usize> {
        let batch_len = batch.len();

        let to_send = match &self.compactor {
            Some(compact) => compact(batch.clone()),
            None => batch.clone(),
        };

        let total_chunks = to_send.len().div_ceil(self.config.chunk_size);
        for (index, chunk) in to_send.chunks(self.config.chunk_size).enumerate() {
            if index > 0 {
                // Small jittered gap so chunk trains do not burst the
                // transport.
                tokio::time::sleep(Duration::from_millis(10 + fastrand::u64(..40))).await;
            }
            let meta = ChunkMetadata {
                total_chunks,
                chunk_size: self.config.chunk_size,
                chunk_index: index,
            };
            if let Err(error) = self.send_with_retry(chunk, &meta).await {
                self.requeue_front(batch).await?;
                if error.should_trigger_circuit_breaker() {
                    self.breaker.record_error(&self.circuit)?;
                }
                metrics::counter!(
                    "telemetry_flush_failures_total",
                    "stream" => self.stream.as_str().to_string()
                )
                .increment(1);
                return Err(error);
            }
        }

        self.breaker.record_success(&self.circuit)?;
        metrics::counter!(
            "telemetry_flushed_entries_total",
            "stream" => self.stream.as_str().to_string()
        )
        .increment(batch_len as u64);
        self.bus.emit(&self.flushed_event(batch_len))?;
        debug!(stream = self.stream.as_str(), entries = batch_len, total_chunks, "flush complete");
        Ok(batch_len)
    }

    /// Send one chunk with exponential backoff,
    /// `min(base_delay × 2^attempt, max_backoff)` between attempts.
    /// Only retryable failures re-enter the loop; anything else (bad
    /// payload, serialization) fails on the first attempt. At the retry
    /// ceiling a circuit error is recorded and the failure propagates
    /// for requeueing.
    async fn send_with_retry(&self, chunk: &[T], meta: &ChunkMetadata) -> PipelineResult<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.send_chunk(chunk, meta).await {
                Ok(_) => return Ok(()),
                Err(error) => {
                    if !error.is_retryable() {
                        debug!(
                            stream = self.stream.as_str(),
                            error = %error,
                            "chunk send failed with non-retryable error"
                        );
                        return Err(error);
                    }
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        self.breaker.record_error(&self.circuit)?;
                        return Err(PipelineError::RetryExhausted {
                            attempts: attempt,
                            message: error.to_string(),
                        });
                    }
                    let exponent = attempt - 1;
                    let delay = self
                        .retry
                        .base_delay
                        .saturating_mul(1u32 << exponent.min(16))
                        .min(self.retry.max_backoff);
                    debug!(
                        stream = self.stream.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "chunk send failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Re-enqueue a failed batch ahead of everything queued since,
    /// truncating at the queue bound (overflow is dropped loudly).
    async fn requeue_front(&self, batch: Vec<T>) -> PipelineResult<()> {
        let overflow = {
            let mut queue = self.queue.lock().await;
            for entry in batch.into_iter().rev() {
                queue.push_front(entry);
            }
            let overflow = queue.len().saturating_sub(self.config.max_queue_size);
            queue.truncate(self.config.max_queue_size);
            overflow
        };
        if overflow > 0 {
            warn!(stream = self.stream.as_str(), overflow, "requeued batch overflowed the queue bound");
            self.note_dropped(DropReason::QueueOverflow, overflow)?;
        }
        Ok(())
    }

    /// Background loop: periodic flush with multiplicative interval
    /// backoff after failures. Only a flush that actually delivered
    /// resets the interval to baseline; a no-op tick (circuit open,
    /// flush already in flight) keeps the current cadence.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = this.config.flush_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if this.queue_len().await < this.config.min_flush_size
                    || this.flush_in_flight.load(Ordering::SeqCst)
                {
                    continue;
                }
                match this.flush().await {
                    Ok(delivered) if delivered > 0 => interval = this.config.flush_interval,
                    Ok(_) => {}
                    Err(error) => {
                        warn!(stream = this.stream.as_str(), error = %error, "scheduled flush failed");
                        interval = (interval * 2).min(this.config.max_flush_interval);
                    }
                }
            }
        })
    }

    /// Final flush attempt, then discard whatever remains
    pub async fn shutdown(&self) {
        if let Err(error) = self.flush().await {
            warn!(stream = self.stream.as_str(), error = %error, "final flush failed, discarding queue");
        }
        self.queue.lock().await.clear();
    }

    fn queued_event(&self, queue_len: usize) -> BusEvent {
        match self.stream {
            StreamKind::Logs => BusEvent::LogQueued { queue_len },
            StreamKind::Metrics => BusEvent::MetricQueued { queue_len },
        }
    }

    fn flushed_event(&self, count: usize) -> BusEvent {
        match self.stream {
            StreamKind::Logs => BusEvent::LogsFlushed { count },
            StreamKind::Metrics => BusEvent::MetricsFlushed { count },
        }
    }

    fn note_dropped(&self, reason: DropReason, count: usize) -> PipelineResult<()> {
        metrics::counter!(
            "telemetry_dropped_total",
            "stream" => self.stream.as_str().to_string(),
            "reason" => reason.as_str().to_string()
        )
        .increment(count as u64);
        let event = match self.stream {
            StreamKind::Logs => BusEvent::LogDropped { reason, count },
            StreamKind::Metrics => BusEvent::MetricDropped { reason, count },
        };
        self.bus.emit(&event)
    }

    #[cfg(test)]
    pub(crate) async fn queue_snapshot(&self) -> Vec<T> {
        self.queue.lock().await.iter().cloned().collect()
    }
}

/// Pre-send compaction for metric batches: entries sharing
/// category+component+action+type+unit merge into one entry with the
/// values **summed** (not averaged), metadata merged first-wins, and
/// `aggregatedCount` tracking how many observations were folded in.
/// Lossy by design; per-observation values are not recoverable.
pub fn compact_metric_batch(batch: Vec<MetricEntry>) -> Vec<MetricEntry> {
    let mut out: Vec<MetricEntry> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for entry in batch {
        match index.get(&entry.series_key()) {
            Some(&i) => {
                let merged = &mut out[i];
                merged.value += entry.value;
                merged.aggregated_count =
                    Some(merged.aggregated_count.unwrap_or(1) + entry.aggregated_count.unwrap_or(1));
                for (k, v) in entry.metadata {
                    merged.metadata.entry(k).or_insert(v);
                }
            }
            None => {
                index.insert(entry.series_key(), out.len());
                out.push(entry);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventKind, RuntimeMode};
    use crate::core::circuit_breaker::CircuitBreakerConfig;
    use crate::core::types::{LogCategory, LogEntry, LogLevel, MetricType, MetricUnit};
    use crate::persistence::transport::TransportAck;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    /// Transport double: fails the first `fail_times` calls, then
    /// succeeds, recording every chunk it accepted and when each call
    /// arrived.
    struct FlakyTransport {
        fail_times: AtomicUsize,
        calls: AtomicUsize,
        accepted: parking_lot::Mutex<Vec<usize>>,
        call_times: parking_lot::Mutex<Vec<Instant>>,
    }

    impl FlakyTransport {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_times: AtomicUsize::new(times),
                calls: AtomicUsize::new(0),
                accepted: parking_lot::Mutex::new(Vec::new()),
                call_times: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn reliable() -> Arc<Self> {
            Self::failing(0)
        }

        fn accepted_entries(&self) -> usize {
            self.accepted.lock().iter().sum()
        }
    }

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> ChunkTransport<T> for FlakyTransport {
        async fn send_chunk(
            &self,
            chunk: &[T],
            _meta: &ChunkMetadata,
        ) -> PipelineResult<TransportAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().push(Instant::now());
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(PipelineError::transport("injected failure"));
            }
            self.accepted.lock().push(chunk.len());
            Ok(TransportAck { success: true, message: String::new(), batch_id: None })
        }
    }

    fn log_entry(message: &str) -> LogEntry {
        LogEntry {
            level: LogLevel::Info,
            category: LogCategory::Application,
            message: message.to_string(),
            timestamp: Utc::now(),
            user_id: None,
            metadata: HashMap::new(),
        }
    }

    fn metric_entry(action: &str, value: f64) -> MetricEntry {
        MetricEntry {
            category: "checkout".into(),
            component: "cart".into(),
            action: action.into(),
            value,
            metric_type: MetricType::Counter,
            unit: MetricUnit::Count,
            reference: format!("ref-{action}-{value}"),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            aggregated_count: None,
        }
    }

    fn harness(
        config: PersisterConfig,
        retry: RetryConfig,
        transport: Arc<dyn ChunkTransport<LogEntry>>,
    ) -> (Arc<Persister<LogEntry>>, Arc<EventBus>, Arc<CircuitBreaker>) {
        harness_with_breaker(config, retry, transport, CircuitBreakerConfig::default())
    }

    fn harness_with_breaker(
        config: PersisterConfig,
        retry: RetryConfig,
        transport: Arc<dyn ChunkTransport<LogEntry>>,
        breaker_config: CircuitBreakerConfig,
    ) -> (Arc<Persister<LogEntry>>, Arc<EventBus>, Arc<CircuitBreaker>) {
        let bus = Arc::new(EventBus::new(RuntimeMode::Development));
        let breaker = Arc::new(CircuitBreaker::new(breaker_config, Arc::clone(&bus)));
        let persister = Persister::new(
            StreamKind::Logs,
            config,
            retry,
            Arc::clone(&bus),
            Arc::clone(&breaker),
            transport,
            None,
        );
        (persister, bus, breaker)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn queue_never_grows_past_its_bound() {
        let config = PersisterConfig {
            max_queue_size: 5,
            batch_threshold: 100,
            ..PersisterConfig::default()
        };
        let (persister, bus, breaker) = harness(config, fast_retry(), FlakyTransport::reliable());

        let drops = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&drops);
        bus.on(EventKind::LogDropped, move |event| {
            if let BusEvent::LogDropped { reason, .. } = event {
                assert_eq!(*reason, DropReason::QueueFull);
            }
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for i in 0..7 {
            let disposition = persister.persist(log_entry(&format!("e{i}"))).await.unwrap();
            if i < 5 {
                assert_eq!(disposition, PersistDisposition::Queued);
            } else {
                assert_eq!(disposition, PersistDisposition::Dropped(DropReason::QueueFull));
            }
        }

        assert_eq!(persister.queue_len().await, 5);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        // Each rejected enqueue counted against the circuit.
        assert_eq!(breaker.error_count(persister.circuit()), 2);
    }

    #[tokio::test]
    async fn open_circuit_drops_without_touching_the_queue() {
        let (persister, bus, breaker) =
            harness(PersisterConfig::default(), fast_retry(), FlakyTransport::reliable());
        for _ in 0..3 {
            breaker.record_error(persister.circuit()).unwrap();
        }
        assert!(breaker.is_open(persister.circuit()));

        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let r = Arc::clone(&reasons);
        bus.on(EventKind::LogDropped, move |event| {
            if let BusEvent::LogDropped { reason, .. } = event {
                r.lock().push(*reason);
            }
            Ok(())
        });

        let disposition = persister.persist(log_entry("gated")).await.unwrap();
        assert_eq!(disposition, PersistDisposition::Dropped(DropReason::CircuitOpen));
        assert_eq!(persister.queue_len().await, 0);
        assert_eq!(*reasons.lock(), vec![DropReason::CircuitOpen]);
    }

    #[tokio::test]
    async fn threshold_triggers_exactly_one_automatic_flush() {
        let transport = FlakyTransport::reliable();
        let config = PersisterConfig {
            max_queue_size: 500,
            batch_threshold: 100,
            chunk_size: 25,
            ..PersisterConfig::default()
        };
        let (persister, _, _) = harness(config, fast_retry(), transport.clone());

        for i in 0..120 {
            persister.persist(log_entry(&format!("e{i}"))).await.unwrap();
        }

        // The batch is captured at the 100th entry, before the 20 that
        // follow it, so those 20 stay queued for the next cycle.
        assert_eq!(persister.queue_len().await, 20);

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.accepted_entries() < 100 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.accepted_entries(), 100);
        assert_eq!(persister.queue_len().await, 20);
        // 100 entries at chunk_size 25: four chunk sends, one flush.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_backs_off_exponentially_then_succeeds() {
        let transport = FlakyTransport::failing(2);
        let (persister, _, breaker) =
            harness(PersisterConfig::default(), fast_retry(), transport.clone());

        persister.persist(log_entry("retry-me")).await.unwrap();

        let started = Instant::now();
        let flushed = persister.flush().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(flushed, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        // Two backoffs: ~50ms then ~100ms.
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
        // Success on the third attempt: no circuit error recorded.
        assert_eq!(breaker.error_count(persister.circuit()), 0);
    }

    #[tokio::test]
    async fn failed_flush_requeues_batch_at_the_front_in_order() {
        let transport = FlakyTransport::failing(usize::MAX / 2);
        let retry = RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        let (persister, _, breaker) =
            harness(PersisterConfig::default(), retry, transport.clone());

        for name in ["a", "b", "c"] {
            persister.persist(log_entry(name)).await.unwrap();
        }

        let error = persister.flush().await.unwrap_err();
        assert!(matches!(error, PipelineError::RetryExhausted { .. }));

        let snapshot = persister.queue_snapshot().await;
        let messages: Vec<&str> = snapshot.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        // Retry ceiling plus the flush failure both counted.
        assert_eq!(breaker.error_count(persister.circuit()), 2);
    }

    #[tokio::test]
    async fn flush_is_a_noop_when_circuit_is_open_or_queue_empty() {
        let transport = FlakyTransport::reliable();
        let (persister, _, breaker) =
            harness(PersisterConfig::default(), fast_retry(), transport.clone());

        assert_eq!(persister.flush().await.unwrap(), 0);

        persister.persist(log_entry("held")).await.unwrap();
        for _ in 0..3 {
            breaker.record_error(persister.circuit()).unwrap();
        }
        assert_eq!(persister.flush().await.unwrap(), 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(persister.queue_len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_flush_interval_doubles_on_failure_and_resets_on_delivery() {
        let transport = FlakyTransport::failing(2);
        let config = PersisterConfig {
            flush_interval: Duration::from_millis(50),
            max_flush_interval: Duration::from_millis(400),
            min_flush_size: 1,
            ..PersisterConfig::default()
        };
        let retry = RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        // Generous error budget so the circuit stays closed while the
        // scheduled flushes fail.
        let breaker_config = CircuitBreakerConfig {
            max_errors: 100,
            ..CircuitBreakerConfig::default()
        };
        let (persister, _, _) =
            harness_with_breaker(config, retry, transport.clone(), breaker_config);

        persister.persist(log_entry("stubborn")).await.unwrap();
        let cancel = CancellationToken::new();
        let worker = persister.start(cancel.clone());

        // Two failed ticks double the cadence each time: sends land at
        // ~50ms, ~150ms and ~350ms, and the third one delivers.
        tokio::time::sleep(Duration::from_millis(360)).await;
        {
            let times = transport.call_times.lock();
            assert_eq!(times.len(), 3, "expected three scheduled sends");
            let first_gap = times[1] - times[0];
            let second_gap = times[2] - times[1];
            assert!(
                first_gap >= Duration::from_millis(95) && first_gap <= Duration::from_millis(140),
                "first gap {first_gap:?}"
            );
            assert!(
                second_gap >= Duration::from_millis(190) && second_gap <= Duration::from_millis(240),
                "second gap {second_gap:?}"
            );
        }
        assert_eq!(persister.queue_len().await, 0);

        // The delivering flush resets the cadence to baseline.
        persister.persist(log_entry("after recovery")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        {
            let times = transport.call_times.lock();
            assert_eq!(times.len(), 4, "expected one more send at baseline cadence");
            let recovered_gap = times[3] - times[2];
            assert!(recovered_gap <= Duration::from_millis(80), "recovered gap {recovered_gap:?}");
        }

        cancel.cancel();
        let _ = worker.await;
    }

    /// Transport double that rejects every chunk with a payload error.
    struct BrokenPayloadTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChunkTransport<LogEntry> for BrokenPayloadTransport {
        async fn send_chunk(
            &self,
            _chunk: &[LogEntry],
            _meta: &ChunkMetadata,
        ) -> PipelineResult<TransportAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::Serialization { message: "unencodable entry".into() })
        }
    }

    #[tokio::test]
    async fn non_retryable_failures_skip_the_retry_loop() {
        let transport = Arc::new(BrokenPayloadTransport { calls: AtomicUsize::new(0) });
        let (persister, _, breaker) =
            harness(PersisterConfig::default(), fast_retry(), transport.clone());

        persister.persist(log_entry("bad payload")).await.unwrap();
        let error = persister.flush().await.unwrap_err();

        assert!(matches!(error, PipelineError::Serialization { .. }));
        // One attempt despite a three-attempt budget, and a payload
        // error counts nothing against the circuit.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.error_count(persister.circuit()), 0);
        // The batch is back at the front for the next cycle.
        assert_eq!(persister.queue_len().await, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_then_clears() {
        let transport = FlakyTransport::reliable();
        let (persister, _, _) =
            harness(PersisterConfig::default(), fast_retry(), transport.clone());

        persister.persist(log_entry("last words")).await.unwrap();
        persister.shutdown().await;

        assert_eq!(transport.accepted_entries(), 1);
        assert_eq!(persister.queue_len().await, 0);
    }

    #[test]
    fn metric_compaction_sums_values_per_series() {
        let mut tagged = metric_entry("add", 2.0);
        tagged.metadata.insert("region".into(), serde_json::json!("us-east"));

        let batch = vec![
            metric_entry("add", 1.0),
            tagged,
            metric_entry("add", 4.0),
            metric_entry("remove", 10.0),
        ];
        let compacted = compact_metric_batch(batch);

        assert_eq!(compacted.len(), 2);
        let add = compacted.iter().find(|m| m.action == "add").unwrap();
        // Summed, not averaged.
        assert_eq!(add.value, 7.0);
        assert_eq!(add.aggregated_count, Some(3));
        assert_eq!(add.metadata["region"], "us-east");

        let remove = compacted.iter().find(|m| m.action == "remove").unwrap();
        assert_eq!(remove.value, 10.0);
        assert_eq!(remove.aggregated_count, None);
    }

    #[test]
    fn different_types_or_units_never_merge() {
        let mut gauge = metric_entry("add", 5.0);
        gauge.metric_type = MetricType::Gauge;
        let compacted = compact_metric_batch(vec![metric_entry("add", 1.0), gauge]);
        assert_eq!(compacted.len(), 2);
    }
}
