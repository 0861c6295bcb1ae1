//! The receive loop.
//!
//! One update at a time: sidecar start, dispatch, publish, sidecar end. Only
//! broker-level errors leave the loop; the source and sink are closed on
//! every exit path before `run` returns.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    dispatcher::Dispatcher,
    ports::{Delivery, RecordPosition, ResponseSink, SidecarNotifier, UpdateSource},
    update::InboundRecord,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Source and sink are open; the loop has not started.
    Connected,
    Running,
    ShuttingDown,
    Terminated,
}

/// Per-process counters, reported at shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub responded: u64,
    pub unhandled: u64,
    pub failed: u64,
    pub malformed: u64,
}

/// Start/end of one update's handling.
#[derive(Debug)]
pub struct ProcessingSpan {
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl ProcessingSpan {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

pub struct Worker<S, P> {
    cfg: Arc<Config>,
    source: S,
    sink: P,
    sidecar: Arc<dyn SidecarNotifier>,
    dispatcher: Dispatcher,
    state: watch::Sender<LifecycleState>,
    stats: LoopStats,
}

impl<S: UpdateSource, P: ResponseSink> Worker<S, P> {
    pub fn new(cfg: Arc<Config>, source: S, sink: P, sidecar: Arc<dyn SidecarNotifier>) -> Self {
        let dispatcher = Dispatcher::new(&cfg);
        Self {
            cfg,
            source,
            sink,
            sidecar,
            dispatcher,
            state: watch::Sender::new(LifecycleState::Connected),
            stats: LoopStats::default(),
        }
    }

    /// Follow lifecycle transitions, including after `run` has consumed the worker.
    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Drive the loop until `cancel` fires (`Ok`) or the broker fails (`Err`).
    pub async fn run(mut self, cancel: CancellationToken) -> Result<LoopStats> {
        self.transition(LifecycleState::Running);
        tracing::info!("Bot worker ready, waiting for messages...");

        let outcome = self.receive_loop(&cancel).await;
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "broker failure, stopping worker");
        }

        self.shutdown().await;
        outcome.map(|()| self.stats)
    }

    async fn receive_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                d = self.source.next_delivery() => d?,
            };
            self.handle(delivery).await?;
        }
    }

    async fn handle(&mut self, delivery: Delivery) -> Result<()> {
        let span = ProcessingSpan::start();
        self.sidecar.notify_start().await;

        let outcome = self.process(delivery).await;

        let elapsed = span.elapsed();
        tracing::debug!(started_at = %span.started_at, ?elapsed, "update handled");
        self.sidecar.notify_end(elapsed).await;
        outcome
    }

    async fn process(&mut self, delivery: Delivery) -> Result<()> {
        let (position, record) = match delivery {
            Delivery::Record { position, record } => (position, record),
            Delivery::Malformed { position, reason } => {
                self.stats.malformed += 1;
                tracing::warn!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    %reason,
                    "skipping malformed record"
                );
                return Ok(());
            }
        };

        self.stats.received += 1;
        self.check_bot_id(&record, &position);

        let cmd = match self.dispatcher.dispatch(&record.update) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                self.stats.unhandled += 1;
                return Ok(());
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::error!(offset = position.offset, error = %e, "Error processing message");
                return Ok(());
            }
        };

        match self.sink.publish(&self.cfg.bot_id, &cmd).await {
            Ok(()) => {
                self.stats.responded += 1;
                tracing::info!(method = cmd.method, "sent response");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.stats.failed += 1;
                tracing::error!(method = cmd.method, error = %e, "failed to publish response");
                Ok(())
            }
        }
    }

    fn check_bot_id(&self, record: &InboundRecord, position: &RecordPosition) {
        if let Some(bot_id) = record.bot_id.as_deref() {
            if bot_id != self.cfg.bot_id {
                tracing::warn!(
                    expected = %self.cfg.bot_id,
                    got = bot_id,
                    offset = position.offset,
                    "record addressed to a different bot"
                );
            }
        }
    }

    async fn shutdown(&mut self) {
        self.transition(LifecycleState::ShuttingDown);

        if let Err(e) = self.source.close().await {
            tracing::warn!(error = %e, "failed to close consumer");
        }
        if let Err(e) = self.sink.close(self.cfg.shutdown_timeout).await {
            tracing::warn!(error = %e, "failed to close producer");
        }

        let s = self.stats;
        tracing::info!(
            received = s.received,
            responded = s.responded,
            unhandled = s.unhandled,
            failed = s.failed,
            malformed = s.malformed,
            "worker stopped"
        );
        self.transition(LifecycleState::Terminated);
    }

    fn transition(&mut self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        tracing::debug!(from = ?prev, to = ?next, "lifecycle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::OutboundCommand, Error};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn test_config() -> Config {
        Config {
            bot_id: "bot-1".to_string(),
            bot_token: "tok".to_string(),
            kafka_brokers: vec!["localhost:9092".to_string()],
            incoming_topic: "in".to_string(),
            outgoing_topic: "out".to_string(),
            consumer_group: "g".to_string(),
            auto_offset_reset: crate::config::OffsetReset::Earliest,
            publish_timeout: Duration::from_secs(1),
            sidecar_url: "http://localhost:8081".to_string(),
            sidecar_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn record(json: serde_json::Value, offset: i64) -> Result<Delivery> {
        Ok(Delivery::Record {
            position: RecordPosition {
                topic: "in".to_string(),
                partition: 0,
                offset,
            },
            record: serde_json::from_value(json).unwrap(),
        })
    }

    /// Replays scripted deliveries, then idles forever.
    struct FakeSource {
        script: VecDeque<Result<Delivery>>,
        closed: Arc<Mutex<bool>>,
    }

    impl FakeSource {
        fn new(script: Vec<Result<Delivery>>) -> (Self, Arc<Mutex<bool>>) {
            let closed = Arc::new(Mutex::new(false));
            (
                Self {
                    script: script.into(),
                    closed: closed.clone(),
                },
                closed,
            )
        }
    }

    #[async_trait]
    impl UpdateSource for FakeSource {
        async fn next_delivery(&mut self) -> Result<Delivery> {
            match self.script.pop_front() {
                Some(d) => d,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[derive(Default)]
    struct SinkLog {
        published: Vec<(String, serde_json::Value)>,
        closed: bool,
    }

    struct FakeSink {
        log: Arc<Mutex<SinkLog>>,
        failures: VecDeque<Option<Error>>,
    }

    impl FakeSink {
        fn new(failures: Vec<Option<Error>>) -> (Self, Arc<Mutex<SinkLog>>) {
            let log = Arc::new(Mutex::new(SinkLog::default()));
            (
                Self {
                    log: log.clone(),
                    failures: failures.into(),
                },
                log,
            )
        }
    }

    #[async_trait]
    impl ResponseSink for FakeSink {
        async fn publish(&mut self, key: &str, cmd: &OutboundCommand) -> Result<()> {
            if let Some(Some(e)) = self.failures.pop_front() {
                return Err(e);
            }
            self.log
                .lock()
                .unwrap()
                .published
                .push((key.to_string(), serde_json::to_value(cmd).unwrap()));
            Ok(())
        }

        async fn close(&mut self, _timeout: Duration) -> Result<()> {
            self.log.lock().unwrap().closed = true;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSidecar {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl SidecarNotifier for RecordingSidecar {
        async fn notify_start(&self) {
            self.events.lock().unwrap().push("start");
        }

        async fn notify_end(&self, _duration: Duration) {
            self.events.lock().unwrap().push("end");
        }
    }

    /// Behaves like a sidecar that always times out: slow, and silent about it.
    struct UnreachableSidecar;

    #[async_trait]
    impl SidecarNotifier for UnreachableSidecar {
        async fn notify_start(&self) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        async fn notify_end(&self, _duration: Duration) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn text_update(id: i64, text: &str) -> serde_json::Value {
        serde_json::json!({
            "bot_id": "bot-1",
            "update": {"update_id": id, "message": {"text": text, "chat": {"id": 42}, "message_id": 7}}
        })
    }

    /// Cancel once every scripted delivery has been handled.
    async fn run_until_idle<S: UpdateSource, P: ResponseSink>(
        worker: Worker<S, P>,
        sidecar: &RecordingSidecar,
        expected_events: usize,
    ) -> Result<LoopStats> {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        };
        let watcher = async {
            while sidecar.events.lock().unwrap().len() < expected_events {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };
        let (out, ()) = tokio::join!(handle, watcher);
        out
    }

    #[tokio::test]
    async fn relays_each_update_between_sidecar_signals() {
        let (source, source_closed) = FakeSource::new(vec![
            record(text_update(1, "hi"), 10),
            record(
                serde_json::json!({"update": {"update_id": 2, "callback_query": {"id": "cb1", "data": "yes"}}}),
                11,
            ),
            record(serde_json::json!({"update": {"update_id": 3, "poll": {}}}), 12),
        ]);
        let (sink, log) = FakeSink::new(vec![]);
        let sidecar = Arc::new(RecordingSidecar::default());
        let worker = Worker::new(Arc::new(test_config()), source, sink, sidecar.clone());

        let stats = run_until_idle(worker, &sidecar, 6).await.unwrap();

        assert_eq!(
            stats,
            LoopStats {
                received: 3,
                responded: 2,
                unhandled: 1,
                failed: 0,
                malformed: 0,
            }
        );
        assert_eq!(
            *sidecar.events.lock().unwrap(),
            vec!["start", "end", "start", "end", "start", "end"]
        );

        let log = log.lock().unwrap();
        assert!(log.closed);
        assert!(*source_closed.lock().unwrap());
        assert_eq!(log.published.len(), 2);
        assert_eq!(log.published[0].0, "bot-1");
        assert_eq!(
            log.published[0].1,
            serde_json::json!({
                "bot_token": "tok",
                "method": "sendMessage",
                "params": {"chat_id": 42, "text": "Echo: hi", "reply_to_message_id": 7}
            })
        );
        assert_eq!(log.published[1].1["method"], "answerCallbackQuery");
        assert_eq!(log.published[1].1["params"]["text"], "Received: yes");
    }

    #[tokio::test]
    async fn per_message_failures_do_not_stop_the_loop() {
        let (source, _) = FakeSource::new(vec![
            Ok(Delivery::Malformed {
                position: RecordPosition::default(),
                reason: "expected value at line 1 column 1".to_string(),
            }),
            record(serde_json::json!({"update": {"message": {"text": "no chat"}}}), 1),
            record(text_update(2, "dropped"), 2),
            record(text_update(3, "ok"), 3),
        ]);
        let (sink, log) = FakeSink::new(vec![Some(Error::Delivery("timed out".into())), None]);
        let sidecar = Arc::new(RecordingSidecar::default());
        let worker = Worker::new(Arc::new(test_config()), source, sink, sidecar.clone());

        let stats = run_until_idle(worker, &sidecar, 8).await.unwrap();

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.responded, 1);
        let log = log.lock().unwrap();
        assert_eq!(log.published.len(), 1);
        assert_eq!(log.published[0].1["params"]["text"], "Echo: ok");
    }

    #[tokio::test]
    async fn broker_failure_is_fatal_and_still_closes_both_ends() {
        let (source, source_closed) = FakeSource::new(vec![
            record(text_update(1, "hi"), 1),
            Err(Error::Broker("all brokers down".into())),
            record(text_update(2, "never"), 2),
        ]);
        let (sink, log) = FakeSink::new(vec![]);
        let sidecar = Arc::new(RecordingSidecar::default());
        let worker = Worker::new(Arc::new(test_config()), source, sink, sidecar.clone());
        let lifecycle = worker.lifecycle();

        let err = worker.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::Broker(_)));
        assert_eq!(*lifecycle.borrow(), LifecycleState::Terminated);
        assert_eq!(log.lock().unwrap().published.len(), 1);
        assert!(log.lock().unwrap().closed);
        assert!(*source_closed.lock().unwrap());
    }

    #[tokio::test]
    async fn fatal_publish_error_stops_after_sidecar_end() {
        let (source, _) = FakeSource::new(vec![record(text_update(1, "hi"), 1)]);
        let (sink, log) = FakeSink::new(vec![Some(Error::Broker("fatal".into()))]);
        let sidecar = Arc::new(RecordingSidecar::default());
        let worker = Worker::new(Arc::new(test_config()), source, sink, sidecar.clone());

        assert!(worker.run(CancellationToken::new()).await.is_err());
        assert_eq!(*sidecar.events.lock().unwrap(), vec!["start", "end"]);
        assert!(log.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn cancel_while_idle_closes_and_returns_ok() {
        let (source, source_closed) = FakeSource::new(vec![]);
        let (sink, log) = FakeSink::new(vec![]);
        let worker = Worker::new(
            Arc::new(test_config()),
            source,
            sink,
            Arc::new(RecordingSidecar::default()),
        );
        let lifecycle = worker.lifecycle();
        assert_eq!(*lifecycle.borrow(), LifecycleState::Connected);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = worker.run(cancel).await.unwrap();

        assert_eq!(*lifecycle.borrow(), LifecycleState::Terminated);

        assert_eq!(stats, LoopStats::default());
        assert!(*source_closed.lock().unwrap());
        assert!(log.lock().unwrap().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_sidecar_only_delays_processing() {
        let (source, _) = FakeSource::new(vec![
            record(text_update(1, "a"), 1),
            record(text_update(2, "b"), 2),
        ]);
        let (sink, log) = FakeSink::new(vec![]);
        let worker = Worker::new(
            Arc::new(test_config()),
            source,
            sink,
            Arc::new(UnreachableSidecar),
        );

        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            async move {
                // Two updates, each bounded by two 1s sidecar calls.
                tokio::time::sleep(Duration::from_millis(4_500)).await;
                cancel.cancel();
            }
        };
        let (out, ()) = tokio::join!(worker.run(cancel), stopper);

        assert_eq!(out.unwrap().responded, 2);
        assert_eq!(log.lock().unwrap().published.len(), 2);
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = ProcessingSpan::start();
        assert!(span.elapsed() < Duration::from_secs(5));
        assert!(span.started_at <= Utc::now());
    }
}
