//! End-to-end scheduling scenarios with simulated devices and a recording sink.

use async_trait::async_trait;
use lab_logger::build_pollers;
use lab_logger::config::parse_devices;
use lab_logger::drivers::Driver;
use lab_logger::error::WriteError;
use lab_logger::reading::{FieldValue, Precision};
use lab_logger::scheduler::{Scheduler, SchedulerState, TickReport};
use lab_logger::writer::{BatchWriter, FlushOutcome, PointSink, RetryPolicy};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Records written batches; fails the first writes on a script.
#[derive(Default)]
struct RecordingSink {
    failures: Mutex<VecDeque<WriteError>>,
    attempts: Mutex<usize>,
    batches: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn unavailable_for(attempts: usize) -> Arc<Self> {
        let sink = Self::default();
        sink.failures.lock().extend(
            (0..attempts).map(|_| WriteError::Transient("503 Service Unavailable".into())),
        );
        Arc::new(sink)
    }
}

#[async_trait]
impl PointSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn write(&self, body: &str, _points: usize) -> Result<(), WriteError> {
        *self.attempts.lock() += 1;
        if let Some(e) = self.failures.lock().pop_front() {
            return Err(e);
        }
        self.batches.lock().push(body.to_string());
        Ok(())
    }
}

fn retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(100),
        backoff_factor: 2.0,
    }
}

fn scheduler(devices: &str, sink: Arc<RecordingSink>, policy: RetryPolicy, interval: Duration) -> Scheduler {
    let configs = parse_devices(devices, Duration::from_secs(5)).unwrap();
    let pollers = build_pollers(configs, 3).unwrap();
    let writer = BatchWriter::new(sink, policy, Precision::Ns);
    Scheduler::new(pollers, writer, interval)
}

/// Run the scheduler for `duration` of (paused) time and return every tick report.
async fn run_for(scheduler: Scheduler, duration: Duration) -> (Arc<Scheduler>, Vec<TickReport>) {
    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(scheduler.with_reports(reports_tx));
    let (stop, stop_rx) = watch::channel(false);
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(stop_rx).await })
    };
    tokio::time::sleep(duration).await;
    stop.send(true).unwrap();
    runner.await.unwrap();

    let mut reports = Vec::new();
    while let Ok(report) = reports_rx.try_recv() {
        reports.push(report);
    }
    (scheduler, reports)
}

#[tokio::test(start_paused = true)]
async fn test_multiplier_scales_raw_value() {
    let sink = Arc::new(RecordingSink::default());
    let s = scheduler(
        r#"[{"Device": "Gauge", "Model": "Simulated", "measurement": "pressure",
             "tags": {"lab": "b12"},
             "Channels": {"p": {"Type": "Constant", "Value": 1.5, "Multiplier": 2, "field-key": "p"}}}]"#,
        sink.clone(),
        retry_policy(3),
        Duration::from_secs(1),
    );

    let report = s.run_once().await;
    let outcome = report.outcome("Gauge").unwrap();
    assert_eq!(outcome.readings.len(), 1);
    assert_eq!(outcome.readings[0].fields["p"], FieldValue::Float(3.0));
    assert_eq!(outcome.readings[0].tags["lab"], "b12");

    let batches = sink.batches.lock().clone();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].starts_with("pressure,lab=b12 p=3 "));
}

#[tokio::test(start_paused = true)]
async fn test_polynomial_converter() {
    let sink = Arc::new(RecordingSink::default());
    let s = scheduler(
        r#"[{"Device": "Thermo", "Model": "Simulated", "measurement": "temperature",
             "Channels": {"t": {"Type": "Constant", "Value": 3, "field-key": "t",
                                "Converter": {"Type": "polynomial",
                                              "Coefficients": {"0": -1, "1": 2}}}}}]"#,
        sink,
        retry_policy(3),
        Duration::from_secs(1),
    );

    let report = s.run_once().await;
    let reading = &report.outcome("Thermo").unwrap().readings[0];
    assert_eq!(reading.fields["t"], FieldValue::Float(5.0));
}

#[tokio::test(start_paused = true)]
async fn test_busy_device_skips_ticks_while_others_keep_schedule() {
    let sink = Arc::new(RecordingSink::default());
    let s = scheduler(
        r#"[{"Device": "Slow", "Model": "Simulated", "measurement": "m", "Timeout": 10,
             "DeviceSpecificParams": {"Latency": 2.5},
             "Channels": {"a": {"Value": 1.0, "field-key": "a"}}},
            {"Device": "Fast", "Model": "Simulated", "measurement": "m",
             "Channels": {"b": {"Type": "Counter", "field-key": "b"}}}]"#,
        sink.clone(),
        retry_policy(3),
        Duration::from_secs(1),
    );

    // Ticks at t = 0, 1, 2, 3.
    let (s, reports) = run_for(s, Duration::from_millis(3500)).await;
    assert_eq!(s.state(), SchedulerState::Stopped);
    assert_eq!(reports.len(), 4);
    let ticks: Vec<_> = reports.iter().map(|r| r.tick).collect();
    assert_eq!(ticks, [1, 2, 3, 4]);

    let skipped: Vec<_> = reports.iter().map(|r| r.skipped.clone()).collect();
    assert_eq!(
        skipped,
        [vec![], vec!["Slow".to_string()], vec!["Slow".to_string()], vec![]]
    );

    // The fast device is read on every tick, in order.
    let counts: Vec<_> = reports
        .iter()
        .map(|r| r.outcome("Fast").unwrap().readings[0].fields["b"].clone())
        .collect();
    assert_eq!(
        counts,
        (0..4).map(FieldValue::Integer).collect::<Vec<_>>()
    );

    assert!(reports[0].outcome("Slow").unwrap().is_success());
    assert!(reports[3].outcome("Slow").unwrap().is_success());
    assert_eq!(sink.batches.lock().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_write_recovers_within_retry_bound() {
    let sink = RecordingSink::unavailable_for(3);
    let s = scheduler(
        r#"[{"Device": "A", "Model": "Simulated", "measurement": "m",
             "Channels": {"x": {"Value": 1.0, "field-key": "x"}}}]"#,
        sink.clone(),
        retry_policy(4),
        Duration::from_secs(10),
    );

    let report = s.run_once().await;
    assert_eq!(
        report.flush,
        FlushOutcome::Written {
            points: 1,
            attempts: 4
        }
    );
    assert_eq!(sink.batches.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_batch_is_dropped_and_next_tick_written() {
    let sink = RecordingSink::unavailable_for(3);
    let s = scheduler(
        r#"[{"Device": "A", "Model": "Simulated", "measurement": "m",
             "Channels": {"x": {"Type": "Counter", "field-key": "x"}}}]"#,
        sink.clone(),
        retry_policy(3),
        Duration::from_secs(10),
    );

    let (_, reports) = run_for(s, Duration::from_millis(10_500)).await;
    assert_eq!(reports.len(), 2);
    assert!(matches!(
        reports[0].flush,
        FlushOutcome::Dropped { points: 1, attempts: 3, .. }
    ));
    assert_eq!(
        reports[1].flush,
        FlushOutcome::Written {
            points: 1,
            attempts: 1
        }
    );

    let batches = sink.batches.lock().clone();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].starts_with("m x=1i "));
    assert_eq!(*sink.attempts.lock(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_failing_device_does_not_block_others() {
    let sink = Arc::new(RecordingSink::default());
    let s = scheduler(
        r#"[{"Device": "Dead", "Model": "Simulated", "measurement": "m",
             "DeviceSpecificParams": {"FailureMode": "transient"},
             "Channels": {"a": {"field-key": "a"}, "b": {"field-key": "b"}}},
            {"Device": "Alive", "Model": "Simulated", "measurement": "m",
             "Channels": {"c": {"Value": 7.0, "field-key": "c"}}}]"#,
        sink.clone(),
        retry_policy(3),
        Duration::from_secs(1),
    );

    let (s, reports) = run_for(s, Duration::from_millis(4500)).await;
    assert_eq!(reports.len(), 5);
    for report in &reports {
        assert_eq!(report.reading_count(), 1);
        assert!(report.outcome("Alive").unwrap().is_success());
        let dead = report.outcome("Dead").unwrap();
        assert_eq!(dead.errors.len(), 2);
        assert!(dead.errors.iter().all(|e| e.error.is_transient()));
    }
    assert_eq!(sink.batches.lock().len(), 5);

    // Still failing, still scheduled.
    assert_eq!(s.tracker().failing(), vec![("Dead".to_string(), 5)]);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_is_bounded_by_device_timeout() {
    let sink = Arc::new(RecordingSink::default());
    let s = scheduler(
        r#"[{"Device": "Slow", "Model": "Simulated", "measurement": "m", "Timeout": 3,
             "DeviceSpecificParams": {"Latency": 2},
             "Channels": {"a": {"field-key": "a"}, "b": {"field-key": "b"},
                          "c": {"field-key": "c"}}}]"#,
        sink,
        retry_policy(3),
        Duration::from_secs(1),
    );

    let started = tokio::time::Instant::now();
    let report = s.run_once().await;
    assert!(started.elapsed() <= Duration::from_secs(3) + Duration::from_millis(50));

    let outcome = report.outcome("Slow").unwrap();
    assert_eq!(outcome.readings.len(), 1);
    assert_eq!(outcome.readings[0].channel, "a");
    let failed: Vec<_> = outcome
        .errors
        .iter()
        .filter_map(|e| e.channel.clone())
        .collect();
    assert_eq!(failed, ["b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_device_back_online_is_read_again() {
    let sink = Arc::new(RecordingSink::default());
    let s = scheduler(
        r#"[{"Device": "Chiller", "Model": "Simulated", "measurement": "m",
             "DeviceSpecificParams": {"FailureMode": "connection", "FailFirstCycles": 4},
             "Channels": {"t": {"Value": 18.0, "field-key": "t"}}}]"#,
        sink.clone(),
        retry_policy(3),
        Duration::from_secs(1),
    );

    let (s, reports) = run_for(s, Duration::from_millis(5500)).await;
    assert_eq!(reports.len(), 6);
    let successes: Vec<_> = reports
        .iter()
        .map(|r| r.outcome("Chiller").unwrap().is_success())
        .collect();
    assert_eq!(successes, [false, false, false, false, true, true]);

    let state = s.tracker().state("Chiller").unwrap();
    assert_eq!(state.consecutive_failures, 0);
    assert!(state.last_success.is_some());
    assert!(state.last_error.is_none());
    assert_eq!(sink.batches.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_device_slower_than_interval_keeps_its_readings() {
    let sink = Arc::new(RecordingSink::default());
    let configs = parse_devices(
        r#"[{"Device": "Scope", "Model": "Simulated", "measurement": "m", "Timeout": 2,
             "ParallelReadout": true, "DeviceSpecificParams": {"Latency": 1.9},
             "Channels": {"v": {"Value": 0.5, "field-key": "v"}}}]"#,
        Duration::from_secs(5),
    )
    .unwrap();
    let pollers = build_pollers(configs, 3).unwrap();
    let stats = match pollers[0].driver() {
        Driver::Simulated(d) => d.stats(),
        other => panic!("unexpected driver {:?}", other),
    };
    let writer = BatchWriter::new(sink.clone(), retry_policy(3), Precision::Ns);
    let s = Scheduler::new(pollers, writer, Duration::from_secs(1));

    // Ticks at t = 0..=6. Each invocation waits for the session held by the one
    // before; ticks 4 and 6 give up after a whole timeout.
    let (s, reports) = run_for(s, Duration::from_millis(6500)).await;
    assert_eq!(reports.len(), 7);

    let polled: Vec<_> = reports
        .iter()
        .filter(|r| r.outcome("Scope").is_some())
        .map(|r| r.tick)
        .collect();
    let busy: Vec<_> = reports
        .iter()
        .filter(|r| r.skipped.iter().any(|d| d == "Scope"))
        .map(|r| r.tick)
        .collect();
    assert_eq!(polled, [1, 2, 3, 5, 7]);
    assert_eq!(busy, [4, 6]);

    for report in reports.iter().filter(|r| r.outcome("Scope").is_some()) {
        let outcome = report.outcome("Scope").unwrap();
        assert!(outcome.errors.is_empty(), "tick {}: {:?}", report.tick, outcome.errors);
        assert_eq!(outcome.readings.len(), 1);
    }

    // Every completed cycle reached the database.
    assert_eq!(stats.cycles(), 5);
    assert_eq!(sink.batches.lock().len(), 5);
    assert!(s.tracker().failing().is_empty());
    assert_eq!(s.tracker().state("Scope").unwrap().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_database_outage_keeps_at_most_one_batch_waiting() {
    let sink = RecordingSink::unavailable_for(1000);
    // Each flush takes 3 s (retries after 1 s and 2 s) against a 1 s interval.
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_secs(1),
        backoff_factor: 2.0,
    };
    let s = scheduler(
        r#"[{"Device": "A", "Model": "Simulated", "measurement": "m",
             "Channels": {"x": {"Type": "Counter", "field-key": "x"}}}]"#,
        sink.clone(),
        policy,
        Duration::from_secs(1),
    );

    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    let s = Arc::new(s.with_reports(reports_tx));
    let (stop, stop_rx) = watch::channel(false);
    let runner = {
        let s = Arc::clone(&s);
        tokio::spawn(async move { s.run(stop_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    let stopping = tokio::time::Instant::now();
    stop.send(true).unwrap();
    runner.await.unwrap();

    // At most the running flush and one waiting tick are left to drain.
    assert!(stopping.elapsed() <= Duration::from_secs(6));

    let mut reports = Vec::new();
    while let Ok(report) = reports_rx.try_recv() {
        reports.push(report);
    }
    reports.sort_by_key(|r| r.tick);
    let ticks: Vec<_> = reports.iter().map(|r| r.tick).collect();
    assert_eq!(ticks, (1..=11).collect::<Vec<u64>>());

    let mut flushed = 0;
    let mut superseded = 0;
    for report in &reports {
        match &report.flush {
            FlushOutcome::Dropped { attempts: 3, .. } => flushed += 1,
            FlushOutcome::Superseded { points: 1, by_tick } => {
                assert!(*by_tick > report.tick);
                superseded += 1;
            }
            other => panic!("tick {}: unexpected {:?}", report.tick, other),
        }
    }
    assert!(flushed <= 5, "{} flushes in 15 s of 3 s flushes", flushed);
    assert_eq!(flushed + superseded, 11);
    assert!(matches!(
        reports[10].flush,
        FlushOutcome::Dropped { attempts: 3, .. }
    ));
    assert_eq!(*sink.attempts.lock(), 3 * flushed);
    assert_eq!(s.state(), SchedulerState::Stopped);
}
