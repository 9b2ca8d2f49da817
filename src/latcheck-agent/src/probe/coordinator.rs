//! Probe coordination: sharding, retry policy, aggregation, cancellation.
//!
//! The target list is split into contiguous shards, one worker task per
//! shard. Each target gets up to [`PROBE_ATTEMPTS`] probes with
//! [`RETRY_DELAY`] between attempts, stopping early after
//! [`PROBE_SUCCESS_GOAL`] successes; the reported latency is the minimum
//! successful RTT, or the sentinel when nothing answered. Results are
//! delivered in finalization order; callers needing input order sort by
//! `server_id`.
//!
//! `finished` fires exactly once, when the last worker checks in, even after
//! a `stop()`.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use latcheck_proto::{ServerEntry, MAX_LATENCY};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use super::worker::Prober;

/// Maximum probes per target.
pub const PROBE_ATTEMPTS: usize = 5;

/// Successful probes after which a target is finalized early.
pub const PROBE_SUCCESS_GOAL: usize = 3;

/// Pause between consecutive probes of one target.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// A progress pulse fires every time this many targets have finalized.
pub const PROGRESS_STRIDE: usize = 100;

/// One finalized measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub server_id: u32,
    pub ip_addr: u32,
    /// Minimum successful RTT, or [`MAX_LATENCY`] when no probe succeeded
    pub latency: u32,
}

/// Events emitted while a run is in flight.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    /// A target finalized
    Result(ProbeResult),
    /// Aggregate count reached a multiple of [`PROGRESS_STRIDE`] or the total
    Progress { done: usize, total: usize },
    /// All workers checked in; carries everything collected
    Finished(Vec<ProbeResult>),
}

/// Aggregated run state behind the coordinator's single mutex.
#[derive(Default)]
struct Aggregate {
    results: Vec<ProbeResult>,
    /// Targets with at least one successful probe
    success: Vec<ProbeResult>,
    /// Targets that never answered
    failed: Vec<u32>,
    finished_workers: usize,
    finished_sent: bool,
}

struct Shared {
    prober: Arc<dyn Prober>,
    state: Mutex<Aggregate>,
    cancel: AtomicBool,
    events: mpsc::UnboundedSender<ProbeEvent>,
    total: usize,
    worker_count: usize,
    retry_delay: Duration,
}

/// Probe run configuration.
pub struct Coordinator {
    prober: Arc<dyn Prober>,
    workers: usize,
    retry_delay: Duration,
}

impl Coordinator {
    pub fn new(prober: Arc<dyn Prober>, workers: usize) -> Self {
        Self {
            prober,
            workers: workers.max(1),
            retry_delay: RETRY_DELAY,
        }
    }

    /// Shorten the retry pause; tests use this to run the policy at speed.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Start probing. Worker tasks run until their shard is drained or the
    /// run is cancelled; events stream through the returned handle.
    pub fn start(&self, targets: Vec<ServerEntry>) -> ProbeRun {
        let (events, receiver) = mpsc::unbounded_channel();
        let total = targets.len();
        let shards = partition(targets, self.workers);
        let worker_count = shards.len();

        info!(total, workers = worker_count, "starting probe run");

        let shared = Arc::new(Shared {
            prober: Arc::clone(&self.prober),
            state: Mutex::new(Aggregate::default()),
            cancel: AtomicBool::new(false),
            events,
            total,
            worker_count,
            retry_delay: self.retry_delay,
        });

        if worker_count == 0 {
            // Nothing to probe; the completion contract still holds.
            let _ = shared.events.send(ProbeEvent::Finished(Vec::new()));
        }
        for shard in shards {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { run_worker(shared, shard).await });
        }

        ProbeRun { shared, receiver }
    }
}

/// Handle to an in-flight run.
pub struct ProbeRun {
    shared: Arc<Shared>,
    receiver: mpsc::UnboundedReceiver<ProbeEvent>,
}

impl ProbeRun {
    /// Flip the cancellation flag; workers exit at their next check and no
    /// further results are emitted. `finished` still fires with whatever was
    /// collected.
    pub fn stop(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }

    /// Next event, `None` after `Finished` was consumed and workers are gone.
    pub async fn next_event(&mut self) -> Option<ProbeEvent> {
        self.receiver.recv().await
    }

    /// Drain events until `Finished` and return the collected results.
    pub async fn wait(mut self) -> Vec<ProbeResult> {
        while let Some(event) = self.receiver.recv().await {
            if let ProbeEvent::Finished(results) = event {
                return results;
            }
        }
        Vec::new()
    }
}

/// Split into at most `workers` contiguous shards, remainder spread across
/// the first shards. Empty shards are not spawned.
fn partition(targets: Vec<ServerEntry>, workers: usize) -> Vec<Vec<ServerEntry>> {
    let len = targets.len();
    if len == 0 {
        return Vec::new();
    }
    let workers = workers.max(1).min(len);
    let base = len / workers;
    let remainder = len % workers;

    let mut shards = Vec::with_capacity(workers);
    let mut rest = targets;
    for index in 0..workers {
        let take = base + usize::from(index < remainder);
        let tail = rest.split_off(take.min(rest.len()));
        shards.push(rest);
        rest = tail;
    }
    shards.retain(|shard| !shard.is_empty());
    shards
}

async fn run_worker(shared: Arc<Shared>, shard: Vec<ServerEntry>) {
    for target in shard {
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }

        let ip = Ipv4Addr::from(target.ip_addr);
        let latency = probe_target(&shared, ip).await;

        // Results observed after a stop are discarded, not emitted.
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }

        let result = ProbeResult {
            server_id: target.server_id,
            ip_addr: target.ip_addr,
            latency,
        };

        let done = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.results.push(result);
            if latency < MAX_LATENCY {
                state.success.push(result);
            } else {
                state.failed.push(result.server_id);
            }
            state.results.len()
        };

        let _ = shared.events.send(ProbeEvent::Result(result));
        if done % PROGRESS_STRIDE == 0 || done == shared.total {
            let _ = shared.events.send(ProbeEvent::Progress {
                done,
                total: shared.total,
            });
        }
    }

    // Completion barrier: the last worker to check in fires `finished`.
    let finished = {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished_workers += 1;
        if state.finished_workers == shared.worker_count && !state.finished_sent {
            state.finished_sent = true;
            Some(state.results.clone())
        } else {
            None
        }
    };
    if let Some(results) = finished {
        debug!(collected = results.len(), "probe run finished");
        let _ = shared.events.send(ProbeEvent::Finished(results));
    }
}

/// Retry/best-of-K policy for one target.
async fn probe_target(shared: &Shared, ip: Ipv4Addr) -> u32 {
    let mut best: Option<u32> = None;
    let mut successes = 0usize;

    for attempt in 0..PROBE_ATTEMPTS {
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }
        let rtt = shared.prober.probe(ip).await;
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }

        if rtt < MAX_LATENCY {
            successes += 1;
            best = Some(best.map_or(rtt, |b| b.min(rtt)));
            if successes >= PROBE_SUCCESS_GOAL {
                break;
            }
        }

        if attempt + 1 < PROBE_ATTEMPTS {
            sleep(shared.retry_delay).await;
        }
    }

    best.unwrap_or(MAX_LATENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Replays a scripted reply sequence per target; repeats the last entry
    /// once the script is exhausted.
    struct ScriptedProber {
        scripts: Mutex<HashMap<Ipv4Addr, Vec<u32>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProber {
        fn new(scripts: &[(Ipv4Addr, &[u32])]) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(
                    scripts
                        .iter()
                        .map(|(ip, replies)| (*ip, replies.to_vec()))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, target: Ipv4Addr) -> u32 {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&target) {
                Some(replies) if replies.len() > 1 => replies.remove(0),
                Some(replies) => replies.first().copied().unwrap_or(MAX_LATENCY),
                None => MAX_LATENCY,
            }
        }
    }

    /// Always answers `latency` after yielding once.
    struct FlatProber(u32);

    #[async_trait]
    impl Prober for FlatProber {
        async fn probe(&self, _target: Ipv4Addr) -> u32 {
            tokio::task::yield_now().await;
            self.0
        }
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn targets(n: u32) -> Vec<ServerEntry> {
        (1..=n)
            .map(|i| ServerEntry {
                server_id: i,
                ip_addr: u32::from(ip((i % 250) as u8)),
            })
            .collect()
    }

    fn fast_coordinator(prober: Arc<dyn Prober>, workers: usize) -> Coordinator {
        Coordinator::new(prober, workers).with_retry_delay(Duration::from_millis(0))
    }

    #[test]
    fn partition_spreads_remainder_over_first_shards() {
        let shards = partition(targets(10), 3);
        let sizes: Vec<usize> = shards.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);

        // Contiguous: concatenation reproduces the input order.
        let flattened: Vec<u32> = shards.iter().flatten().map(|t| t.server_id).collect();
        assert_eq!(flattened, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn partition_with_more_workers_than_targets() {
        let shards = partition(targets(2), 5);
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|s| s.len() == 1));
    }

    #[test]
    fn partition_of_empty_input() {
        assert!(partition(Vec::new(), 4).is_empty());
    }

    #[tokio::test]
    async fn retry_keeps_minimum_of_successes() {
        // fail, 42, 30, fail, 33: three successes by the fifth attempt,
        // minimum 30.
        let prober = ScriptedProber::new(&[(ip(1), &[MAX_LATENCY, 42, 30, MAX_LATENCY, 33])]);
        let coordinator = fast_coordinator(prober.clone(), 1);

        let results = coordinator
            .start(vec![ServerEntry {
                server_id: 7,
                ip_addr: u32::from(ip(1)),
            }])
            .wait()
            .await;

        assert_eq!(
            results,
            vec![ProbeResult {
                server_id: 7,
                ip_addr: u32::from(ip(1)),
                latency: 30,
            }]
        );
        assert_eq!(prober.calls(), 5);
    }

    #[tokio::test]
    async fn three_successes_stop_early() {
        let prober = ScriptedProber::new(&[(ip(1), &[10, 20, 30, 1, 1])]);
        let coordinator = fast_coordinator(prober.clone(), 1);

        let results = coordinator
            .start(vec![ServerEntry {
                server_id: 1,
                ip_addr: u32::from(ip(1)),
            }])
            .wait()
            .await;

        assert_eq!(results[0].latency, 10);
        // Stopped after the third success; attempts four and five never ran.
        assert_eq!(prober.calls(), 3);
    }

    #[tokio::test]
    async fn all_failures_yield_sentinel_after_five_attempts() {
        let prober = ScriptedProber::new(&[(ip(1), &[MAX_LATENCY])]);
        let coordinator = fast_coordinator(prober.clone(), 1);

        let results = coordinator
            .start(vec![ServerEntry {
                server_id: 1,
                ip_addr: u32::from(ip(1)),
            }])
            .wait()
            .await;

        assert_eq!(results[0].latency, MAX_LATENCY);
        assert_eq!(prober.calls(), 5);
    }

    #[tokio::test]
    async fn full_run_covers_every_target_exactly_once() {
        let coordinator = fast_coordinator(Arc::new(FlatProber(12)), 4);
        let input = targets(23);
        let results = coordinator.start(input.clone()).wait().await;

        assert_eq!(results.len(), input.len());
        let mut seen: Vec<u32> = results.iter().map(|r| r.server_id).collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=23).collect::<Vec<_>>());
        assert!(results.iter().all(|r| r.latency == 12));
    }

    #[tokio::test]
    async fn finished_fires_exactly_once_with_all_events() {
        let coordinator = fast_coordinator(Arc::new(FlatProber(5)), 3);
        let mut run = coordinator.start(targets(8));

        let mut result_events = 0;
        let mut finished_events = 0;
        while let Some(event) = run.next_event().await {
            match event {
                ProbeEvent::Result(_) => result_events += 1,
                ProbeEvent::Progress { .. } => {}
                ProbeEvent::Finished(results) => {
                    finished_events += 1;
                    assert_eq!(results.len(), 8);
                    break;
                }
            }
        }
        assert_eq!(result_events, 8);
        assert_eq!(finished_events, 1);
    }

    #[tokio::test]
    async fn progress_pulses_at_stride_and_total() {
        let coordinator = fast_coordinator(Arc::new(FlatProber(1)), 2);
        let mut run = coordinator.start(targets(250));

        let mut pulses = Vec::new();
        while let Some(event) = run.next_event().await {
            match event {
                ProbeEvent::Progress { done, total } => {
                    assert_eq!(total, 250);
                    pulses.push(done);
                }
                ProbeEvent::Finished(_) => break,
                ProbeEvent::Result(_) => {}
            }
        }
        assert!(pulses.contains(&100));
        assert!(pulses.contains(&200));
        assert_eq!(*pulses.last().unwrap(), 250);
    }

    #[tokio::test]
    async fn empty_target_list_still_finishes() {
        let coordinator = fast_coordinator(Arc::new(FlatProber(1)), 4);
        let results = coordinator.start(Vec::new()).wait().await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn stop_cuts_the_run_short_but_still_finishes() {
        /// Slow prober so the stop lands mid-run.
        struct SlowProber;

        #[async_trait]
        impl Prober for SlowProber {
            async fn probe(&self, _target: Ipv4Addr) -> u32 {
                sleep(Duration::from_millis(20)).await;
                7
            }
        }

        let coordinator = fast_coordinator(Arc::new(SlowProber), 2);
        let mut run = coordinator.start(targets(40));

        // Let a few targets finalize, then cancel.
        let mut seen = 0;
        while let Some(event) = run.next_event().await {
            if matches!(event, ProbeEvent::Result(_)) {
                seen += 1;
                if seen >= 3 {
                    run.stop();
                    break;
                }
            }
        }

        let results = run.wait().await;
        assert!(results.len() >= 3);
        assert!(results.len() < 40, "cancellation had no effect");
    }
}
