//! Dispatcher behavior under failures, retries, timeouts, and logs,
//! driven deterministically through the in-process transport.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridalign::par::transport::channel_mesh;
use gridalign::par::{
    DispatchConfig, Dispatcher, UnitExecutor, UnitId, UnitStatus, WorkKind, WorkUnit, Worker,
};

fn units(n: u64) -> Vec<WorkUnit> {
    (0..n)
        .map(|id| WorkUnit {
            id,
            kind: WorkKind::PairRegister,
            args: vec!["register".into(), format!("--pair={id}")],
        })
        .collect()
}

/// Executor whose failure schedule is shared across all workers, so a
/// retried unit behaves the same no matter which worker picks it up.
#[derive(Clone)]
struct ScriptedExecutor {
    attempts: Arc<Mutex<HashMap<UnitId, usize>>>,
    fail_once: Arc<HashSet<UnitId>>,
    fail_always: Arc<HashSet<UnitId>>,
}

impl ScriptedExecutor {
    fn new(fail_once: &[UnitId], fail_always: &[UnitId]) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            fail_once: Arc::new(fail_once.iter().copied().collect()),
            fail_always: Arc::new(fail_always.iter().copied().collect()),
        }
    }
}

impl UnitExecutor for ScriptedExecutor {
    fn execute(&mut self, unit: &WorkUnit, log: &mut dyn FnMut(&[u8])) -> UnitStatus {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(unit.id).or_insert(0);
            *entry += 1;
            *entry
        };
        log(format!("unit {} attempt {attempt}\n", unit.id).as_bytes());

        if self.fail_always.contains(&unit.id) {
            return UnitStatus::Fail {
                reason: "degenerate input: mask has no set bits".into(),
            };
        }
        if self.fail_once.contains(&unit.id) && attempt == 1 {
            return UnitStatus::Fail {
                reason: "transient failure".into(),
            };
        }
        UnitStatus::Ok
    }
}

fn run_dispatch(
    n_units: u64,
    n_workers: usize,
    executor: &ScriptedExecutor,
    cfg: DispatchConfig,
) -> gridalign::par::DispatchReport {
    let mut mesh = channel_mesh(n_workers);
    let master = mesh.remove(0);
    let worker_ids: Vec<usize> = (1..=n_workers).collect();

    let handles: Vec<_> = mesh
        .into_iter()
        .map(|transport| {
            let executor = executor.clone();
            std::thread::spawn(move || Worker::new(transport, executor).run())
        })
        .collect();

    let mut dispatcher = Dispatcher::new(master, cfg);
    let report = dispatcher.run(units(n_units), &worker_ids).unwrap();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    report
}

#[test]
fn hundred_units_with_five_single_failures_all_complete() {
    let flaky: Vec<UnitId> = vec![7, 23, 41, 77, 93];
    let executor = ScriptedExecutor::new(&flaky, &[]);
    let report = run_dispatch(100, 3, &executor, DispatchConfig::default());

    assert!(report.all_ok());
    assert_eq!(report.outcomes.len(), 100);
    for outcome in &report.outcomes {
        let expected = if flaky.contains(&outcome.id) { 2 } else { 1 };
        assert_eq!(
            outcome.attempts, expected,
            "unit {} took {} attempts",
            outcome.id, outcome.attempts
        );
    }

    // Each flaky unit logged exactly two attempts, retried once.
    for id in &flaky {
        let log = String::from_utf8(report.logs[id].clone()).unwrap();
        assert!(log.contains("attempt 1"));
        assert!(log.contains("attempt 2"));
        assert!(!log.contains("attempt 3"));
    }
}

#[test]
fn persistent_failure_is_reported_and_does_not_block_the_rest() {
    let executor = ScriptedExecutor::new(&[], &[4]);
    let cfg = DispatchConfig {
        max_retries: 2,
        ..DispatchConfig::default()
    };
    let report = run_dispatch(10, 2, &executor, cfg);

    assert!(!report.all_ok());
    let failed = report.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, 4);
    // Initial attempt plus two retries.
    assert_eq!(failed[0].attempts, 3);
    assert!(failed[0]
        .failure
        .as_deref()
        .unwrap()
        .contains("degenerate"));
    assert_eq!(
        report.outcomes.iter().filter(|o| o.failure.is_none()).count(),
        9
    );
}

/// Executor that sleeps past the unit timeout on the first attempt.
#[derive(Clone)]
struct SlowFirstExecutor {
    attempts: Arc<Mutex<HashMap<UnitId, usize>>>,
    slow: Arc<HashSet<UnitId>>,
    delay: Duration,
}

impl UnitExecutor for SlowFirstExecutor {
    fn execute(&mut self, unit: &WorkUnit, _log: &mut dyn FnMut(&[u8])) -> UnitStatus {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(unit.id).or_insert(0);
            *entry += 1;
            *entry
        };
        if self.slow.contains(&unit.id) && attempt == 1 {
            std::thread::sleep(self.delay);
        }
        UnitStatus::Ok
    }
}

#[test]
fn timed_out_unit_is_retried_on_another_worker() {
    let executor = SlowFirstExecutor {
        attempts: Arc::new(Mutex::new(HashMap::new())),
        slow: Arc::new([2u64].into_iter().collect()),
        delay: Duration::from_millis(400),
    };
    let cfg = DispatchConfig {
        max_retries: 3,
        unit_timeout: Some(Duration::from_millis(100)),
        tick: Duration::from_millis(10),
        ..DispatchConfig::default()
    };

    let mut mesh = channel_mesh(2);
    let master = mesh.remove(0);
    let handles: Vec<_> = mesh
        .into_iter()
        .map(|transport| {
            let executor = executor.clone();
            std::thread::spawn(move || Worker::new(transport, executor).run())
        })
        .collect();

    let mut dispatcher = Dispatcher::new(master, cfg);
    let report = dispatcher.run(units(6), &[1, 2]).unwrap();
    // Workers may error out if the master dropped before their stale
    // replies landed; the slow worker still terminates either way.
    for handle in handles {
        let _ = handle.join();
    }

    assert!(report.all_ok());
    assert_eq!(report.outcomes.len(), 6);
    let slow = report.outcomes.iter().find(|o| o.id == 2).unwrap();
    assert!(slow.attempts >= 2, "timeout must consume an attempt");
}
