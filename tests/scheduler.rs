use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use periodag::{
    BoxTask, FnTask, Graph, Notifier, NotifyError, ParamRules, Period, RetryPolicy, RunReport,
    Scheduler, SchedulerConfig, SkipReason, TaskError, TaskState,
};

fn march() -> Period {
    Period::new(2024, 3).unwrap()
}

fn scheduler(tasks: Vec<BoxTask>, workers: usize) -> Scheduler {
    Scheduler::new(
        Graph::new(tasks).unwrap(),
        ParamRules::default(),
        SchedulerConfig { workers },
    )
}

fn ok(id: &str, deps: &[&str]) -> BoxTask {
    Arc::new(FnTask::new(id, |_| async { Ok(()) }).depends_on(deps.iter().copied()))
}

fn counted(id: &str, deps: &[&str], calls: &Arc<AtomicU32>) -> BoxTask {
    let calls = calls.clone();
    Arc::new(
        FnTask::new(id, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .depends_on(deps.iter().copied()),
    )
}

#[tokio::test]
async fn transient_failure_exhausts_retries_with_delay() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let tally = starts.clone();
    let delay = Duration::from_millis(30);
    let task = FnTask::new("flaky", move |_| {
        tally.lock().unwrap().push(Instant::now());
        async { Err(TaskError::transient("connection reset")) }
    })
    .with_retries(2, delay);

    let report = scheduler(vec![Arc::new(task)], 1).submit(march()).await;

    let run = report.task("flaky").unwrap();
    assert_eq!(run.state, TaskState::Failed);
    assert_eq!(run.attempt, 3);
    assert!(run.error.as_deref().unwrap().contains("connection reset"));

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= delay);
    }
    assert!(!report.overall_success());
}

#[tokio::test]
async fn permanent_failure_is_never_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let tally = calls.clone();
    let task = FnTask::new("validate", move |_| {
        tally.fetch_add(1, Ordering::SeqCst);
        async { Err(TaskError::permanent("schema mismatch")) }
    })
    .with_retries(5, Duration::from_millis(1));

    let report = scheduler(vec![Arc::new(task)], 1).submit(march()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let run = report.task("validate").unwrap();
    assert_eq!((run.state, run.attempt), (TaskState::Failed, 1));
}

#[tokio::test]
async fn transient_then_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let tally = calls.clone();
    let task = FnTask::new("upload", move |_| {
        let n = tally.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Err(TaskError::transient("503"))
            } else {
                Ok(())
            }
        }
    })
    .with_retries(1, Duration::from_millis(5));

    let report = scheduler(vec![Arc::new(task)], 1).submit(march()).await;
    let run = report.task("upload").unwrap();
    assert_eq!((run.state, run.attempt), (TaskState::Succeeded, 2));
    assert!(run.error.is_none());
    assert!(run.started_at.unwrap() <= run.finished_at.unwrap());
}

#[tokio::test]
async fn failure_skips_downstream_but_not_independent_branches() {
    let d_calls = Arc::new(AtomicU32::new(0));
    let e_calls = Arc::new(AtomicU32::new(0));
    let c: BoxTask = Arc::new(
        FnTask::new("c", |_| async { Err(TaskError::permanent("bad")) }).depends_on(["root"]),
    );

    let report = scheduler(
        vec![
            ok("root", &[]),
            c,
            counted("d", &["c"], &d_calls),
            ok("d2", &["d"]),
            counted("e", &["root"], &e_calls),
        ],
        2,
    )
    .submit(march())
    .await;

    assert_eq!(report.state_of("c"), Some(TaskState::Failed));
    assert_eq!(report.state_of("d"), Some(TaskState::Skipped));
    assert_eq!(
        report.task("d").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed { upstream: "c".into() })
    );
    assert_eq!(report.task("d").unwrap().attempt, 0);
    assert_eq!(d_calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.state_of("d2"), Some(TaskState::Skipped));

    assert_eq!(report.state_of("e"), Some(TaskState::Succeeded));
    assert_eq!(e_calls.load(Ordering::SeqCst), 1);
    assert!(!report.overall_success());
}

#[tokio::test]
async fn layers_never_overlap_and_siblings_respect_pool_size() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));

    let tracked = |id: &'static str, deps: &[&str]| -> BoxTask {
        let (in_flight, peak, log) = (in_flight.clone(), peak.clone(), log.clone());
        Arc::new(
            FnTask::new(id, move |_| {
                let (in_flight, peak, log) = (in_flight.clone(), peak.clone(), log.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    log.lock().unwrap().push(format!("start {id}"));
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    log.lock().unwrap().push(format!("end {id}"));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .depends_on(deps.iter().copied()),
        )
    };

    let tasks = vec![
        tracked("s1", &[]),
        tracked("s2", &[]),
        tracked("s3", &[]),
        tracked("s4", &[]),
        tracked("join", &["s1", "s2", "s3", "s4"]),
    ];
    let report = scheduler(tasks, 2).submit(march()).await;

    assert!(report.overall_success());
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    let log = log.lock().unwrap();
    let join_start = log.iter().position(|l| l == "start join").unwrap();
    for sibling in ["s1", "s2", "s3", "s4"] {
        let end = log.iter().position(|l| *l == format!("end {sibling}")).unwrap();
        assert!(end < join_start, "{sibling} must finish before join starts");
    }
}

#[tokio::test]
async fn retry_wait_does_not_hold_a_worker() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let a_order = order.clone();
    let a_calls = Arc::new(AtomicU32::new(0));
    let a = FnTask::new("a", move |_| {
        let attempt = a_calls.fetch_add(1, Ordering::SeqCst) + 1;
        a_order.lock().unwrap().push(format!("a{attempt}"));
        async move {
            if attempt == 1 {
                Err(TaskError::transient("busy"))
            } else {
                Ok(())
            }
        }
    })
    .with_retries(1, Duration::from_millis(150));

    let b_order = order.clone();
    let b = FnTask::new("b", move |_| {
        let b_order = b_order.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            b_order.lock().unwrap().push("b".to_string());
            Ok(())
        }
    });

    let report = scheduler(vec![Arc::new(a), Arc::new(b)], 1).submit(march()).await;
    assert!(report.overall_success());

    let order = order.lock().unwrap();
    let b_done = order.iter().position(|s| s == "b").unwrap();
    let a_retry = order.iter().position(|s| s == "a2").unwrap();
    assert!(b_done < a_retry, "b ran while a was backing off: {order:?}");
}

#[tokio::test]
async fn cancellation_skips_pending_and_lets_running_finish() {
    let slow = FnTask::new("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(())
    });
    let after_calls = Arc::new(AtomicU32::new(0));
    let tasks: Vec<BoxTask> = vec![Arc::new(slow), counted("after", &["slow"], &after_calls)];

    let handle = Arc::new(scheduler(tasks, 1)).submit_async(march());
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert!(report.cancelled());
    assert_eq!(report.state_of("slow"), Some(TaskState::Succeeded));
    assert_eq!(report.state_of("after"), Some(TaskState::Skipped));
    assert_eq!(report.task("after").unwrap().skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    assert!(!report.overall_success());
}

#[tokio::test]
async fn cancellation_skips_sibling_waiting_for_a_worker() {
    let calls = Arc::new(AtomicU32::new(0));
    let sibling = |id: &str| -> BoxTask {
        let calls = calls.clone();
        Arc::new(FnTask::new(id, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(())
            }
        }))
    };
    let tasks = vec![sibling("a"), sibling("b")];

    let handle = Arc::new(scheduler(tasks, 1)).submit_async(march());
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (ran, waited): (Vec<_>, Vec<_>) = ["a", "b"]
        .into_iter()
        .map(|id| report.task(id).unwrap())
        .partition(|run| run.state == TaskState::Succeeded);
    assert_eq!(ran.len(), 1);
    assert_eq!(waited.len(), 1);

    let waited = waited[0];
    assert_eq!(waited.state, TaskState::Skipped);
    assert_eq!(waited.skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(waited.attempt, 0);
    assert!(waited.started_at.is_none());
}

#[tokio::test]
async fn cancellation_during_retry_wait_keeps_last_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let tally = calls.clone();
    let task = FnTask::new("flaky", move |_| {
        tally.fetch_add(1, Ordering::SeqCst);
        async { Err(TaskError::transient("broker unavailable")) }
    })
    .with_retries(3, Duration::from_secs(30));

    let started = Instant::now();
    let handle = Arc::new(scheduler(vec![Arc::new(task)], 1)).submit_async(march());
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let run = report.task("flaky").unwrap();
    assert_eq!((run.state, run.attempt), (TaskState::Failed, 1));
    assert!(run.error.as_deref().unwrap().contains("broker unavailable"));
    assert_eq!(run.skip_reason, None);
    assert!(report.cancelled());
    assert!(!report.overall_success());
}

#[tokio::test]
async fn attempt_timeout_counts_as_transient() {
    let task = FnTask::new("hung", |_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .with_policy(RetryPolicy {
        max_retries: 1,
        retry_delay: Duration::from_millis(1),
        timeout: Some(Duration::from_millis(20)),
        ..RetryPolicy::default()
    });

    let report = scheduler(vec![Arc::new(task)], 1).submit(march()).await;
    let run = report.task("hung").unwrap();
    assert_eq!((run.state, run.attempt), (TaskState::Failed, 2));
    assert!(run.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn panicking_task_fails_without_aborting_instance() {
    let boom: BoxTask = Arc::new(FnTask::new("boom", |_| async {
        if true {
            panic!("spark driver lost");
        }
        Ok(())
    }));
    let report = scheduler(vec![boom, ok("other", &[])], 2).submit(march()).await;

    let run = report.task("boom").unwrap();
    assert_eq!(run.state, TaskState::Failed);
    assert!(run.error.as_deref().unwrap().contains("spark driver lost"));
    assert_eq!(report.state_of("other"), Some(TaskState::Succeeded));
}

struct Counting(AtomicU32);

#[async_trait]
impl Notifier for Counting {
    async fn notify(&self, _report: &RunReport) -> Result<(), NotifyError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn notifier_fires_once_and_only_on_success() {
    let notifier = Arc::new(Counting(AtomicU32::new(0)));

    let good = scheduler(vec![ok("a", &[]), ok("b", &["a"])], 2).with_notifier(notifier.clone());
    assert!(good.submit(march()).await.overall_success());
    assert_eq!(notifier.0.load(Ordering::SeqCst), 1);

    let failing: BoxTask = Arc::new(
        FnTask::new("b", |_| async { Err(TaskError::permanent("no")) }).depends_on(["a"]),
    );
    let bad = scheduler(vec![ok("a", &[]), failing], 2).with_notifier(notifier.clone());
    assert!(!bad.submit(march()).await.overall_success());
    assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn report_serializes_to_stable_json() {
    let report = scheduler(vec![ok("a", &[]), ok("b", &["a"])], 1).submit(march()).await;
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

    assert_eq!(json["period"], "2024-03");
    assert_eq!(json["overall_success"], true);
    assert_eq!(json["task_runs"]["b"]["state"], "succeeded");
    assert_eq!(json["task_runs"]["b"]["attempt"], 1);
    assert!(json["task_runs"]["b"]["error"].is_null());

    let back: RunReport = serde_json::from_value(json).unwrap();
    assert_eq!(back, report);
}
