//! cport End-to-End Smoke Test
//!
//! Exercises the full stack:
//!   Part A: Pool basics: start, resize, post, shutdown
//!   Part B: Service: fast item, blocking burst (autoscale), drain
//!   Part C: Wait registrations: signal, unregister, timeout
//!   Part D: Shutdown with a blocked item and a zero wait
//!
//! Run: ./target/release/cport-smoke
//! Logs: RUST_LOG=cport=debug ./target/release/cport-smoke

use cport_core::handler::HandlerAction;
use cport_core::packet::Completion;
use cport_executor::{
    AdaptiveWorkerService, CompletionPortPool, PoolConfig, ServiceConfig, ServiceState,
};
use cport_module::Event;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;
use tracing_subscriber::EnvFilter;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

/// Poll `cond` every few ms until it holds or `timeout` passes.
fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ════════════════════════════════════════════════════════════
// Part A: CompletionPortPool
// ════════════════════════════════════════════════════════════

fn test_pool(t: &mut TestRunner) {
    t.section("Part A: CompletionPortPool");

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let pool = CompletionPortPool::with_handler(
        PoolConfig::new("smoke").max_threads(6),
        move |c: Completion<usize>| {
            h.fetch_add(c.into_payload().unwrap_or(0), Ordering::SeqCst);
            HandlerAction::Continue
        },
    );

    // A1: start
    match pool.start(0, 2, None) {
        Ok(()) => t.pass("start(0, 2)"),
        Err(e) => {
            t.fail("start(0, 2)", &e.to_string());
            return;
        }
    }
    t.check("num_threads == 2", pool.num_threads() == 2, &format!("{}", pool.num_threads()));

    // A2: resize grid, including past capacity
    for n in [5, 1, 0, 4, 10] {
        let want = n.min(pool.max_threads());
        let ok = pool.set_num_threads(n).is_ok()
            && eventually(Duration::from_secs(5), || pool.num_threads() == want);
        t.check(
            &format!("set_num_threads({}) -> {}", n, want),
            ok,
            &format!("have {}", pool.num_threads()),
        );
    }

    // A3: synthetic completions
    for i in 1..=10 {
        let _ = pool.post_completion(i, 0, i);
    }
    t.check(
        "10 posted completions handled",
        eventually(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 55),
        &format!("sum {}", hits.load(Ordering::SeqCst)),
    );

    // A4: shutdown, then again
    let report = pool.shutdown(Duration::from_secs(5));
    t.check("shutdown complete", report.is_complete(), &format!("{:?}", report));
    t.check("num_threads == 0", pool.num_threads() == 0, "threads left");
    t.check(
        "second shutdown is a no-op",
        pool.shutdown(Duration::from_secs(5)).is_complete() && !pool.is_running(),
        "not idempotent",
    );
}

// ════════════════════════════════════════════════════════════
// Part B: AdaptiveWorkerService
// ════════════════════════════════════════════════════════════

fn test_service(t: &mut TestRunner) {
    t.section("Part B: AdaptiveWorkerService");

    // B1: a single fast item leaves the pool at min=2 (max=8)
    let svc = AdaptiveWorkerService::new();
    if let Err(e) = svc.start(ServiceConfig::with_max_threads(8).min_threads(2)) {
        t.fail("start(min=2, max=8)", &e.to_string());
        return;
    }
    let (tx, rx) = mpsc::channel();
    let submitted = svc.submit(move || {
        let _ = tx.send(());
    });
    let ran = submitted.is_ok() && rx.recv_timeout(Duration::from_secs(5)).is_ok();
    t.check("fast item runs", ran, "item did not run");
    thread::sleep(Duration::from_millis(200));
    t.check(
        "threads stay at min",
        svc.total_workers() == 2,
        &format!("{} threads", svc.total_workers()),
    );
    t.check("shutdown", svc.shutdown().is_complete(), "incomplete");
    t.check("state Stopped", svc.state() == ServiceState::Stopped, "wrong state");

    // B2: four 500 ms items, min=1 max=4, 100 ms threshold, default concurrency
    let svc = AdaptiveWorkerService::new();
    let cfg = ServiceConfig::with_max_threads(4)
        .min_threads(1)
        .accept_threshold(Duration::from_millis(100));
    if let Err(e) = svc.start(cfg) {
        t.fail("start(min=1, max=4)", &e.to_string());
        return;
    }
    let runs = Arc::new(AtomicUsize::new(0));
    let began = Instant::now();
    for _ in 0..4 {
        let runs = runs.clone();
        let _ = svc.submit(move || {
            thread::sleep(Duration::from_millis(500));
            runs.fetch_add(1, Ordering::SeqCst);
        });
    }
    let grew = eventually(Duration::from_millis(1500), || svc.total_workers() > 1);
    info!(threads = svc.total_workers(), "after burst");
    t.check("burst grows the pool", grew, &format!("{} threads", svc.total_workers()));
    t.check("never above max", svc.total_workers() <= 4, "over max");
    let all_ran = eventually(Duration::from_secs(5), || runs.load(Ordering::SeqCst) == 4);
    let elapsed = began.elapsed();
    t.check(
        "blocked items overlap",
        all_ran && elapsed < Duration::from_millis(1500),
        &format!("{:?}", elapsed),
    );

    let report = svc.shutdown();
    t.check("drain then shutdown", report.is_complete(), &format!("{:?}", report));
    t.check(
        "each item ran exactly once",
        runs.load(Ordering::SeqCst) == 4,
        &format!("{} runs", runs.load(Ordering::SeqCst)),
    );
    t.check("submit after shutdown rejected", svc.submit(|| {}).is_err(), "accepted");
}

// ════════════════════════════════════════════════════════════
// Part C: Wait registrations
// ════════════════════════════════════════════════════════════

fn test_waits(t: &mut TestRunner) {
    t.section("Part C: Wait registrations");

    let svc = AdaptiveWorkerService::new();
    if let Err(e) = svc.start(ServiceConfig::with_max_threads(4)) {
        t.fail("start", &e.to_string());
        return;
    }
    let ev = match Event::manual() {
        Ok(ev) => ev,
        Err(e) => {
            t.fail("eventfd", &e.to_string());
            return;
        }
    };

    // C1: manual event, run once, no timeout
    let (tx, rx) = mpsc::channel();
    match svc.register_wait(Some(&ev), move |timed_out| { let _ = tx.send(timed_out); }, None, true) {
        Ok(token) => {
            let _ = ev.set();
            let got = rx.recv_timeout(Duration::from_secs(5));
            t.check("callback(timed_out=false)", got == Ok(false), &format!("{:?}", got));
            t.check(
                "thread exits after one call",
                token.wait_finished(Some(Duration::from_secs(5))),
                "still running",
            );
            t.check("no second call", rx.try_recv().is_err(), "called twice");
        }
        Err(e) => t.fail("register_wait", &e.to_string()),
    }
    let _ = ev.reset();

    // C2: unregister before the event is set
    let called = Arc::new(AtomicUsize::new(0));
    let c = called.clone();
    match svc.register_wait(Some(&ev), move |_| { c.fetch_add(1, Ordering::SeqCst); }, None, true) {
        Ok(token) => {
            let _ = svc.unregister_wait(&token);
            let exited = token.wait_finished(Some(Duration::from_secs(1)));
            let _ = ev.set();
            thread::sleep(Duration::from_millis(50));
            t.check("unregistered thread exits", exited, "still running");
            t.check("callback never ran", called.load(Ordering::SeqCst) == 0, "ran");
        }
        Err(e) => t.fail("register_wait", &e.to_string()),
    }

    // C3: periodic timeout without a handle
    let ticks = Arc::new(AtomicUsize::new(0));
    let k = ticks.clone();
    match svc.register_wait(None, move |timed_out| {
        if timed_out {
            k.fetch_add(1, Ordering::SeqCst);
        }
    }, Some(Duration::from_millis(20)), false) {
        Ok(token) => {
            t.check(
                "periodic timeouts fire",
                eventually(Duration::from_secs(2), || ticks.load(Ordering::SeqCst) >= 3),
                "too few ticks",
            );
            svc.shutdown();
            t.check(
                "service shutdown ends registration",
                token.wait_finished(Some(Duration::from_secs(5))),
                "still running",
            );
        }
        Err(e) => t.fail("register_wait(timeout)", &e.to_string()),
    }

    t.check(
        "infinite wait without handle rejected",
        AdaptiveWorkerService::new().register_wait(None, |_| {}, None, true).is_err(),
        "accepted",
    );
}

// ════════════════════════════════════════════════════════════
// Part D: Bounded shutdown
// ════════════════════════════════════════════════════════════

fn test_shutdown_timeout(t: &mut TestRunner) {
    t.section("Part D: shutdown(max_wait = 0) with a blocked item");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);

    let pool = CompletionPortPool::with_handler(
        PoolConfig::new("blocked"),
        move |_c: Completion<()>| {
            if let Ok(tx) = entered_tx.lock() {
                let _ = tx.send(());
            }
            if let Ok(rx) = release_rx.lock() {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
            HandlerAction::Continue
        },
    );
    if let Err(e) = pool.start(1, 1, None) {
        t.fail("start", &e.to_string());
        return;
    }
    let _ = pool.post_completion(0, 0, ());
    t.check(
        "handler blocked",
        entered_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "never entered",
    );

    let began = Instant::now();
    let report = pool.shutdown(Duration::ZERO);
    t.check("shutdown returns promptly", began.elapsed() < Duration::from_secs(1), "slow");
    t.check("report not complete", !report.is_complete(), &format!("{:?}", report));
    t.check("one thread abandoned", report.abandoned == 1, &format!("{:?}", report));
    t.check("pool stopped", !pool.is_running(), "still running");
    let _ = release_tx.send(());
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    println!("=== cport End-to-End Smoke Test ===");
    println!(
        "    cpus: {}",
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    );

    let mut t = TestRunner::new();

    test_pool(&mut t);
    test_service(&mut t);
    test_waits(&mut t);
    test_shutdown_timeout(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
