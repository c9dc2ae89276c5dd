// End-to-end coordination scenarios against the simulated VM

use jdwp_coord::sim::SimRendezvous;
use jdwp_coord::{
    ClassDef, CoordError, Debuggee, DriverOptions, EventKind, EventSet, Filters, Program,
    RequestKind, RequestTarget, Session, SessionDriver, SimLaunch, SimProcess, SimVm, Step,
    SuspendPolicy, Tag, TestCase, Token,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);
const CLASS: &str = "demo.Worker";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn worker() -> ClassDef {
    ClassDef::new(CLASS)
        .method("run", 10, 19)
        .method("target", 20, 29)
        .method("gate", 30, 39)
}

/// A session stopped at the ClassPrepare of the program's first class
struct Harness {
    session: Session<SimVm>,
    vm: SimVm,
    process: SimProcess,
    rendezvous: SimRendezvous,
    prepared: EventSet,
}

async fn boot(program: Program) -> Harness {
    init_tracing();
    let SimLaunch {
        vm,
        process,
        rendezvous,
    } = SimVm::launch(program.start_suspended());
    let mut session = Session::attach(vm.clone()).unwrap();

    let start = session.next_event(WAIT).await.unwrap();
    assert!(matches!(start.events[0].details, EventKind::VmStart { .. }));
    assert!(session.suspend_all_active());

    let key = session
        .create_request(
            RequestKind::ClassPrepare,
            RequestTarget::classes("demo.*"),
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Text("prepare".to_string()),
        )
        .unwrap();
    session.enable_request(key).await.unwrap();
    session.resume(&start).await.unwrap();
    assert!(!session.suspend_all_active());

    let prepared = session.next_event(WAIT).await.unwrap();
    assert!(matches!(prepared.events[0].details, EventKind::ClassPrepare { .. }));
    session.disable_request(key).await.unwrap();

    Harness {
        session,
        vm,
        process,
        rendezvous,
        prepared,
    }
}

fn event_thread(set: &EventSet) -> u64 {
    set.events[0].thread().unwrap()
}

fn two_workers() -> Program {
    Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("T2"),
        Step::start("T3"),
        Step::call("T2", CLASS, "run"),
        Step::call("T3", CLASS, "run"),
        Step::call("T2", CLASS, "target"),
        Step::line("T2", 21),
        Step::ret("T2"),
        Step::ret("T2"),
        Step::ret("T3"),
        Step::end("T2"),
        Step::end("T3"),
        Step::AwaitQuit,
    ])
}

#[tokio::test]
async fn test_breakpoint_stops_only_the_filtered_thread() {
    let mut h = boot(two_workers()).await;
    let t2 = h.vm.thread_id("T2").unwrap();

    let key = h
        .session
        .create_request(
            RequestKind::Breakpoint,
            RequestTarget::line(CLASS, 20),
            Filters::none().thread(t2),
            SuspendPolicy::EventThread,
            Tag::Text("M".to_string()),
        )
        .unwrap();
    h.session.enable_request(key).await.unwrap();
    h.session.resume(&h.prepared).await.unwrap();

    let set = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(set.events.len(), 1);
    assert!(matches!(set.events[0].details, EventKind::Breakpoint { thread, .. } if thread == t2));
    assert_eq!(h.session.resolve(&set.events[0]).unwrap().map(|r| r.key()), Some(key));

    let handle = h.session.thread(t2);
    assert_eq!(handle.suspend_count().await, 1);
    for name in ["main", "T3"] {
        let other = h.session.thread(h.vm.thread_id(name).unwrap());
        assert!(!h.session.is_suspended(&other).await, "{} is suspended", name);
    }

    // exactly one set for one call
    assert!(matches!(h.session.next_event(QUIET).await, Err(CoordError::Timeout(_))));
}

#[tokio::test]
async fn test_pop_returns_to_caller_and_invalidates_handles() {
    let mut h = boot(two_workers()).await;
    let t2 = h.vm.thread_id("T2").unwrap();

    let key = h
        .session
        .create_request(
            RequestKind::MethodEntry,
            RequestTarget::method(CLASS, "target"),
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Int(0),
        )
        .unwrap();
    h.session.enable_request(key).await.unwrap();
    h.session.resume(&h.prepared).await.unwrap();

    let set = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(event_thread(&set), t2);
    let thread = h.session.thread(t2);

    let frames = h.session.frames(&thread).await.unwrap();
    assert_eq!(frames.len(), 2);
    let callee = frames[0].captured_location();
    let caller = frames[1].captured_location();
    assert!(!callee.same_method(&caller));

    let before = thread.stack_generation().await;
    let after = h.session.pop_frame(&thread, &frames[0]).await.unwrap();
    assert_eq!(after, before + 1);
    assert_eq!(thread.stack_generation().await, before + 1);
    assert_eq!(h.session.pops(), 1);

    // every handle from before the pop is dead, including the caller's
    for frame in &frames {
        assert!(matches!(
            h.session.frame_location(&thread, frame).await,
            Err(CoordError::StaleFrame { .. })
        ));
        assert!(matches!(
            h.session.pop_frame(&thread, frame).await,
            Err(CoordError::StaleFrame { .. })
        ));
    }

    let top = h.session.frame(&thread, 0).await.unwrap();
    assert_eq!(top.captured_location(), caller);
    assert_eq!(h.session.frame_count(&thread).await.unwrap(), 1);

    // the stack is down to one visible frame
    assert!(matches!(
        h.session.frame(&thread, 1).await,
        Err(CoordError::FrameIndexOutOfRange { index: 1, count: 1, .. })
    ));

    // the last frame has no caller to return into
    assert!(matches!(
        h.session.pop_frame(&thread, &top).await,
        Err(CoordError::FrameIndexOutOfRange { .. })
    ));
    assert_eq!(thread.stack_generation().await, before + 1);
}

#[tokio::test]
async fn test_stack_operations_need_a_suspended_thread() {
    let mut h = boot(two_workers()).await;
    let t2 = h.vm.thread_id("T2").unwrap();
    let t3 = h.vm.thread_id("T3").unwrap();

    let key = h
        .session
        .create_request(
            RequestKind::MethodEntry,
            RequestTarget::method(CLASS, "target"),
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Int(0),
        )
        .unwrap();
    h.session.enable_request(key).await.unwrap();
    h.session.resume(&h.prepared).await.unwrap();
    h.session.next_event(WAIT).await.unwrap();

    // T3 sits in run() and was never stopped
    let running = h.session.thread(t3);
    h.session.suspend(&running).await.unwrap();
    let t3_frames = h.session.frames(&running).await.unwrap();
    h.session.resume_thread(&running).await.unwrap();
    let generation = running.stack_generation().await;

    let stopped = h.session.thread(t2);
    let t2_frames = h.session.frames(&stopped).await.unwrap();
    for frame in t3_frames.iter().chain(&t2_frames) {
        assert!(matches!(
            h.session.pop_frame(&running, frame).await,
            Err(CoordError::ThreadNotSuspended(id)) if id == t3
        ));
    }
    assert!(matches!(
        h.session.frames(&running).await,
        Err(CoordError::ThreadNotSuspended(_))
    ));
    assert!(matches!(
        h.session.frame(&running, 0).await,
        Err(CoordError::ThreadNotSuspended(_))
    ));
    assert!(matches!(
        h.session.owned_monitors(&running).await,
        Err(CoordError::ThreadNotSuspended(_))
    ));
    assert_eq!(running.stack_generation().await, generation);
    assert_eq!(h.vm.depth(t3), 1);

    // resuming past zero is refused without touching the VM
    assert!(matches!(
        h.session.resume_thread(&running).await,
        Err(CoordError::UnbalancedResume(_))
    ));
}

#[tokio::test]
async fn test_thread_filters_resolve_to_their_own_request() {
    let program = Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("T2"),
        Step::start("T3"),
        Step::call("T3", CLASS, "target"),
        Step::ret("T3"),
        Step::call("T2", CLASS, "target"),
        Step::ret("T2"),
        Step::AwaitQuit,
    ]);
    let mut h = boot(program).await;
    let t2 = h.vm.thread_id("T2").unwrap();
    let t3 = h.vm.thread_id("T3").unwrap();

    let mut keys = Vec::new();
    for (tag, thread) in [(2, t2), (3, t3)] {
        let key = h
            .session
            .create_request(
                RequestKind::Breakpoint,
                RequestTarget::line(CLASS, 20),
                Filters::none().thread(thread),
                SuspendPolicy::EventThread,
                Tag::Int(tag),
            )
            .unwrap();
        h.session.enable_request(key).await.unwrap();
        keys.push(key);
    }
    h.session.resume(&h.prepared).await.unwrap();

    let first = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(first.events.len(), 1);
    assert_eq!(event_thread(&first), t3);
    let resolved = h.session.resolve(&first.events[0]).unwrap().unwrap();
    assert_eq!(resolved.key(), keys[1]);
    assert_eq!(resolved.tag(), &Tag::Int(3));
    h.session.resume(&first).await.unwrap();

    let second = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(event_thread(&second), t2);
    assert_eq!(
        h.session.resolve(&second.events[0]).unwrap().map(|r| r.key()),
        Some(keys[0])
    );
}

#[tokio::test]
async fn test_pop_releases_monitor_before_returning() {
    let program = Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("A"),
        Step::start("B"),
        Step::call("A", CLASS, "run"),
        Step::call_synchronized("A", CLASS, "target", "lock"),
        Step::call("B", CLASS, "run"),
        Step::enter("B", "lock"),
        Step::status("B entered"),
        Step::exit("B", "lock"),
        Step::line("A", 21),
        Step::ret("A"),
        Step::ret("A"),
        Step::AwaitQuit,
    ]);
    let mut h = boot(program).await;
    let a = h.vm.thread_id("A").unwrap();
    let b = h.vm.thread_id("B").unwrap();

    let key = h
        .session
        .create_request(
            RequestKind::MethodEntry,
            RequestTarget::method(CLASS, "target"),
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Int(0),
        )
        .unwrap();
    h.session.enable_request(key).await.unwrap();
    h.session.resume(&h.prepared).await.unwrap();

    let stop = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(event_thread(&stop), a);
    let thread = h.session.thread(a);
    let lock = h.vm.monitor_id("lock").unwrap();
    assert_eq!(h.session.owned_monitors(&thread).await.unwrap(), vec![lock]);

    // B is now parked on the monitor A holds
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.vm.monitor_owner("lock"), Some(a));

    let frames = h.session.frames(&thread).await.unwrap();
    h.session.pop_frame(&thread, &frames[0]).await.unwrap();
    assert_ne!(h.vm.monitor_owner("lock"), Some(a));
    assert_eq!(h.vm.depth(a), 1);
    assert!(h.session.owned_monitors(&thread).await.unwrap().is_empty());

    assert_eq!(h.rendezvous.recv(WAIT).await.unwrap(), Token::Status("B entered".to_string()));
    assert_ne!(h.vm.monitor_owner("lock"), Some(a));

    // resuming A re-executes the call, which takes the lock and traps again
    h.session.resume(&stop).await.unwrap();
    let again = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(event_thread(&again), a);
    assert_eq!(h.vm.monitor_owner("lock"), Some(a));
    assert_ne!(h.vm.monitor_owner("lock"), Some(b));
}

#[tokio::test]
async fn test_reenabled_request_keeps_its_settings() {
    let program = Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("T2"),
        Step::call("T2", CLASS, "target"),
        Step::ret("T2"),
        Step::call("T2", CLASS, "target"),
        Step::ret("T2"),
        Step::call("T2", CLASS, "gate"),
        Step::ret("T2"),
        Step::call("T2", CLASS, "target"),
        Step::ret("T2"),
        Step::AwaitQuit,
    ]);
    let mut h = boot(program).await;
    let t2 = h.vm.thread_id("T2").unwrap();

    let target = h
        .session
        .create_request(
            RequestKind::Breakpoint,
            RequestTarget::line(CLASS, 20),
            Filters::none().thread(t2).class("demo.*"),
            SuspendPolicy::EventThread,
            Tag::Int(1),
        )
        .unwrap();
    let gate = h
        .session
        .create_request(
            RequestKind::MethodEntry,
            RequestTarget::method(CLASS, "gate"),
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Int(2),
        )
        .unwrap();
    h.session.enable_request(target).await.unwrap();
    h.session.enable_request(gate).await.unwrap();
    let original = h.session.registry().get(target).unwrap().spec();
    h.session.resume(&h.prepared).await.unwrap();

    let first = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(h.session.resolve(&first.events[0]).unwrap().map(|r| r.key()), Some(target));
    h.session.disable_request(target).await.unwrap();
    assert!(!h.session.registry().get(target).unwrap().is_enabled());
    h.session.resume(&first).await.unwrap();

    // the second call runs untrapped, the gate stops the thread again
    let gated = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(h.session.resolve(&gated.events[0]).unwrap().map(|r| r.key()), Some(gate));

    h.session.enable_request(target).await.unwrap();
    h.session.enable_request(target).await.unwrap();
    let request = h.session.registry().get(target).unwrap();
    assert!(request.is_enabled());
    assert_eq!(request.spec(), original);
    assert_eq!(request.filters().thread, Some(t2));
    assert_eq!(request.suspend_policy(), SuspendPolicy::EventThread);
    h.session.resume(&gated).await.unwrap();

    let third = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(third.events.len(), 1);
    assert_eq!(h.session.resolve(&third.events[0]).unwrap().map(|r| r.key()), Some(target));
    h.session.resume(&third).await.unwrap();

    assert!(matches!(h.session.next_event(QUIET).await, Err(CoordError::Timeout(_))));
}

#[tokio::test]
async fn test_sets_arrive_in_generation_order() {
    let program = Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("T2"),
        Step::start("T3"),
        Step::call("T2", CLASS, "target"),
        Step::ret("T2"),
        Step::call("T3", CLASS, "target"),
        Step::ret("T3"),
        Step::call("T2", CLASS, "gate"),
        Step::ret("T2"),
        Step::AwaitQuit,
    ]);
    let mut h = boot(program).await;
    let t2 = h.vm.thread_id("T2").unwrap();
    let t3 = h.vm.thread_id("T3").unwrap();

    // entry and first-line traps coincide: one set, both events
    for (kind, target) in [
        (RequestKind::MethodEntry, RequestTarget::method(CLASS, "target")),
        (RequestKind::Breakpoint, RequestTarget::line(CLASS, 20)),
        (RequestKind::MethodEntry, RequestTarget::method(CLASS, "gate")),
    ] {
        let key = h
            .session
            .create_request(kind, target, Filters::none(), SuspendPolicy::None, Tag::Int(0))
            .unwrap();
        h.session.enable_request(key).await.unwrap();
    }
    h.session.resume(&h.prepared).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let set = h.session.next_event(WAIT).await.unwrap();
        seen.push((set.seq, event_thread(&set), set.events.len()));
        h.session.resume(&set).await.unwrap();
    }
    let seqs: Vec<u64> = seen.iter().map(|s| s.0).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(
        seen.iter().map(|s| (s.1, s.2)).collect::<Vec<_>>(),
        vec![(t2, 2), (t3, 2), (t2, 1)]
    );
    assert!(h.session.pending().is_empty());
}

#[tokio::test]
async fn test_thread_lifecycle_and_double_resume() {
    let program = Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("T2"),
        Step::call("T2", CLASS, "run"),
        Step::end("T2"),
        Step::AwaitQuit,
    ]);
    let mut h = boot(program).await;
    let t2 = h.vm.thread_id("T2").unwrap();

    for kind in [RequestKind::ThreadStart, RequestKind::ThreadDeath] {
        let key = h
            .session
            .create_request(
                kind,
                RequestTarget::Anywhere,
                Filters::none(),
                SuspendPolicy::All,
                Tag::Text(format!("{:?}", kind)),
            )
            .unwrap();
        h.session.enable_request(key).await.unwrap();
    }
    h.session.resume(&h.prepared).await.unwrap();

    let started = h.session.next_event(WAIT).await.unwrap();
    assert!(matches!(started.events[0].details, EventKind::ThreadStart { thread } if thread == t2));
    assert!(h.session.suspend_all_active());
    let thread = h.session.thread(t2);
    assert_eq!(thread.suspend_count().await, 1);

    h.session.resume(&started).await.unwrap();
    assert!(matches!(
        h.session.resume(&started).await,
        Err(CoordError::DoubleResume(seq)) if seq == started.seq
    ));
    assert_eq!(thread.suspend_count().await, 0);

    let died = h.session.next_event(WAIT).await.unwrap();
    assert!(matches!(died.events[0].details, EventKind::ThreadDeath { .. }));
    h.session.thread_died(t2).await;
    assert!(matches!(h.session.frames(&thread).await, Err(CoordError::Disconnected)));
    h.session.resume(&died).await.unwrap();
}

#[tokio::test]
async fn test_thread_lifecycle_under_event_thread_policy() {
    let program = Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("T2"),
        Step::call("T2", CLASS, "run"),
        Step::end("T2"),
        Step::start("T3"),
        Step::end("T3"),
        Step::call("main", CLASS, "gate"),
        Step::AwaitQuit,
    ]);
    let mut h = boot(program).await;
    let t2 = h.vm.thread_id("T2").unwrap();
    let t3 = h.vm.thread_id("T3").unwrap();
    let main = h.vm.thread_id("main").unwrap();

    let mut create = |kind: RequestKind, target: RequestTarget| {
        h.session
            .create_request(kind, target, Filters::none(), SuspendPolicy::EventThread, Tag::Int(0))
            .unwrap()
    };
    let keys = [
        create(RequestKind::ThreadStart, RequestTarget::Anywhere),
        create(RequestKind::ThreadDeath, RequestTarget::Anywhere),
        create(RequestKind::MethodEntry, RequestTarget::method(CLASS, "gate")),
    ];
    for key in keys {
        h.session.enable_request(key).await.unwrap();
    }
    h.session.resume(&h.prepared).await.unwrap();

    let started = h.session.next_event(WAIT).await.unwrap();
    assert!(matches!(started.events[0].details, EventKind::ThreadStart { thread } if thread == t2));
    assert!(!h.session.suspend_all_active());
    let thread = h.session.thread(t2);
    assert_eq!(thread.suspend_count().await, 1);
    h.session.resume(&started).await.unwrap();
    assert_eq!(thread.suspend_count().await, 0);

    // handle dropped before the death stop is released
    let died = h.session.next_event(WAIT).await.unwrap();
    assert!(matches!(died.events[0].details, EventKind::ThreadDeath { thread } if thread == t2));
    assert_eq!(thread.suspend_count().await, 1);
    h.session.thread_died(t2).await;
    assert!(matches!(h.session.frames(&thread).await, Err(CoordError::Disconnected)));
    h.session.resume(&died).await.unwrap();

    let started = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(event_thread(&started), t3);
    h.session.resume(&started).await.unwrap();

    // death stop released while the handle is still registered
    let died = h.session.next_event(WAIT).await.unwrap();
    assert!(matches!(died.events[0].details, EventKind::ThreadDeath { thread } if thread == t3));
    h.session.resume(&died).await.unwrap();
    assert!(h.session.pending().is_empty());

    // both threads are gone and main moves on
    let gate = h.session.next_event(WAIT).await.unwrap();
    assert!(matches!(
        gate.events[0].details,
        EventKind::MethodEntry { thread, .. } if thread == main
    ));
    let alive: Vec<u64> = h
        .session
        .all_threads()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id())
        .collect();
    assert!(!alive.contains(&t2) && !alive.contains(&t3));
    h.session.resume(&gate).await.unwrap();
}

#[tokio::test]
async fn test_resume_after_process_loss_fails_and_drops_the_set() {
    let program = Program::new().class(worker()).steps([
        Step::load("main", CLASS),
        Step::start("T2"),
        Step::call("T2", CLASS, "run"),
        Step::AwaitQuit,
    ]);
    let mut h = boot(program).await;
    let t2 = h.vm.thread_id("T2").unwrap();

    let key = h
        .session
        .create_request(
            RequestKind::ThreadStart,
            RequestTarget::Anywhere,
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Int(0),
        )
        .unwrap();
    h.session.enable_request(key).await.unwrap();
    h.session.resume(&h.prepared).await.unwrap();

    let started = h.session.next_event(WAIT).await.unwrap();
    assert_eq!(event_thread(&started), t2);
    assert_eq!(h.session.pending(), vec![started.seq]);

    h.process.kill().await.unwrap();
    assert!(matches!(h.session.resume(&started).await, Err(CoordError::Disconnected)));
    // nothing is left to release once the process is gone
    assert!(h.session.pending().is_empty());
    assert!(matches!(
        h.session.resume(&started).await,
        Err(CoordError::DoubleResume(seq)) if seq == started.seq
    ));

    assert!(matches!(h.session.next_event(WAIT).await, Err(CoordError::Disconnected)));
    let thread = h.session.thread(t2);
    assert!(matches!(h.session.frames(&thread).await, Err(CoordError::Disconnected)));
}

#[tokio::test]
async fn test_request_for_unloaded_class_is_refused() {
    let program = Program::new()
        .class(worker())
        .class(ClassDef::new("demo.Later").method("run", 1, 9))
        .steps([Step::load("main", CLASS), Step::AwaitQuit]);
    let mut h = boot(program).await;

    let key = h
        .session
        .create_request(
            RequestKind::Breakpoint,
            RequestTarget::line("demo.Later", 3),
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Int(0),
        )
        .unwrap();
    assert!(matches!(
        h.session.enable_request(key).await,
        Err(CoordError::InvalidRequest(_))
    ));
    assert!(!h.session.registry().get(key).unwrap().is_enabled());

    let missing = h
        .session
        .create_request(
            RequestKind::Breakpoint,
            RequestTarget::line(CLASS, 99),
            Filters::none(),
            SuspendPolicy::EventThread,
            Tag::Int(1),
        )
        .unwrap();
    assert!(matches!(
        h.session.enable_request(missing).await,
        Err(CoordError::InvalidRequest(_))
    ));
}

fn driver_options() -> DriverOptions {
    DriverOptions {
        budget: Duration::from_secs(5),
        ..DriverOptions::default()
    }
}

#[tokio::test]
async fn test_driver_runs_demo_cases() {
    init_tracing();
    let SimLaunch {
        vm,
        process,
        rendezvous,
    } = SimVm::launch(Program::demo("demo.Target", "compute"));
    let session = Session::attach(vm.clone()).unwrap();
    let cases = vec![
        TestCase::new("pop compute", "demo.Target", "compute").popping(),
        TestCase::new("after return", "demo.Target", "run").at_line(12),
    ];

    let report = SessionDriver::new(session, process, rendezvous, cases, driver_options())
        .run()
        .await;

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(report.passed());
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.exit_status(95), 95);
    assert_eq!(report.cases[0].hits, 1);
    assert_eq!(report.cases[0].pops, 1);
    assert_eq!(report.cases[1].hits, 1);
    assert!(vm.is_dead());
}

#[tokio::test]
async fn test_driver_reports_missed_case() {
    init_tracing();
    let SimLaunch {
        vm,
        process,
        rendezvous,
    } = SimVm::launch(Program::demo("demo.Target", "compute"));
    let session = Session::attach(vm.clone()).unwrap();
    let cases = vec![TestCase::new("twice", "demo.Target", "run").at_line(12).hits(2)];
    let options = DriverOptions {
        budget: Duration::from_millis(500),
        ..DriverOptions::default()
    };

    let report = SessionDriver::new(session, process, rendezvous, cases, options)
        .run()
        .await;

    assert!(!report.passed());
    assert_eq!(report.cases[0].hits, 1);
    assert!(!report.cases[0].complete);
    assert_eq!(report.exit_status(95), 97);
    assert!(vm.is_dead());
}
