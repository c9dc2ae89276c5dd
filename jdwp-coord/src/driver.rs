// Session and session driver
//
// A Session bundles one transport with the engine state that belongs to it.
// The SessionDriver runs a list of test cases against a launched process:
// attach, iterate cases, tear down.

use crate::channel::EventChannel;
use crate::config::TestCase;
use crate::eventrequest::{RequestKind, RequestTarget};
use crate::events::{Event, EventKind, EventSet};
use crate::framepop::{FrameHandle, FramePopCoordinator};
use crate::process::Debuggee;
use crate::protocol::{CoordError, CoordResult};
use crate::registry::{Filters, RequestKey, RequestRegistry, Tag, WatchRequest};
use crate::rendezvous::{Rendezvous, Token};
use crate::suspension::{SuspensionController, ThreadHandle};
use crate::transport::{Command, Transport};
use crate::types::{class_name, Location, ObjectId, SuspendPolicy, ThreadId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// One controller/controlled-process pairing
pub struct Session<T> {
    transport: T,
    channel: EventChannel,
    registry: RequestRegistry,
    suspension: SuspensionController,
    frames: FramePopCoordinator,
}

impl<T: Transport> Session<T> {
    pub fn attach(mut transport: T) -> CoordResult<Self> {
        let channel = EventChannel::from_transport(&mut transport)?;
        info!("Session attached");
        Ok(Self {
            transport,
            channel,
            registry: RequestRegistry::new(),
            suspension: SuspensionController::new(),
            frames: FramePopCoordinator::new(),
        })
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn suspension(&self) -> &SuspensionController {
        &self.suspension
    }

    /// A VM-wide suspension (explicit or from an event set) is outstanding
    pub fn suspend_all_active(&self) -> bool {
        self.suspension.vm_suspends() > 0
    }

    /// Event sets delivered but not yet resumed
    pub fn pending(&self) -> Vec<u64> {
        self.channel.pending()
    }

    pub fn pops(&self) -> u64 {
        self.frames.pops()
    }

    pub async fn next_event(&mut self, timeout: Duration) -> CoordResult<EventSet> {
        let result = self.channel.next(&mut self.suspension, timeout).await;
        if let Err(CoordError::Disconnected) = result {
            self.suspension.detach_all().await;
        }
        result
    }

    pub async fn resume(&mut self, set: &EventSet) -> CoordResult<()> {
        self.channel.resume(&mut self.transport, &mut self.suspension, set).await
    }

    pub fn thread(&mut self, id: ThreadId) -> ThreadHandle {
        self.suspension.thread(id)
    }

    pub async fn thread_died(&mut self, id: ThreadId) {
        self.suspension.thread_died(id).await;
    }

    pub async fn all_threads(&mut self) -> CoordResult<Vec<ThreadHandle>> {
        let ids = self.transport.send(Command::AllThreads).await?.into_threads()?;
        Ok(ids.into_iter().map(|id| self.suspension.thread(id)).collect())
    }

    pub async fn thread_name(&mut self, thread: &ThreadHandle) -> CoordResult<String> {
        self.transport.send(Command::ThreadName(thread.id())).await?.into_name()
    }

    pub async fn is_suspended(&self, thread: &ThreadHandle) -> bool {
        self.suspension.is_suspended(thread).await
    }

    pub async fn suspend(&mut self, thread: &ThreadHandle) -> CoordResult<()> {
        self.suspension.suspend(&mut self.transport, thread).await
    }

    pub async fn resume_thread(&mut self, thread: &ThreadHandle) -> CoordResult<()> {
        self.suspension.resume_one(&mut self.transport, thread).await
    }

    pub async fn suspend_all(&mut self) -> CoordResult<()> {
        self.suspension.suspend_all(&mut self.transport).await
    }

    pub async fn resume_all(&mut self) -> CoordResult<()> {
        self.suspension.resume_all(&mut self.transport).await
    }

    pub async fn frames(&mut self, thread: &ThreadHandle) -> CoordResult<Vec<FrameHandle>> {
        self.frames.frames(&mut self.transport, thread).await
    }

    pub async fn frame(&mut self, thread: &ThreadHandle, index: usize) -> CoordResult<FrameHandle> {
        self.frames.frame(&mut self.transport, thread, index).await
    }

    pub async fn frame_count(&mut self, thread: &ThreadHandle) -> CoordResult<usize> {
        self.frames.frame_count(&mut self.transport, thread).await
    }

    pub async fn frame_location(&self, thread: &ThreadHandle, frame: &FrameHandle) -> CoordResult<Location> {
        self.frames.location(thread, frame).await
    }

    pub async fn pop_frame(&mut self, thread: &ThreadHandle, frame: &FrameHandle) -> CoordResult<u64> {
        self.frames.pop_frame(&mut self.transport, thread, frame).await
    }

    /// Monitors the thread holds; the thread must be suspended
    pub async fn owned_monitors(&mut self, thread: &ThreadHandle) -> CoordResult<Vec<ObjectId>> {
        let state = thread.lock().await;
        SuspensionController::require_suspended(thread.id(), &state)?;
        self.transport
            .send(Command::OwnedMonitors(thread.id()))
            .await?
            .into_monitors()
    }

    pub fn create_request(
        &mut self,
        kind: RequestKind,
        target: RequestTarget,
        filters: Filters,
        policy: SuspendPolicy,
        tag: impl Into<Tag>,
    ) -> CoordResult<RequestKey> {
        self.registry.create(kind, target, filters, policy, tag)
    }

    pub async fn enable_request(&mut self, key: RequestKey) -> CoordResult<()> {
        self.registry.enable(&mut self.transport, key).await
    }

    pub async fn disable_request(&mut self, key: RequestKey) -> CoordResult<()> {
        self.registry.disable(&mut self.transport, key).await
    }

    pub async fn remove_request(&mut self, key: RequestKey) -> CoordResult<WatchRequest> {
        self.registry.remove(&mut self.transport, key).await
    }

    pub async fn disable_all_requests(&mut self) -> CoordResult<()> {
        self.registry.disable_all(&mut self.transport).await
    }

    pub fn resolve(&self, event: &Event) -> CoordResult<Option<&WatchRequest>> {
        self.registry.resolve(event)
    }

    /// Drop every request and release the controlled process
    pub async fn detach(&mut self) -> CoordResult<()> {
        self.disable_all_requests().await?;
        self.transport.send(Command::Dispose).await?.into_done()?;
        info!("Session detached");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Budget for every blocking wait
    pub budget: Duration,
    pub base_status: i32,
    /// The first event set is the VM_START stop of a process launched suspended
    pub vm_start_suspended: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(120),
            base_status: 95,
            vm_start_suspended: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseReport {
    pub name: String,
    pub hits: u32,
    pub pops: u32,
    pub complete: bool,
    pub failures: Vec<String>,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.complete && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub cases: Vec<CaseReport>,
    /// Session-level failures not tied to one case
    pub errors: Vec<String>,
    /// Status lines the controlled process printed on the rendezvous pipe
    pub statuses: Vec<String>,
    pub disconnected: bool,
    pub exit_code: Option<i32>,
}

impl SessionReport {
    pub fn passed(&self) -> bool {
        self.errors.is_empty() && self.cases.iter().all(CaseReport::passed)
    }

    pub fn exit_status(&self, base: i32) -> i32 {
        if self.passed() {
            base
        } else {
            base + 2
        }
    }
}

struct CaseState {
    case: TestCase,
    request: Option<RequestKey>,
    report: CaseReport,
}

/// Outcome of a pop verification that did not go as expected
#[derive(Debug)]
enum PopCheck {
    Mismatch(String),
    Error(CoordError),
}

impl From<CoordError> for PopCheck {
    fn from(e: CoordError) -> Self {
        PopCheck::Error(e)
    }
}

impl fmt::Display for PopCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopCheck::Mismatch(msg) => write!(f, "{}", msg),
            PopCheck::Error(e) => write!(f, "{}", e),
        }
    }
}

pub struct SessionDriver<T, P, R, W> {
    session: Session<T>,
    process: P,
    rendezvous: Rendezvous<R, W>,
    cases: Vec<CaseState>,
    options: DriverOptions,
}

impl<T, P, R, W> SessionDriver<T, P, R, W>
where
    T: Transport,
    P: Debuggee,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        session: Session<T>,
        process: P,
        rendezvous: Rendezvous<R, W>,
        cases: Vec<TestCase>,
        options: DriverOptions,
    ) -> Self {
        let cases = cases
            .into_iter()
            .map(|case| CaseState {
                report: CaseReport {
                    name: case.name.clone(),
                    ..CaseReport::default()
                },
                case,
                request: None,
            })
            .collect();
        Self {
            session,
            process,
            rendezvous,
            cases,
            options,
        }
    }

    pub async fn run(mut self) -> SessionReport {
        let mut report = SessionReport::default();

        let mut hung = false;
        if let Err(e) = self.drive(&mut report).await {
            error!("Session failed: {}", e);
            match e {
                CoordError::Disconnected => report.disconnected = true,
                CoordError::Timeout(_) => hung = true,
                _ => {}
            }
            report.errors.push(e.to_string());
        }

        self.teardown(&mut report, hung).await;
        report.cases = self.cases.into_iter().map(|state| state.report).collect();

        info!(
            "Session finished: {} ({} case(s), {} error(s))",
            if report.passed() { "PASSED" } else { "FAILED" },
            report.cases.len(),
            report.errors.len()
        );
        report
    }

    async fn drive(&mut self, report: &mut SessionReport) -> CoordResult<()> {
        self.attach(report).await?;
        self.run_cases(report).await
    }

    /// Phase 1: arm class-prepare traps, release the process, rendezvous
    async fn attach(&mut self, report: &mut SessionReport) -> CoordResult<()> {
        let budget = self.options.budget;

        let start = if self.options.vm_start_suspended {
            let set = self.session.next_event(budget).await?;
            if !set.events.iter().any(|e| matches!(e.details, EventKind::VmStart { .. })) {
                warn!("First event set is not VM_START: {:?}", set.events);
            }
            Some(set)
        } else {
            None
        };

        let mut classes: Vec<String> = Vec::new();
        for state in &self.cases {
            if !classes.contains(&state.case.class) {
                classes.push(state.case.class.clone());
            }
        }
        for class in &classes {
            let key = self.session.create_request(
                RequestKind::ClassPrepare,
                RequestTarget::classes(class.clone()),
                Filters::none(),
                SuspendPolicy::EventThread,
                Tag::Text(class.clone()),
            )?;
            self.session.enable_request(key).await?;
        }

        for index in 0..self.cases.len() {
            let case = &self.cases[index].case;
            let key = self.session.create_request(
                case.kind(),
                case.target(),
                Filters::none(),
                case.suspend_policy,
                Tag::Int(index as i64),
            )?;
            self.cases[index].request = Some(key);
            // already loaded classes can be armed right away
            if !self.options.vm_start_suspended {
                self.arm_case(index).await?;
            }
        }

        if let Some(set) = start {
            self.session.resume(&set).await?;
        }

        let statuses = self.rendezvous.wait_for(&Token::Ready, budget).await?;
        report.statuses.extend(statuses);
        self.rendezvous.send(&Token::Go).await?;
        info!("Controlled process is running {} case(s)", self.cases.len());
        Ok(())
    }

    /// Phase 2: consume stops until every case completes or the process dies
    async fn run_cases(&mut self, report: &mut SessionReport) -> CoordResult<()> {
        while self.cases.iter().any(|state| !state.report.complete) {
            let set = self.session.next_event(self.options.budget).await?;

            for event in &set.events {
                match &event.details {
                    EventKind::ClassPrepare { signature, .. } => {
                        self.on_class_prepare(event, &class_name(signature), report).await?;
                    }
                    EventKind::Breakpoint { thread, .. } | EventKind::MethodEntry { thread, .. } => {
                        self.on_trap(event, *thread, report).await?;
                    }
                    EventKind::ThreadStart { thread } => {
                        self.session.thread(*thread);
                    }
                    EventKind::ThreadDeath { thread } => self.session.thread_died(*thread).await,
                    EventKind::VmStart { .. } => {}
                    EventKind::VmDeath => {}
                }
            }

            if set.is_vm_death() {
                info!("Controlled process died with cases outstanding");
                report.disconnected = true;
                return Ok(());
            }
            self.session.resume(&set).await?;
        }
        Ok(())
    }

    async fn arm_case(&mut self, index: usize) -> CoordResult<bool> {
        let Some(key) = self.cases[index].request else {
            return Ok(false);
        };
        match self.session.enable_request(key).await {
            Ok(()) => {
                info!("Armed case {}", self.cases[index].case.name);
                Ok(true)
            }
            Err(CoordError::InvalidRequest(reason)) => {
                debug!("Case {} not armed yet: {}", self.cases[index].case.name, reason);
                Ok(false)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.cases[index].report.failures.push(format!("arming failed: {}", e));
                Ok(false)
            }
        }
    }

    async fn on_class_prepare(&mut self, event: &Event, class: &str, report: &mut SessionReport) -> CoordResult<()> {
        let prepare_key = match self.session.resolve(event) {
            Ok(Some(request)) => request.key(),
            Ok(None) => {
                debug!("Unclaimed class prepare for {}", class);
                return Ok(());
            }
            Err(e) => {
                report.errors.push(e.to_string());
                return Ok(());
            }
        };
        info!("Class {} prepared", class);

        let waiting: Vec<usize> = (0..self.cases.len())
            .filter(|&i| self.cases[i].case.class == class && !self.case_armed(i))
            .collect();
        let mut all_armed = true;
        for index in waiting {
            all_armed &= self.arm_case(index).await?;
        }

        if all_armed {
            self.session.disable_request(prepare_key).await?;
        }
        Ok(())
    }

    fn case_armed(&self, index: usize) -> bool {
        self.cases[index]
            .request
            .and_then(|key| self.session.registry().get(key).ok())
            .is_some_and(WatchRequest::is_enabled)
    }

    async fn on_trap(&mut self, event: &Event, thread: ThreadId, report: &mut SessionReport) -> CoordResult<()> {
        let index = match self.session.resolve(event) {
            Ok(Some(request)) => match request.tag() {
                Tag::Int(index) => *index as usize,
                Tag::Text(_) => return Ok(()),
            },
            Ok(None) => {
                debug!("Unclaimed stop in thread {:#x}", thread);
                return Ok(());
            }
            Err(e) => {
                report.errors.push(e.to_string());
                return Ok(());
            }
        };
        if index >= self.cases.len() || self.cases[index].report.complete {
            return Ok(());
        }

        self.cases[index].report.hits += 1;
        info!(
            "Case {} hit {}/{} in thread {:#x}",
            self.cases[index].case.name, self.cases[index].report.hits, self.cases[index].case.expected_hits, thread
        );

        if self.cases[index].case.pop {
            match self.verify_pop(thread).await {
                Ok(()) => self.cases[index].report.pops += 1,
                Err(PopCheck::Error(e)) if e.is_fatal() => return Err(e),
                Err(failure) => {
                    warn!("Case {}: {}", self.cases[index].case.name, failure);
                    self.cases[index].report.failures.push(failure.to_string());
                }
            }
        }

        if self.cases[index].report.hits >= self.cases[index].case.expected_hits {
            self.cases[index].report.complete = true;
            if let Some(key) = self.cases[index].request {
                if let Err(e) = self.session.disable_request(key).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    self.cases[index].report.failures.push(format!("disabling failed: {}", e));
                }
            }
        }
        Ok(())
    }

    /// Pop the trapped frame and check the stack the way a caller would see it
    async fn verify_pop(&mut self, thread_id: ThreadId) -> Result<(), PopCheck> {
        let thread = self.session.thread(thread_id);
        let frames = self.session.frames(&thread).await?;
        if frames.len() < 2 {
            return Err(PopCheck::Mismatch(format!(
                "{} frame(s) on the stack, nothing to return into",
                frames.len()
            )));
        }

        let before = thread.stack_generation().await;
        let after = self.session.pop_frame(&thread, &frames[0]).await?;
        if after != before + 1 {
            return Err(PopCheck::Mismatch(format!(
                "generation went from {} to {} across one pop",
                before, after
            )));
        }

        match self.session.frame_location(&thread, &frames[1]).await {
            Err(CoordError::StaleFrame { .. }) => {}
            Ok(_) => return Err(PopCheck::Mismatch("frame handle survived the pop".to_string())),
            Err(e) => return Err(e.into()),
        }

        let top = self.session.frame(&thread, 0).await?;
        if top.captured_location() != frames[1].captured_location() {
            return Err(PopCheck::Mismatch(format!(
                "top frame at {} after pop, caller was at {}",
                top.captured_location(),
                frames[1].captured_location()
            )));
        }
        Ok(())
    }

    /// Phase 3: release everything, ask the process to quit, reap it
    async fn teardown(&mut self, report: &mut SessionReport, mut hung: bool) {
        if !hung && !report.disconnected {
            if let Err(e) = self.session.detach().await {
                warn!("Detach failed: {}", e);
                if !matches!(e, CoordError::Disconnected) {
                    report.errors.push(format!("detach: {}", e));
                }
            }
        }

        if !hung {
            if let Err(e) = self.rendezvous.send(&Token::Quit).await {
                debug!("QUIT not delivered: {}", e);
            }
            match tokio::time::timeout(self.options.budget, self.process.wait_for_exit()).await {
                Ok(Ok(code)) => report.exit_code = Some(code),
                Ok(Err(e)) => report.errors.push(format!("waiting for exit: {}", e)),
                Err(_) => {
                    report.errors.push("controlled process did not exit in time".to_string());
                    hung = true;
                }
            }
        }

        if hung {
            if let Err(e) = self.process.kill().await {
                error!("Failed to kill controlled process: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str, complete: bool, failures: &[&str]) -> CaseReport {
        CaseReport {
            name: name.to_string(),
            hits: 1,
            pops: 0,
            complete,
            failures: failures.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn test_exit_status_from_report() {
        let mut report = SessionReport {
            cases: vec![case("a", true, &[]), case("b", true, &[])],
            ..SessionReport::default()
        };
        assert!(report.passed());
        assert_eq!(report.exit_status(95), 95);

        report.cases.push(case("c", false, &[]));
        assert_eq!(report.exit_status(95), 97);

        report.cases.pop();
        report.errors.push("Timeout".to_string());
        assert!(!report.passed());
    }

    #[test]
    fn test_case_with_failure_does_not_pass() {
        assert!(!case("a", true, &["frame handle survived the pop"]).passed());
    }

    #[test]
    fn test_report_serializes() {
        let report = SessionReport {
            cases: vec![case("a", true, &[])],
            exit_code: Some(0),
            ..SessionReport::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cases"][0]["name"], "a");
        assert_eq!(json["exit_code"], 0);
    }
}
