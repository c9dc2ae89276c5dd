// Simulated controlled process
//
// Runs a scripted program of per-thread steps and answers the same
// Command/Reply vocabulary a JVM does. All VM state sits behind one mutex,
// so popping frames and releasing their monitors happen in one step.

use crate::eventrequest::{RequestKind, RequestSpec, RequestTarget};
use crate::events::{Event, EventKind, EventSet};
use crate::process::Debuggee;
use crate::protocol::{error_codes, error_message, CoordError, CoordResult};
use crate::rendezvous::{Rendezvous, Token};
use crate::transport::{Command, Reply, Transport};
use crate::types::{
    class_matches, class_signature, ClassId, FrameId, FrameInfo, Location, MethodId, ObjectId, RequestId,
    SuspendPolicy, ThreadId,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// JDWP class status bits VERIFIED | PREPARED
const CLASS_PREPARED: i32 = 3;

const MAIN_THREAD: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub first_line: u32,
    pub last_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub name: String,
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>, first_line: u32, last_line: u32) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            first_line,
            last_line,
        });
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}

/// One instruction of the scripted program
///
/// Thread steps wait until their thread is running; the rest run on the
/// main thread's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Print READY and block until GO
    Ready,
    Status(String),
    /// Block until QUIT or the pipe closes
    AwaitQuit,
    StartThread(String),
    EndThread(String),
    LoadClass {
        thread: String,
        class: String,
    },
    /// Invoke a method; `monitor` makes it synchronized on that monitor
    Call {
        thread: String,
        class: String,
        method: String,
        monitor: Option<String>,
    },
    Line {
        thread: String,
        line: u32,
    },
    Return {
        thread: String,
    },
    Enter {
        thread: String,
        monitor: String,
    },
    Exit {
        thread: String,
        monitor: String,
    },
}

impl Step {
    pub fn status(text: impl Into<String>) -> Self {
        Step::Status(text.into())
    }

    pub fn start(thread: impl Into<String>) -> Self {
        Step::StartThread(thread.into())
    }

    pub fn end(thread: impl Into<String>) -> Self {
        Step::EndThread(thread.into())
    }

    pub fn load(thread: impl Into<String>, class: impl Into<String>) -> Self {
        Step::LoadClass {
            thread: thread.into(),
            class: class.into(),
        }
    }

    pub fn call(thread: impl Into<String>, class: impl Into<String>, method: impl Into<String>) -> Self {
        Step::Call {
            thread: thread.into(),
            class: class.into(),
            method: method.into(),
            monitor: None,
        }
    }

    pub fn call_synchronized(
        thread: impl Into<String>,
        class: impl Into<String>,
        method: impl Into<String>,
        monitor: impl Into<String>,
    ) -> Self {
        Step::Call {
            thread: thread.into(),
            class: class.into(),
            method: method.into(),
            monitor: Some(monitor.into()),
        }
    }

    pub fn line(thread: impl Into<String>, line: u32) -> Self {
        Step::Line {
            thread: thread.into(),
            line,
        }
    }

    pub fn ret(thread: impl Into<String>) -> Self {
        Step::Return { thread: thread.into() }
    }

    pub fn enter(thread: impl Into<String>, monitor: impl Into<String>) -> Self {
        Step::Enter {
            thread: thread.into(),
            monitor: monitor.into(),
        }
    }

    pub fn exit(thread: impl Into<String>, monitor: impl Into<String>) -> Self {
        Step::Exit {
            thread: thread.into(),
            monitor: monitor.into(),
        }
    }

    fn thread(&self) -> Option<&str> {
        match self {
            Step::Ready | Step::Status(_) | Step::AwaitQuit => None,
            Step::StartThread(thread) | Step::EndThread(thread) => Some(thread.as_str()),
            Step::LoadClass { thread, .. }
            | Step::Call { thread, .. }
            | Step::Line { thread, .. }
            | Step::Return { thread }
            | Step::Enter { thread, .. }
            | Step::Exit { thread, .. } => Some(thread.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    classes: Vec<ClassDef>,
    steps: Vec<Step>,
    start_suspended: bool,
    exit_code: i32,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.push(class);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Stop everything at VM start until the controller resumes
    pub fn start_suspended(mut self) -> Self {
        self.start_suspended = true;
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// main() calls run(), which calls `method` synchronized on "lock"
    ///
    /// Lines: main 1-5, run 10-19 (stops at 11 and 12), `method` 20-29
    /// (stops at 21).
    pub fn demo(class: &str, method: &str) -> Self {
        let mut def = ClassDef::new(class).method("main", 1, 5).method("run", 10, 19);
        let nested = !def.has_method(method);
        if nested {
            def = def.method(method, 20, 29);
        }

        let mut steps = vec![
            Step::Ready,
            Step::load(MAIN_THREAD, class),
            Step::call(MAIN_THREAD, class, "main"),
            Step::call(MAIN_THREAD, class, "run"),
            Step::line(MAIN_THREAD, 11),
        ];
        if nested {
            steps.extend([
                Step::call_synchronized(MAIN_THREAD, class, method, "lock"),
                Step::line(MAIN_THREAD, 21),
                Step::ret(MAIN_THREAD),
            ]);
        }
        steps.extend([
            Step::line(MAIN_THREAD, 12),
            Step::ret(MAIN_THREAD),
            Step::ret(MAIN_THREAD),
            Step::status("done"),
            Step::AwaitQuit,
        ]);

        Program::new().class(def).steps(steps).start_suspended()
    }

    /// Every thread the program mentions, main first
    fn thread_names(&self) -> Vec<String> {
        let mut names = vec![MAIN_THREAD.to_string()];
        for name in self.steps.iter().filter_map(Step::thread) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

#[derive(Debug)]
struct SimMethod {
    id: MethodId,
    name: String,
    first_line: u32,
    last_line: u32,
}

#[derive(Debug)]
struct SimClass {
    id: ClassId,
    name: String,
    loaded: bool,
    methods: Vec<SimMethod>,
}

#[derive(Debug, Clone)]
struct Call {
    class_id: ClassId,
    method_id: MethodId,
    monitor: Option<String>,
}

#[derive(Debug)]
struct SimFrame {
    id: FrameId,
    call: Call,
    line: u32,
    /// Monitors entered by this activation, in order
    held: Vec<String>,
}

impl SimFrame {
    fn location(&self) -> Location {
        Location::new(self.call.class_id, self.call.method_id, self.line as u64)
    }
}

#[derive(Debug)]
struct SimThread {
    name: String,
    alive: bool,
    /// ThreadDeath reported; the thread ends once it runs again
    dying: bool,
    suspend_count: u32,
    /// Bottom first
    stack: Vec<SimFrame>,
    /// Calls to re-execute once the thread runs again, after a pop
    replay: VecDeque<Call>,
}

#[derive(Debug)]
struct SimMonitor {
    id: ObjectId,
    owner: Option<ThreadId>,
    entries: u32,
}

#[derive(Debug)]
struct Armed {
    spec: RequestSpec,
    location: Option<Location>,
}

impl Armed {
    fn traps(&self, kind: RequestKind, thread: ThreadId, class: &str, location: Option<Location>) -> bool {
        if self.spec.kind != kind || self.spec.thread.is_some_and(|t| t != thread) {
            return false;
        }
        if let Some(filter) = &self.spec.class_filter {
            if !class_matches(filter, class) {
                return false;
            }
        }
        match &self.spec.target {
            RequestTarget::Anywhere => true,
            RequestTarget::Classes { pattern } => class_matches(pattern, class),
            RequestTarget::Line { .. } => location.is_some() && self.location == location,
            RequestTarget::Method { .. } => match (self.location, location) {
                (Some(armed), Some(at)) => armed.same_method(&at),
                _ => false,
            },
        }
    }
}

fn jdwp_error(code: u16) -> CoordError {
    CoordError::JdwpErrorCode(code, error_message(code).to_string())
}

#[derive(Debug)]
struct VmState {
    next_id: u64,
    classes: Vec<SimClass>,
    threads: BTreeMap<ThreadId, SimThread>,
    thread_ids: HashMap<String, ThreadId>,
    monitors: HashMap<String, SimMonitor>,
    requests: BTreeMap<RequestId, Armed>,
    next_request: RequestId,
    event_tx: Option<mpsc::UnboundedSender<EventSet>>,
    dead: bool,
}

impl VmState {
    fn new(program: &Program, event_tx: mpsc::UnboundedSender<EventSet>) -> Self {
        let mut state = Self {
            next_id: 0x1000,
            classes: Vec::new(),
            threads: BTreeMap::new(),
            thread_ids: HashMap::new(),
            monitors: HashMap::new(),
            requests: BTreeMap::new(),
            next_request: 0,
            event_tx: Some(event_tx),
            dead: false,
        };

        for def in &program.classes {
            let id = state.fresh_id();
            let methods = def
                .methods
                .iter()
                .map(|m| SimMethod {
                    id: state.fresh_id(),
                    name: m.name.clone(),
                    first_line: m.first_line,
                    last_line: m.last_line,
                })
                .collect();
            state.classes.push(SimClass {
                id,
                name: def.name.clone(),
                loaded: false,
                methods,
            });
        }

        for name in program.thread_names() {
            let id = state.fresh_id();
            state.threads.insert(
                id,
                SimThread {
                    alive: name == MAIN_THREAD,
                    dying: false,
                    name: name.clone(),
                    suspend_count: 0,
                    stack: Vec::new(),
                    replay: VecDeque::new(),
                },
            );
            state.thread_ids.insert(name, id);
        }
        state
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn class_named(&self, name: &str) -> Option<&SimClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    fn class_name_of(&self, id: ClassId) -> String {
        self.classes
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    fn runnable(&self, id: ThreadId) -> bool {
        self.threads
            .get(&id)
            .is_some_and(|t| t.alive && t.suspend_count == 0)
    }

    fn live_thread(&mut self, id: ThreadId) -> CoordResult<&mut SimThread> {
        match self.threads.get_mut(&id) {
            Some(thread) if thread.alive => Ok(thread),
            _ => Err(jdwp_error(error_codes::INVALID_THREAD)),
        }
    }

    fn suspended_thread(&mut self, id: ThreadId) -> CoordResult<&mut SimThread> {
        let thread = self.live_thread(id)?;
        if thread.suspend_count == 0 {
            return Err(CoordError::from_error_code(error_codes::THREAD_NOT_SUSPENDED, id));
        }
        Ok(thread)
    }

    fn monitor_free_for(&self, name: &str, thread: ThreadId) -> bool {
        self.monitors
            .get(name)
            .map_or(true, |m| m.owner.is_none() || m.owner == Some(thread))
    }

    fn acquire(&mut self, name: &str, thread: ThreadId) {
        if !self.monitors.contains_key(name) {
            let id = self.fresh_id();
            self.monitors.insert(
                name.to_string(),
                SimMonitor {
                    id,
                    owner: None,
                    entries: 0,
                },
            );
        }
        if let Some(monitor) = self.monitors.get_mut(name) {
            monitor.owner = Some(thread);
            monitor.entries += 1;
        }
    }

    fn release(&mut self, name: &str, thread: ThreadId) {
        match self.monitors.get_mut(name) {
            Some(monitor) if monitor.owner == Some(thread) => {
                monitor.entries -= 1;
                if monitor.entries == 0 {
                    monitor.owner = None;
                }
            }
            _ => warn!("Thread {:#x} released monitor {} it does not own", thread, name),
        }
    }

    /// Events for every armed request that traps here
    fn collect(
        &self,
        kind: RequestKind,
        thread: ThreadId,
        class: &str,
        location: Option<Location>,
        details: &EventKind,
    ) -> Vec<(SuspendPolicy, Event)> {
        self.requests
            .iter()
            .filter(|(_, armed)| armed.traps(kind, thread, class, location))
            .map(|(&id, armed)| (armed.spec.suspend_policy, Event::new(id, details.clone())))
            .collect()
    }

    /// Deliver one composite stop and apply its suspension
    fn emit(&mut self, thread: Option<ThreadId>, events: Vec<(SuspendPolicy, Event)>) {
        let Some(policy) = events.iter().map(|(policy, _)| *policy).max() else {
            return;
        };

        match policy {
            SuspendPolicy::None => {}
            SuspendPolicy::EventThread => {
                if let Some(t) = thread.and_then(|id| self.threads.get_mut(&id)) {
                    t.suspend_count += 1;
                }
            }
            SuspendPolicy::All => {
                for t in self.threads.values_mut().filter(|t| t.alive) {
                    t.suspend_count += 1;
                }
            }
        }

        let set = EventSet::new(policy, events.into_iter().map(|(_, event)| event).collect());
        debug!("Simulated VM stop: {:?}", set);
        if let Some(tx) = &self.event_tx {
            if tx.send(set).is_err() {
                debug!("Nobody is listening for events");
            }
        }
    }

    fn push_call(&mut self, thread: ThreadId, call: Call) {
        let Some(line) = self
            .classes
            .iter()
            .find(|c| c.id == call.class_id)
            .and_then(|c| c.methods.iter().find(|m| m.id == call.method_id))
            .map(|m| m.first_line)
        else {
            warn!("Call into unknown method {:#x}", call.method_id);
            return;
        };

        if let Some(monitor) = &call.monitor {
            self.acquire(monitor, thread);
        }
        let frame = SimFrame {
            id: self.fresh_id(),
            held: call.monitor.iter().cloned().collect(),
            call,
            line,
        };
        let location = frame.location();
        if let Some(t) = self.threads.get_mut(&thread) {
            t.stack.push(frame);
        }

        let class = self.class_name_of(location.class_id);
        let mut events = self.collect(
            RequestKind::MethodEntry,
            thread,
            &class,
            Some(location),
            &EventKind::MethodEntry { thread, location },
        );
        events.extend(self.collect(
            RequestKind::Breakpoint,
            thread,
            &class,
            Some(location),
            &EventKind::Breakpoint { thread, location },
        ));
        self.emit(Some(thread), events);
    }

    fn load_class(&mut self, thread: ThreadId, name: &str) {
        if self.class_named(name).is_none() {
            let id = self.fresh_id();
            self.classes.push(SimClass {
                id,
                name: name.to_string(),
                loaded: false,
                methods: Vec::new(),
            });
        }
        let Some(class) = self.classes.iter_mut().find(|c| c.name == name) else {
            return;
        };
        if class.loaded {
            return;
        }
        class.loaded = true;
        let ref_type = class.id;
        info!("Simulated VM loaded {}", name);

        let details = EventKind::ClassPrepare {
            thread,
            ref_type,
            signature: class_signature(name),
            status: CLASS_PREPARED,
        };
        let events = self.collect(RequestKind::ClassPrepare, thread, name, None, &details);
        self.emit(Some(thread), events);
    }

    /// Re-execute popped calls of threads that run again
    fn run_replays(&mut self) {
        let ids: Vec<ThreadId> = self.threads.keys().copied().collect();
        for id in ids {
            loop {
                let next = match self.threads.get(&id) {
                    Some(t) if t.alive && t.suspend_count == 0 => t.replay.front().cloned(),
                    _ => None,
                };
                let Some(call) = next else {
                    break;
                };
                if let Some(monitor) = &call.monitor {
                    if !self.monitor_free_for(monitor, id) {
                        break;
                    }
                }
                if let Some(t) = self.threads.get_mut(&id) {
                    t.replay.pop_front();
                }
                debug!("Thread {:#x} replays call into {:#x}", id, call.method_id);
                self.push_call(id, call);
            }
        }
    }

    /// Try to execute a thread step; None means it has to wait
    fn try_step(&mut self, id: ThreadId, step: &Step) -> Option<()> {
        if let Step::StartThread(name) = step {
            if let Some(t) = self.threads.get_mut(&id) {
                t.alive = true;
            }
            info!("Simulated thread {} started", name);
            let details = EventKind::ThreadStart { thread: id };
            let events = self.collect(RequestKind::ThreadStart, id, "", None, &details);
            self.emit(Some(id), events);
            return Some(());
        }

        let idle = self.threads.get(&id).is_some_and(|t| t.replay.is_empty());
        if !self.runnable(id) || !idle {
            return None;
        }

        match step {
            Step::LoadClass { class, .. } => self.load_class(id, class),
            Step::Call {
                class,
                method,
                monitor,
                ..
            } => {
                let Some(target) = self.class_named(class) else {
                    warn!("Call into unknown class {}", class);
                    return Some(());
                };
                if !target.loaded {
                    // first use loads the class; the call runs once the
                    // thread is free again
                    self.load_class(id, class);
                    return None;
                }
                let Some(method_id) = target.methods.iter().find(|m| &m.name == method).map(|m| m.id) else {
                    warn!("Call into unknown method {}.{}", class, method);
                    return Some(());
                };
                if monitor.as_deref().is_some_and(|m| !self.monitor_free_for(m, id)) {
                    return None;
                }
                let call = Call {
                    class_id: target.id,
                    method_id,
                    monitor: monitor.clone(),
                };
                self.push_call(id, call);
            }
            Step::Line { line, .. } => {
                let Some(location) = self.threads.get_mut(&id).and_then(|t| t.stack.last_mut()).map(|frame| {
                    frame.line = *line;
                    frame.location()
                }) else {
                    warn!("Line step on an empty stack");
                    return Some(());
                };
                let class = self.class_name_of(location.class_id);
                let events = self.collect(
                    RequestKind::Breakpoint,
                    id,
                    &class,
                    Some(location),
                    &EventKind::Breakpoint { thread: id, location },
                );
                self.emit(Some(id), events);
            }
            Step::Return { .. } => {
                let frame = self.threads.get_mut(&id).and_then(|t| t.stack.pop());
                for monitor in frame.map(|f| f.held).unwrap_or_default() {
                    self.release(&monitor, id);
                }
            }
            Step::Enter { monitor, .. } => {
                if !self.monitor_free_for(monitor, id) {
                    return None;
                }
                self.acquire(monitor, id);
                if let Some(frame) = self.threads.get_mut(&id).and_then(|t| t.stack.last_mut()) {
                    frame.held.push(monitor.clone());
                }
            }
            Step::Exit { monitor, .. } => {
                if let Some(frame) = self
                    .threads
                    .get_mut(&id)
                    .and_then(|t| t.stack.iter_mut().rev().find(|f| f.held.contains(monitor)))
                {
                    if let Some(pos) = frame.held.iter().rposition(|m| m == monitor) {
                        frame.held.remove(pos);
                    }
                }
                self.release(monitor, id);
            }
            Step::EndThread(name) => {
                let dying = self.threads.get(&id).is_some_and(|t| t.dying);
                if !dying {
                    let mut held = Vec::new();
                    if let Some(t) = self.threads.get_mut(&id) {
                        t.dying = true;
                        held = t.stack.drain(..).flat_map(|f| f.held).collect();
                        t.replay.clear();
                    }
                    for monitor in held {
                        self.release(&monitor, id);
                    }
                    let details = EventKind::ThreadDeath { thread: id };
                    let events = self.collect(RequestKind::ThreadDeath, id, "", None, &details);
                    self.emit(Some(id), events);
                    // a stopping ThreadDeath keeps the thread until it is resumed
                    if !self.runnable(id) {
                        return None;
                    }
                }
                if let Some(t) = self.threads.get_mut(&id) {
                    t.alive = false;
                }
                info!("Simulated thread {} ended", name);
            }
            Step::Ready | Step::Status(_) | Step::AwaitQuit | Step::StartThread(_) => {}
        }
        Some(())
    }

    fn resolve_target(&self, spec: &RequestSpec) -> CoordResult<Option<Location>> {
        let loaded = |name: &str| {
            self.class_named(name)
                .filter(|c| c.loaded)
                .ok_or_else(|| CoordError::InvalidRequest(format!("Class {} is not loaded", name)))
        };

        match &spec.target {
            RequestTarget::Anywhere | RequestTarget::Classes { .. } => Ok(None),
            RequestTarget::Line { class, line } => {
                let class_def = loaded(class)?;
                class_def
                    .methods
                    .iter()
                    .find(|m| (m.first_line..=m.last_line).contains(line))
                    .map(|m| Some(Location::new(class_def.id, m.id, *line as u64)))
                    .ok_or_else(|| CoordError::InvalidRequest(format!("No code at {}:{}", class, line)))
            }
            RequestTarget::Method { class, method, .. } => {
                let class_def = loaded(class)?;
                class_def
                    .methods
                    .iter()
                    .find(|m| &m.name == method)
                    .map(|m| Some(Location::new(class_def.id, m.id, m.first_line as u64)))
                    .ok_or_else(|| CoordError::InvalidRequest(format!("No method {}.{}", class, method)))
            }
        }
    }

    fn handle(&mut self, command: Command) -> CoordResult<Reply> {
        match command {
            Command::SetRequest(spec) => {
                let location = self.resolve_target(&spec)?;
                self.next_request += 1;
                let request_id = self.next_request;
                self.requests.insert(request_id, Armed { spec, location });
                Ok(Reply::Armed {
                    request_id,
                    location,
                })
            }
            Command::ClearRequest { request_id, .. } => {
                self.requests.remove(&request_id);
                Ok(Reply::Done)
            }
            Command::SuspendThread(id) => {
                self.live_thread(id)?.suspend_count += 1;
                Ok(Reply::Done)
            }
            Command::ResumeThread(id) => {
                let thread = self.live_thread(id)?;
                thread.suspend_count = thread.suspend_count.saturating_sub(1);
                Ok(Reply::Done)
            }
            Command::SuspendAll => {
                for t in self.threads.values_mut().filter(|t| t.alive) {
                    t.suspend_count += 1;
                }
                Ok(Reply::Done)
            }
            Command::ResumeAll => {
                for t in self.threads.values_mut().filter(|t| t.alive) {
                    t.suspend_count = t.suspend_count.saturating_sub(1);
                }
                Ok(Reply::Done)
            }
            Command::AllThreads => Ok(Reply::Threads(
                self.threads
                    .iter()
                    .filter(|(_, t)| t.alive)
                    .map(|(&id, _)| id)
                    .collect(),
            )),
            Command::ThreadName(id) => Ok(Reply::Name(self.live_thread(id)?.name.clone())),
            Command::FrameCount(id) => Ok(Reply::Count(self.suspended_thread(id)?.stack.len())),
            Command::Frames { thread, start, length } => {
                let thread = self.suspended_thread(thread)?;
                let depth = thread.stack.len();
                let length = length.unwrap_or(depth.saturating_sub(start));
                if start > depth || start + length > depth {
                    return Err(jdwp_error(error_codes::INVALID_INDEX));
                }
                Ok(Reply::Frames(
                    thread
                        .stack
                        .iter()
                        .rev()
                        .skip(start)
                        .take(length)
                        .map(|f| FrameInfo {
                            frame_id: f.id,
                            location: f.location(),
                        })
                        .collect(),
                ))
            }
            Command::PopFrames { thread: id, frame_id } => {
                let thread = self.suspended_thread(id)?;
                let pos = thread
                    .stack
                    .iter()
                    .position(|f| f.id == frame_id)
                    .ok_or_else(|| jdwp_error(error_codes::INVALID_FRAMEID))?;
                if pos == 0 {
                    // a thread's entry frame has no caller to return into
                    return Err(jdwp_error(error_codes::NO_MORE_FRAMES));
                }

                let popped: Vec<SimFrame> = thread.stack.drain(pos..).collect();
                for frame in popped.iter().rev() {
                    thread.replay.push_front(frame.call.clone());
                }
                let released: Vec<String> = popped.into_iter().flat_map(|f| f.held).collect();
                let depth = thread.stack.len();
                for monitor in &released {
                    self.release(monitor, id);
                }
                info!(
                    "Simulated pop on thread {:#x}: depth now {}, released {:?}",
                    id, depth, released
                );
                Ok(Reply::Done)
            }
            Command::OwnedMonitors(id) => {
                self.suspended_thread(id)?;
                let mut owned: Vec<ObjectId> = self
                    .monitors
                    .values()
                    .filter(|m| m.owner == Some(id))
                    .map(|m| m.id)
                    .collect();
                owned.sort_unstable();
                Ok(Reply::Monitors(owned))
            }
            Command::Dispose => {
                self.requests.clear();
                for t in self.threads.values_mut() {
                    t.suspend_count = 0;
                }
                Ok(Reply::Done)
            }
        }
    }

    fn shutdown(&mut self) {
        self.dead = true;
        self.event_tx = None;
    }
}

struct Shared {
    state: Mutex<VmState>,
    changed: Notify,
    events: Mutex<Option<mpsc::UnboundedReceiver<EventSet>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, command: Command) -> CoordResult<Reply> {
        let reply = {
            let mut state = self.lock();
            if state.dead {
                return Err(CoordError::Disconnected);
            }
            state.handle(command)
        };
        self.changed.notify_waiters();
        reply
    }

    /// Retry `attempt` after every state change; None once the VM is dead
    async fn wait_until<R>(&self, mut attempt: impl FnMut(&mut VmState) -> Option<R>) -> Option<R> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.dead {
                    return None;
                }
                state.run_replays();
                if let Some(result) = attempt(&mut state) {
                    return Some(result);
                }
            }
            notified.await;
        }
    }

    fn shutdown(&self) {
        self.lock().shutdown();
        self.changed.notify_waiters();
    }
}

pub type SimRendezvous = Rendezvous<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

/// In-process controlled VM; clones share the same VM
#[derive(Clone)]
pub struct SimVm {
    shared: Arc<Shared>,
}

pub struct SimLaunch {
    pub vm: SimVm,
    pub process: SimProcess,
    pub rendezvous: SimRendezvous,
}

impl SimVm {
    /// Start the program on a background task
    pub fn launch(program: Program) -> SimLaunch {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = VmState::new(&program, event_tx);
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            changed: Notify::new(),
            events: Mutex::new(Some(event_rx)),
        });

        let (controller_end, vm_end) = tokio::io::duplex(4096);
        let (controller_r, controller_w) = split(controller_end);

        let task = tokio::spawn(run_program(shared.clone(), program, vm_end));
        info!("Simulated VM launched");

        SimLaunch {
            vm: SimVm { shared: shared.clone() },
            process: SimProcess {
                shared,
                task: Some(task),
                exit_code: None,
            },
            rendezvous: Rendezvous::new(BufReader::new(controller_r), controller_w),
        }
    }

    pub fn thread_id(&self, name: &str) -> Option<ThreadId> {
        self.shared.lock().thread_ids.get(name).copied()
    }

    pub fn monitor_id(&self, name: &str) -> Option<ObjectId> {
        self.shared.lock().monitors.get(name).map(|m| m.id)
    }

    pub fn monitor_owner(&self, name: &str) -> Option<ThreadId> {
        self.shared.lock().monitors.get(name).and_then(|m| m.owner)
    }

    /// Current stack depth, whether or not the thread is suspended
    pub fn depth(&self, thread: ThreadId) -> usize {
        self.shared.lock().threads.get(&thread).map_or(0, |t| t.stack.len())
    }

    pub fn is_dead(&self) -> bool {
        self.shared.lock().dead
    }
}

impl Transport for SimVm {
    async fn send(&mut self, command: Command) -> CoordResult<Reply> {
        debug!("Simulated transport: {:?}", command);
        self.shared.send(command)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EventSet>> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

pub struct SimProcess {
    shared: Arc<Shared>,
    task: Option<JoinHandle<i32>>,
    exit_code: Option<i32>,
}

impl Debuggee for SimProcess {
    async fn wait_for_exit(&mut self) -> CoordResult<i32> {
        if let Some(task) = self.task.as_mut() {
            let code = match task.await {
                Ok(code) => code,
                Err(e) if e.is_cancelled() => -1,
                Err(e) => return Err(CoordError::Protocol(format!("simulated VM failed: {}", e))),
            };
            self.task = None;
            self.exit_code = Some(code);
        }
        Ok(self.exit_code.unwrap_or(-1))
    }

    async fn kill(&mut self) -> CoordResult<()> {
        if let Some(task) = &self.task {
            task.abort();
        }
        self.shared.shutdown();
        warn!("Simulated VM killed");
        Ok(())
    }
}

/// Scheduler: executes the steps in order, blocking on suspended threads
async fn run_program(shared: Arc<Shared>, program: Program, pipe: DuplexStream) -> i32 {
    let (reader, mut writer) = split(pipe);
    let mut reader = BufReader::new(reader);

    let main = shared.lock().thread_ids.get(MAIN_THREAD).copied().unwrap_or_default();

    if program.start_suspended {
        let mut state = shared.lock();
        if let Some(t) = state.threads.get_mut(&main) {
            t.suspend_count += 1;
        }
        let set = EventSet::new(SuspendPolicy::All, vec![Event::new(0, EventKind::VmStart { thread: main })]);
        if let Some(tx) = &state.event_tx {
            tx.send(set).ok();
        }
    }

    for step in &program.steps {
        match step {
            Step::Ready | Step::Status(_) => {
                if shared.wait_until(|state| state.runnable(main).then_some(())).await.is_none() {
                    return program.exit_code;
                }
                let line = match step {
                    Step::Status(text) => format!("{}\n", text),
                    _ => format!("{}\n", Token::Ready),
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!("Rendezvous write failed: {}", e);
                }
                if matches!(step, Step::Ready) && !await_token(&mut reader, &Token::Go).await {
                    break;
                }
            }
            Step::AwaitQuit => {
                await_token(&mut reader, &Token::Quit).await;
            }
            step => {
                let Some(id) = step.thread().and_then(|name| shared.lock().thread_ids.get(name).copied()) else {
                    continue;
                };
                if shared.wait_until(|state| state.try_step(id, step)).await.is_none() {
                    return program.exit_code;
                }
                // the step may have released a monitor or moved a thread
                shared.changed.notify_waiters();
            }
        }
    }

    {
        let mut state = shared.lock();
        if let Some(tx) = &state.event_tx {
            tx.send(EventSet::new(SuspendPolicy::None, vec![Event::new(0, EventKind::VmDeath)]))
                .ok();
        }
        state.shutdown();
    }
    shared.changed.notify_waiters();
    info!("Simulated VM exited with {}", program.exit_code);
    program.exit_code
}

/// Read rendezvous lines until `token`; false when the pipe closed first
async fn await_token(reader: &mut BufReader<ReadHalf<DuplexStream>>, token: &Token) -> bool {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return false,
            Ok(_) if &Token::parse(&line) == token => return true,
            Ok(_) => debug!("Simulated VM ignores {:?}", line.trim()),
        }
    }
}
