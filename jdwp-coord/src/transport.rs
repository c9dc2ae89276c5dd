// Transport collaborator
//
// The engine never speaks a wire format directly: every logical operation
// (arm a trap, suspend, pop frames, ...) is one Command sent over a Transport
// and answered by one Reply. JdwpConnection implements it over JDWP/TCP and
// sim::SimVm implements it in-process.

use crate::connection::JdwpConnection;
use crate::eventrequest::{EventModifier, RequestKind, RequestSpec, RequestTarget};
use crate::events::EventSet;
use crate::protocol::{CoordError, CoordResult};
use crate::thread::frame_range;
use crate::types::{class_signature, FrameId, FrameInfo, Location, ObjectId, RequestId, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Commands understood by a controlled process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetRequest(RequestSpec),
    ClearRequest {
        kind: RequestKind,
        request_id: RequestId,
    },
    SuspendThread(ThreadId),
    ResumeThread(ThreadId),
    SuspendAll,
    ResumeAll,
    AllThreads,
    ThreadName(ThreadId),
    FrameCount(ThreadId),
    Frames {
        thread: ThreadId,
        start: usize,
        length: Option<usize>,
    },
    PopFrames {
        thread: ThreadId,
        frame_id: FrameId,
    },
    OwnedMonitors(ThreadId),
    Dispose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    Armed {
        request_id: RequestId,
        location: Option<Location>,
    },
    Count(usize),
    Frames(Vec<FrameInfo>),
    Threads(Vec<ThreadId>),
    Monitors(Vec<ObjectId>),
    Name(String),
}

impl Reply {
    fn unexpected(self, wanted: &str) -> CoordError {
        CoordError::Protocol(format!("Expected {} reply, got {:?}", wanted, self))
    }

    pub fn into_done(self) -> CoordResult<()> {
        match self {
            Reply::Done => Ok(()),
            other => Err(other.unexpected("empty")),
        }
    }

    pub fn into_armed(self) -> CoordResult<(RequestId, Option<Location>)> {
        match self {
            Reply::Armed {
                request_id,
                location,
            } => Ok((request_id, location)),
            other => Err(other.unexpected("armed")),
        }
    }

    pub fn into_count(self) -> CoordResult<usize> {
        match self {
            Reply::Count(count) => Ok(count),
            other => Err(other.unexpected("count")),
        }
    }

    pub fn into_frames(self) -> CoordResult<Vec<FrameInfo>> {
        match self {
            Reply::Frames(frames) => Ok(frames),
            other => Err(other.unexpected("frames")),
        }
    }

    pub fn into_threads(self) -> CoordResult<Vec<ThreadId>> {
        match self {
            Reply::Threads(threads) => Ok(threads),
            other => Err(other.unexpected("threads")),
        }
    }

    pub fn into_monitors(self) -> CoordResult<Vec<ObjectId>> {
        match self {
            Reply::Monitors(monitors) => Ok(monitors),
            other => Err(other.unexpected("monitors")),
        }
    }

    pub fn into_name(self) -> CoordResult<String> {
        match self {
            Reply::Name(name) => Ok(name),
            other => Err(other.unexpected("name")),
        }
    }
}

/// Synchronous request/reply link to the controlled process plus its event stream
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// One round trip
    async fn send(&mut self, command: Command) -> CoordResult<Reply>;

    /// Hand over the ordered event stream; only the first call returns it
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EventSet>>;
}

impl Transport for JdwpConnection {
    async fn send(&mut self, command: Command) -> CoordResult<Reply> {
        debug!("JDWP transport: {:?}", command);
        match command {
            Command::SetRequest(spec) => {
                let (modifiers, location) = self.request_modifiers(&spec).await?;
                let request_id = self
                    .set_event_request(spec.kind.event_kind(), spec.suspend_policy, &modifiers)
                    .await?;
                Ok(Reply::Armed {
                    request_id,
                    location,
                })
            }
            Command::ClearRequest { kind, request_id } => {
                self.clear_event_request(kind.event_kind(), request_id).await?;
                Ok(Reply::Done)
            }
            Command::SuspendThread(thread) => {
                self.suspend_thread(thread).await?;
                Ok(Reply::Done)
            }
            Command::ResumeThread(thread) => {
                self.resume_thread(thread).await?;
                Ok(Reply::Done)
            }
            Command::SuspendAll => {
                self.suspend_all().await?;
                Ok(Reply::Done)
            }
            Command::ResumeAll => {
                self.resume_all().await?;
                Ok(Reply::Done)
            }
            Command::AllThreads => Ok(Reply::Threads(self.get_all_threads().await?)),
            Command::ThreadName(thread) => Ok(Reply::Name(self.get_thread_name(thread).await?)),
            Command::FrameCount(thread) => Ok(Reply::Count(self.get_frame_count(thread).await?)),
            Command::Frames {
                thread,
                start,
                length,
            } => {
                let (start, length) = frame_range(start, length)?;
                Ok(Reply::Frames(self.get_frames(thread, start, length).await?))
            }
            Command::PopFrames { thread, frame_id } => {
                self.pop_frames(thread, frame_id).await?;
                Ok(Reply::Done)
            }
            Command::OwnedMonitors(thread) => {
                Ok(Reply::Monitors(self.get_owned_monitors(thread).await?))
            }
            Command::Dispose => {
                self.dispose().await?;
                Ok(Reply::Done)
            }
        }
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EventSet>> {
        self.take_event_stream()
    }
}

impl JdwpConnection {
    /// Translate a request spec into JDWP modifiers, resolving class-scoped
    /// targets to a concrete code location
    async fn request_modifiers(
        &mut self,
        spec: &RequestSpec,
    ) -> CoordResult<(Vec<EventModifier>, Option<Location>)> {
        let mut modifiers = Vec::new();
        let mut resolved = None;

        match &spec.target {
            RequestTarget::Anywhere => {}
            RequestTarget::Classes { pattern } => {
                modifiers.push(EventModifier::ClassMatch(pattern.clone()));
            }
            RequestTarget::Line { class, line } => {
                let location = self.resolve_line(class, *line).await?;
                modifiers.push(EventModifier::LocationOnly(location));
                resolved = Some(location);
            }
            RequestTarget::Method {
                class,
                method,
                signature,
            } => {
                let location = self.resolve_method(class, method, signature.as_deref()).await?;
                // JDWP cannot filter method entry by method; the registry
                // discards entries into other methods of the class
                modifiers.push(EventModifier::ClassOnly(location.class_id));
                resolved = Some(location);
            }
        }

        if let Some(thread) = spec.thread {
            modifiers.push(EventModifier::ThreadOnly(thread));
        }
        if let Some(pattern) = &spec.class_filter {
            modifiers.push(EventModifier::ClassMatch(pattern.clone()));
        }

        Ok((modifiers, resolved))
    }

    async fn resolve_line(&mut self, class: &str, line: u32) -> CoordResult<Location> {
        let info = self.loaded_class(class).await?;
        for method in self.get_methods(info.type_id).await? {
            let table = match self.get_line_table(info.type_id, method.method_id).await {
                Ok(table) => table,
                Err(e) => {
                    // native and abstract methods have no line table
                    debug!("No line table for {}.{}: {}", class, method.name, e);
                    continue;
                }
            };
            if let Some(index) = table.code_index(line) {
                return Ok(Location {
                    type_tag: info.ref_type_tag,
                    class_id: info.type_id,
                    method_id: method.method_id,
                    index,
                });
            }
        }
        Err(CoordError::InvalidRequest(format!("No code at {}:{}", class, line)))
    }

    async fn resolve_method(
        &mut self,
        class: &str,
        method: &str,
        signature: Option<&str>,
    ) -> CoordResult<Location> {
        let info = self.loaded_class(class).await?;
        let methods = self.get_methods(info.type_id).await?;
        let found = methods
            .iter()
            .find(|m| m.name == method && signature.map_or(true, |sig| sig == m.signature))
            .ok_or_else(|| CoordError::InvalidRequest(format!("No method {}.{}", class, method)))?;

        Ok(Location {
            type_tag: info.ref_type_tag,
            class_id: info.type_id,
            method_id: found.method_id,
            index: 0,
        })
    }

    async fn loaded_class(&mut self, class: &str) -> CoordResult<crate::vm::ClassInfo> {
        let mut classes = self.classes_by_signature(&class_signature(class)).await?;
        if classes.len() > 1 {
            warn!("{} loaded by {} class loaders, using the first", class, classes.len());
        }
        if classes.is_empty() {
            return Err(CoordError::InvalidRequest(format!("Class {} is not loaded", class)));
        }
        Ok(classes.swap_remove(0))
    }
}
