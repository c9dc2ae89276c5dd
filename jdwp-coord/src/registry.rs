// Watch request registry
//
// Owns every trap the controller registered and maps incoming events back to
// the logical request that produced them.

use crate::eventrequest::{RequestKind, RequestSpec, RequestTarget};
use crate::events::{Event, EventKind};
use crate::protocol::{CoordError, CoordResult};
use crate::transport::{Command, Transport};
use crate::types::{class_matches, class_name, Location, RequestId, SuspendPolicy, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Registry-local request key
pub type RequestKey = u32;

/// Opaque correlation value attached by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tag {
    Int(i64),
    Text(String),
}

impl From<i64> for Tag {
    fn from(value: i64) -> Self {
        Tag::Int(value)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Tag::Text(value.to_string())
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Tag::Text(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Int(n) => write!(f, "{}", n),
            Tag::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    pub thread: Option<ThreadId>,
    pub class: Option<String>,
}

impl Filters {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn class(mut self, pattern: impl Into<String>) -> Self {
        self.class = Some(pattern.into());
        self
    }
}

/// Armed state recorded while a request is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    request_id: RequestId,
    location: Option<Location>,
}

#[derive(Debug, Clone)]
pub struct WatchRequest {
    key: RequestKey,
    kind: RequestKind,
    target: RequestTarget,
    filters: Filters,
    suspend_policy: SuspendPolicy,
    tag: Tag,
    armed: Option<Armed>,
}

impl WatchRequest {
    pub fn key(&self) -> RequestKey {
        self.key
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.suspend_policy
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn is_enabled(&self) -> bool {
        self.armed.is_some()
    }

    /// Request id the controlled process stamps on this request's events
    pub fn request_id(&self) -> Option<RequestId> {
        self.armed.map(|a| a.request_id)
    }

    /// Code location the target resolved to when armed
    pub fn location(&self) -> Option<Location> {
        self.armed.and_then(|a| a.location)
    }

    pub fn spec(&self) -> RequestSpec {
        RequestSpec {
            kind: self.kind,
            target: self.target.clone(),
            thread: self.filters.thread,
            class_filter: self.filters.class.clone(),
            suspend_policy: self.suspend_policy,
        }
    }

    /// Whether `event` is something this request would have trapped
    ///
    /// Class filters on location events are evaluated by the controlled
    /// process; only ClassPrepare carries a class name to check here.
    pub fn matches(&self, event: &Event) -> bool {
        if RequestKind::from_event_kind(event.kind()) != Some(self.kind) {
            return false;
        }
        if let Some(thread) = self.filters.thread {
            if event.thread() != Some(thread) {
                return false;
            }
        }

        match (&event.details, &self.target) {
            (EventKind::ClassPrepare { signature, .. }, RequestTarget::Classes { pattern }) => {
                let name = class_name(signature);
                class_matches(pattern, &name)
                    && self.filters.class.as_deref().map_or(true, |f| class_matches(f, &name))
            }
            (EventKind::Breakpoint { location, .. }, RequestTarget::Line { .. }) => {
                self.location().map_or(false, |armed| armed == *location)
            }
            (EventKind::MethodEntry { location, .. }, RequestTarget::Method { .. }) => {
                self.location().map_or(false, |armed| armed.same_method(location))
            }
            (
                EventKind::ThreadStart { .. } | EventKind::ThreadDeath { .. },
                RequestTarget::Anywhere,
            ) => true,
            _ => false,
        }
    }

    fn same_trap(&self, other: &WatchRequest) -> bool {
        self.kind == other.kind
            && self.target == other.target
            && self.filters.class == other.filters.class
    }
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    next_key: RequestKey,
    requests: BTreeMap<RequestKey, WatchRequest>,
    by_request_id: HashMap<RequestId, RequestKey>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a disabled request; nothing is armed yet
    pub fn create(
        &mut self,
        kind: RequestKind,
        target: RequestTarget,
        filters: Filters,
        suspend_policy: SuspendPolicy,
        tag: impl Into<Tag>,
    ) -> CoordResult<RequestKey> {
        if !target.fits(kind) {
            return Err(CoordError::InvalidRequest(format!(
                "{:?} cannot target {}",
                kind, target
            )));
        }

        self.next_key += 1;
        let key = self.next_key;
        let request = WatchRequest {
            key,
            kind,
            target,
            filters,
            suspend_policy,
            tag: tag.into(),
            armed: None,
        };
        debug!("Created request {} ({:?} at {})", key, request.kind, request.target);
        self.requests.insert(key, request);
        Ok(key)
    }

    pub fn get(&self, key: RequestKey) -> CoordResult<&WatchRequest> {
        self.requests.get(&key).ok_or(CoordError::UnknownRequest(key))
    }

    pub fn by_tag(&self, tag: &Tag) -> Option<&WatchRequest> {
        self.requests.values().find(|r| &r.tag == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchRequest> {
        self.requests.values()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Arm a request in the controlled process
    pub async fn enable<T: Transport>(
        &mut self,
        transport: &mut T,
        key: RequestKey,
    ) -> CoordResult<()> {
        let request = self.get(key)?;
        if request.is_enabled() {
            return Ok(());
        }

        if request.filters.thread.is_none() {
            let clash = self
                .requests
                .values()
                .find(|other| {
                    other.key != key
                        && other.is_enabled()
                        && other.filters.thread.is_none()
                        && other.same_trap(request)
                });
            if let Some(other) = clash {
                return Err(CoordError::AmbiguousRequest(format!(
                    "request {} already traps {:?} at {} for every thread",
                    other.key, request.kind, request.target
                )));
            }
        }

        let spec = request.spec();
        let (request_id, location) = transport.send(Command::SetRequest(spec)).await?.into_armed()?;

        if let Some(request) = self.requests.get_mut(&key) {
            request.armed = Some(Armed {
                request_id,
                location,
            });
            info!(
                "Enabled request {} ({:?} at {}) as id {}",
                key, request.kind, request.target, request_id
            );
        }
        self.by_request_id.insert(request_id, key);
        Ok(())
    }

    pub async fn disable<T: Transport>(
        &mut self,
        transport: &mut T,
        key: RequestKey,
    ) -> CoordResult<()> {
        let request = self.get(key)?;
        let Some(armed) = request.armed else {
            return Ok(());
        };

        transport
            .send(Command::ClearRequest {
                kind: request.kind,
                request_id: armed.request_id,
            })
            .await?
            .into_done()?;

        self.by_request_id.remove(&armed.request_id);
        if let Some(request) = self.requests.get_mut(&key) {
            request.armed = None;
        }
        info!("Disabled request {} (was id {})", key, armed.request_id);
        Ok(())
    }

    /// Disable and forget a request
    pub async fn remove<T: Transport>(
        &mut self,
        transport: &mut T,
        key: RequestKey,
    ) -> CoordResult<WatchRequest> {
        self.disable(transport, key).await?;
        self.requests.remove(&key).ok_or(CoordError::UnknownRequest(key))
    }

    /// Disable every enabled request; keeps going past failures and
    /// returns the first one
    pub async fn disable_all<T: Transport>(&mut self, transport: &mut T) -> CoordResult<()> {
        let enabled: Vec<RequestKey> = self
            .requests
            .values()
            .filter(|r| r.is_enabled())
            .map(|r| r.key)
            .collect();
        let mut first_error = None;
        for key in enabled {
            if let Err(e) = self.disable(transport, key).await {
                warn!("Failed to disable request {}: {}", key, e);
                if e.is_fatal() {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Map an event to the request that produced it
    pub fn resolve(&self, event: &Event) -> CoordResult<Option<&WatchRequest>> {
        if event.is_lifecycle() {
            return Ok(None);
        }

        if event.request_id != 0 {
            let resolved = self
                .by_request_id
                .get(&event.request_id)
                .and_then(|key| self.requests.get(key))
                .filter(|r| r.matches(event));
            if resolved.is_none() {
                debug!("Event for request id {} has no enabled request", event.request_id);
            }
            return Ok(resolved);
        }

        // No id on the event: match by kind, target and filters
        let candidates: Vec<&WatchRequest> = self
            .requests
            .values()
            .filter(|r| r.is_enabled() && r.matches(event))
            .collect();

        let filtered: Vec<&WatchRequest> = candidates
            .iter()
            .copied()
            .filter(|r| r.filters.thread.is_some())
            .collect();
        match filtered.len() {
            0 => {}
            1 => return Ok(Some(filtered[0])),
            n => {
                return Err(CoordError::AmbiguousRequest(format!(
                    "{} requests filtered on thread {:?} match one event",
                    n,
                    event.thread()
                )))
            }
        }

        let unfiltered: Vec<&WatchRequest> = candidates
            .iter()
            .copied()
            .filter(|r| r.filters.thread.is_none())
            .collect();
        match unfiltered.len() {
            0 => Ok(None),
            1 => Ok(Some(unfiltered[0])),
            n => Err(CoordError::AmbiguousRequest(format!(
                "{} requests without thread filter match one event",
                n
            ))),
        }
    }
}
