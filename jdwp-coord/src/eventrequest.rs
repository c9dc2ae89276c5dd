// EventRequest definitions and command implementations
//
// Set up event requests (breakpoints, method entry, class prepare, ...)

use crate::commands::{command_sets, event_commands, event_kinds, modifier_kinds};
use crate::connection::JdwpConnection;
use crate::protocol::{CoordError, CoordResult};
use crate::reader::read_i32;
use crate::types::{Location, ReferenceTypeId, RequestId, SuspendPolicy, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Kind of trap a watch request arms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    ClassPrepare,
    Breakpoint,
    MethodEntry,
    ThreadStart,
    ThreadDeath,
}

impl RequestKind {
    /// JDWP event kind byte
    pub fn event_kind(self) -> u8 {
        match self {
            RequestKind::ClassPrepare => event_kinds::CLASS_PREPARE,
            RequestKind::Breakpoint => event_kinds::BREAKPOINT,
            RequestKind::MethodEntry => event_kinds::METHOD_ENTRY,
            RequestKind::ThreadStart => event_kinds::THREAD_START,
            RequestKind::ThreadDeath => event_kinds::THREAD_DEATH,
        }
    }

    pub fn from_event_kind(kind: u8) -> Option<Self> {
        match kind {
            event_kinds::CLASS_PREPARE => Some(RequestKind::ClassPrepare),
            event_kinds::BREAKPOINT => Some(RequestKind::Breakpoint),
            event_kinds::METHOD_ENTRY => Some(RequestKind::MethodEntry),
            event_kinds::THREAD_START => Some(RequestKind::ThreadStart),
            event_kinds::THREAD_DEATH => Some(RequestKind::ThreadDeath),
            _ => None,
        }
    }
}

/// Where a request traps
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum RequestTarget {
    /// Thread lifecycle requests
    Anywhere,
    /// Class-prepare requests: a class name or "prefix.*" / "*.suffix" pattern
    Classes { pattern: String },
    /// Breakpoint on a source line
    Line { class: String, line: u32 },
    /// Method entry, optionally narrowed to one overload by JNI signature
    Method {
        class: String,
        method: String,
        signature: Option<String>,
    },
}

impl RequestTarget {
    pub fn line(class: impl Into<String>, line: u32) -> Self {
        RequestTarget::Line {
            class: class.into(),
            line,
        }
    }

    pub fn method(class: impl Into<String>, method: impl Into<String>) -> Self {
        RequestTarget::Method {
            class: class.into(),
            method: method.into(),
            signature: None,
        }
    }

    pub fn classes(pattern: impl Into<String>) -> Self {
        RequestTarget::Classes {
            pattern: pattern.into(),
        }
    }

    /// Class the target is scoped to, if any
    pub fn class(&self) -> Option<&str> {
        match self {
            RequestTarget::Line { class, .. } | RequestTarget::Method { class, .. } => Some(class),
            _ => None,
        }
    }

    /// Whether this target shape is meaningful for the given kind
    pub fn fits(&self, kind: RequestKind) -> bool {
        matches!(
            (kind, self),
            (RequestKind::ClassPrepare, RequestTarget::Classes { .. })
                | (RequestKind::Breakpoint, RequestTarget::Line { .. })
                | (RequestKind::MethodEntry, RequestTarget::Method { .. })
                | (RequestKind::ThreadStart, RequestTarget::Anywhere)
                | (RequestKind::ThreadDeath, RequestTarget::Anywhere)
        )
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTarget::Anywhere => write!(f, "*"),
            RequestTarget::Classes { pattern } => write!(f, "{}", pattern),
            RequestTarget::Line { class, line } => write!(f, "{}:{}", class, line),
            RequestTarget::Method { class, method, .. } => write!(f, "{}.{}", class, method),
        }
    }
}

/// Everything the controlled process needs to arm one trap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub kind: RequestKind,
    pub target: RequestTarget,
    pub thread: Option<ThreadId>,
    pub class_filter: Option<String>,
    pub suspend_policy: SuspendPolicy,
}

// Event request modifiers
#[derive(Debug, Clone)]
pub enum EventModifier {
    ThreadOnly(ThreadId),
    ClassOnly(ReferenceTypeId),
    ClassMatch(String),
    LocationOnly(Location),
}

impl EventModifier {
    fn encode(&self, data: &mut Vec<u8>) {
        match self {
            EventModifier::ThreadOnly(thread) => {
                data.put_u8(modifier_kinds::THREAD_ONLY);
                data.put_u64(*thread);
            }
            EventModifier::ClassOnly(class_id) => {
                data.put_u8(modifier_kinds::CLASS_ONLY);
                data.put_u64(*class_id);
            }
            EventModifier::ClassMatch(pattern) => {
                data.put_u8(modifier_kinds::CLASS_MATCH);
                data.put_u32(pattern.len() as u32);
                data.extend_from_slice(pattern.as_bytes());
            }
            EventModifier::LocationOnly(location) => {
                data.put_u8(modifier_kinds::LOCATION_ONLY);
                data.put_u8(location.type_tag);
                data.put_u64(location.class_id);
                data.put_u64(location.method_id);
                data.put_u64(location.index);
            }
        }
    }
}

/// Encode an EventRequest.Set body
pub fn encode_set_request(
    event_kind: u8,
    suspend_policy: SuspendPolicy,
    modifiers: &[EventModifier],
) -> Vec<u8> {
    let mut data = Vec::new();
    data.put_u8(event_kind);
    data.put_u8(suspend_policy as u8);
    data.put_i32(modifiers.len() as i32);
    for modifier in modifiers {
        modifier.encode(&mut data);
    }
    data
}

impl JdwpConnection {
    /// Arm an event request (EventRequest.Set command)
    /// Returns the request ID the VM will stamp on matching events
    pub async fn set_event_request(
        &mut self,
        event_kind: u8,
        suspend_policy: SuspendPolicy,
        modifiers: &[EventModifier],
    ) -> CoordResult<RequestId> {
        let mut packet = self.packet(command_sets::EVENT_REQUEST, event_commands::SET);
        packet.data = encode_set_request(event_kind, suspend_policy, modifiers);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let request_id = read_i32(&mut data)?;
        debug!("Armed event kind={} as request {}", event_kind, request_id);

        Ok(request_id)
    }

    /// Clear an event request by ID (EventRequest.Clear command)
    pub async fn clear_event_request(&mut self, event_kind: u8, request_id: RequestId) -> CoordResult<()> {
        let mut packet = self.packet(command_sets::EVENT_REQUEST, event_commands::CLEAR);

        packet.data.put_u8(event_kind);
        packet.data.put_i32(request_id);

        let reply = self.send_command(packet).await?;
        reply.check_error().map_err(|e| match e {
            CoordError::JdwpErrorCode(code, _) => CoordError::from_error_code(code, 0),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_request_encoding() {
        let location = Location::new(0x10, 0x20, 7);
        let data = encode_set_request(
            event_kinds::BREAKPOINT,
            SuspendPolicy::EventThread,
            &[EventModifier::LocationOnly(location), EventModifier::ThreadOnly(0xab)],
        );

        assert_eq!(data[0], event_kinds::BREAKPOINT);
        assert_eq!(data[1], 1);
        assert_eq!(&data[2..6], &[0, 0, 0, 2]);
        assert_eq!(data[6], modifier_kinds::LOCATION_ONLY);
        // kind + policy + count + (tag + type_tag + 3 ids) + (tag + thread)
        assert_eq!(data.len(), 1 + 1 + 4 + (1 + 1 + 24) + (1 + 8));
        assert_eq!(data[data.len() - 9], modifier_kinds::THREAD_ONLY);
    }

    #[test]
    fn test_target_shapes() {
        assert!(RequestTarget::line("a.B", 3).fits(RequestKind::Breakpoint));
        assert!(!RequestTarget::line("a.B", 3).fits(RequestKind::MethodEntry));
        assert!(RequestTarget::classes("a.*").fits(RequestKind::ClassPrepare));
        assert!(RequestTarget::Anywhere.fits(RequestKind::ThreadDeath));
        assert_eq!(RequestTarget::method("a.B", "run").class(), Some("a.B"));
        assert_eq!(RequestTarget::line("a.B", 12).to_string(), "a.B:12");
    }

    #[test]
    fn test_kind_round_trip_through_event_byte() {
        for kind in [
            RequestKind::ClassPrepare,
            RequestKind::Breakpoint,
            RequestKind::MethodEntry,
        ] {
            assert_eq!(RequestKind::from_event_kind(kind.event_kind()), Some(kind));
        }
        assert_eq!(RequestKind::from_event_kind(event_kinds::VM_DEATH), None);
    }
}
