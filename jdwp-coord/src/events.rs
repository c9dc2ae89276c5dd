// Event model and JDWP composite-event decoding
//
// Events are sent by the controlled process to report stops (breakpoints,
// method entries, class preparation) and lifecycle changes.

use crate::commands::event_kinds;
use crate::protocol::{CoordError, CoordResult};
use crate::reader::{read_count, read_i32, read_string, read_u64, read_u8};
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Composite event packet: every event in it comes from one physical stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    /// Delivery sequence number, assigned by the event channel
    #[serde(default)]
    pub seq: u64,
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<Event>,
}

impl EventSet {
    pub fn new(suspend_policy: SuspendPolicy, events: Vec<Event>) -> Self {
        Self {
            seq: 0,
            suspend_policy,
            events,
        }
    }

    /// Distinct threads named by the events, in event order
    pub fn threads(&self) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        for thread in self.events.iter().filter_map(Event::thread) {
            if !threads.contains(&thread) {
                threads.push(thread);
            }
        }
        threads
    }

    pub fn is_vm_death(&self) -> bool {
        self.events.iter().any(|e| matches!(e.details, EventKind::VmDeath))
    }
}

/// Single event within an event set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Request that produced the event; 0 when none (VM lifecycle)
    pub request_id: RequestId,
    pub details: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VmStart {
        thread: ThreadId,
    },
    VmDeath,
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepare {
        thread: ThreadId,
        ref_type: ReferenceTypeId,
        signature: String,
        status: i32,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    MethodEntry {
        thread: ThreadId,
        location: Location,
    },
}

impl Event {
    pub fn new(request_id: RequestId, details: EventKind) -> Self {
        Self {
            request_id,
            details,
        }
    }

    /// Thread the event fired in, if it names one
    pub fn thread(&self) -> Option<ThreadId> {
        match &self.details {
            EventKind::VmStart { thread }
            | EventKind::ThreadStart { thread }
            | EventKind::ThreadDeath { thread }
            | EventKind::ClassPrepare { thread, .. }
            | EventKind::Breakpoint { thread, .. }
            | EventKind::MethodEntry { thread, .. } => Some(*thread),
            EventKind::VmDeath => None,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match &self.details {
            EventKind::Breakpoint { location, .. } | EventKind::MethodEntry { location, .. } => {
                Some(location)
            }
            _ => None,
        }
    }

    /// JDWP event kind byte
    pub fn kind(&self) -> u8 {
        match &self.details {
            EventKind::VmStart { .. } => event_kinds::VM_START,
            EventKind::VmDeath => event_kinds::VM_DEATH,
            EventKind::ThreadStart { .. } => event_kinds::THREAD_START,
            EventKind::ThreadDeath { .. } => event_kinds::THREAD_DEATH,
            EventKind::ClassPrepare { .. } => event_kinds::CLASS_PREPARE,
            EventKind::Breakpoint { .. } => event_kinds::BREAKPOINT,
            EventKind::MethodEntry { .. } => event_kinds::METHOD_ENTRY,
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self.details, EventKind::VmStart { .. } | EventKind::VmDeath)
    }
}

/// Parse an event packet from JDWP (data after the 11-byte header)
pub fn parse_event_packet(data: &[u8]) -> CoordResult<EventSet> {
    let mut buf = data;

    let suspend_policy = SuspendPolicy::from_u8(read_u8(&mut buf)?)?;
    let event_count = read_count(&mut buf)?;

    if event_count == 0 {
        return Err(CoordError::Protocol("Empty event set".to_string()));
    }

    let mut events = Vec::with_capacity(event_count);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        let details = match kind {
            event_kinds::BREAKPOINT => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::Breakpoint { thread, location }
            }
            event_kinds::METHOD_ENTRY => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::MethodEntry { thread, location }
            }
            event_kinds::CLASS_PREPARE => {
                let thread = read_u64(&mut buf)?;
                let _ref_type_tag = read_u8(&mut buf)?;
                let ref_type = read_u64(&mut buf)?;
                let signature = read_string(&mut buf)?;
                let status = read_i32(&mut buf)?;
                EventKind::ClassPrepare {
                    thread,
                    ref_type,
                    signature,
                    status,
                }
            }
            event_kinds::VM_START => {
                let thread = read_u64(&mut buf)?;
                EventKind::VmStart { thread }
            }
            event_kinds::VM_DEATH => EventKind::VmDeath,
            event_kinds::THREAD_START => {
                let thread = read_u64(&mut buf)?;
                EventKind::ThreadStart { thread }
            }
            event_kinds::THREAD_DEATH => {
                let thread = read_u64(&mut buf)?;
                EventKind::ThreadDeath { thread }
            }
            _ => {
                return Err(CoordError::Protocol(format!(
                    "Unsupported event kind: {}",
                    kind
                )));
            }
        };

        events.push(Event {
            request_id,
            details,
        });
    }

    Ok(EventSet::new(suspend_policy, events))
}

/// Read a location from the buffer
pub(crate) fn read_location(buf: &mut &[u8]) -> CoordResult<Location> {
    let type_tag = read_u8(buf)?;
    let class_id = read_u64(buf)?;
    let method_id = read_u64(buf)?;
    let index = read_u64(buf)?;

    Ok(Location {
        type_tag,
        class_id,
        method_id,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn put_location(buf: &mut Vec<u8>, loc: &Location) {
        buf.put_u8(loc.type_tag);
        buf.put_u64(loc.class_id);
        buf.put_u64(loc.method_id);
        buf.put_u64(loc.index);
    }

    #[test]
    fn test_parse_breakpoint_pair() {
        let loc = Location::new(0x10, 0x20, 4);
        let mut data = Vec::new();
        data.put_u8(1); // EventThread
        data.put_i32(2);
        for (request_id, thread) in [(5, 0xa), (6, 0xb)] {
            data.put_u8(event_kinds::BREAKPOINT);
            data.put_i32(request_id);
            data.put_u64(thread);
            put_location(&mut data, &loc);
        }

        let set = parse_event_packet(&data).unwrap();
        assert_eq!(set.suspend_policy, SuspendPolicy::EventThread);
        assert_eq!(set.events.len(), 2);
        assert_eq!(set.events[0].request_id, 5);
        assert_eq!(set.events[1].thread(), Some(0xb));
        assert_eq!(set.threads(), vec![0xa, 0xb]);
        assert_eq!(set.events[0].location(), Some(&loc));
    }

    #[test]
    fn test_parse_class_prepare() {
        let mut data = Vec::new();
        data.put_u8(2);
        data.put_i32(1);
        data.put_u8(event_kinds::CLASS_PREPARE);
        data.put_i32(9);
        data.put_u64(0x1);
        data.put_u8(1);
        data.put_u64(0x77);
        let sig = b"Lcom/example/Target;";
        data.put_u32(sig.len() as u32);
        data.put_slice(sig);
        data.put_i32(7);

        let set = parse_event_packet(&data).unwrap();
        match &set.events[0].details {
            EventKind::ClassPrepare {
                ref_type,
                signature,
                ..
            } => {
                assert_eq!(*ref_type, 0x77);
                assert_eq!(signature, "Lcom/example/Target;");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_vm_death_has_no_thread() {
        let mut data = Vec::new();
        data.put_u8(0);
        data.put_i32(1);
        data.put_u8(event_kinds::VM_DEATH);
        data.put_i32(0);

        let set = parse_event_packet(&data).unwrap();
        assert!(set.is_vm_death());
        assert!(set.threads().is_empty());
        assert!(set.events[0].is_lifecycle());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut data = Vec::new();
        data.put_u8(0);
        data.put_i32(1);
        data.put_u8(4); // exception events are never requested
        data.put_i32(1);
        assert!(parse_event_packet(&data).is_err());
    }
}
