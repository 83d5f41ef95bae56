// JDWP event parsing
//
// The bridge only acts on VM and thread lifecycle events (death
// detection); everything else is decoded as far as its kind and ignored.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::jdwp::commands::event_kinds;
use crate::jdwp::protocol::JdwpResult;
use crate::jdwp::types::ThreadId;
use crate::wire::{read_i32, read_u64, read_u8};

/// Composite event packet (can contain multiple events).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<Event>,
}

impl EventSet {
    pub fn signals_vm_death(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e.details, EventKind::VmDeath))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: i32,
    pub details: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VmStart { thread: ThreadId },
    VmDeath,
    ThreadStart { thread: ThreadId },
    ThreadDeath { thread: ThreadId },
    Other { kind: u8 },
}

/// Parse the data portion of a composite event command packet.
pub fn parse_event_packet(data: &[u8]) -> JdwpResult<EventSet> {
    let mut buf = data;

    let suspend_policy = read_u8(&mut buf)?;
    let event_count = read_i32(&mut buf)?;

    let mut events = Vec::with_capacity(event_count.max(0) as usize);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        let details = match kind {
            event_kinds::VM_START => EventKind::VmStart {
                thread: read_u64(&mut buf)?,
            },
            event_kinds::VM_DEATH => EventKind::VmDeath,
            event_kinds::THREAD_START => EventKind::ThreadStart {
                thread: read_u64(&mut buf)?,
            },
            event_kinds::THREAD_DEATH => EventKind::ThreadDeath {
                thread: read_u64(&mut buf)?,
            },
            other => {
                // Unknown payload layout: the rest of the packet cannot be
                // decoded reliably, so stop here.
                trace!(kind = other, "ignoring unhandled event kind");
                events.push(Event {
                    kind,
                    request_id,
                    details: EventKind::Other { kind: other },
                });
                break;
            }
        };

        events.push(Event {
            kind,
            request_id,
            details,
        });
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn vm_death_event_parses() {
        let mut data = Vec::new();
        data.put_u8(2); // suspend policy: all
        data.put_i32(1);
        data.put_u8(event_kinds::VM_DEATH);
        data.put_i32(0);

        let set = parse_event_packet(&data).unwrap();
        assert_eq!(set.suspend_policy, 2);
        assert!(set.signals_vm_death());
    }

    #[test]
    fn thread_death_carries_thread_id() {
        let mut data = Vec::new();
        data.put_u8(0);
        data.put_i32(1);
        data.put_u8(event_kinds::THREAD_DEATH);
        data.put_i32(3);
        data.put_u64(0xABCD);

        let set = parse_event_packet(&data).unwrap();
        assert!(!set.signals_vm_death());
        match &set.events[0].details {
            EventKind::ThreadDeath { thread } => assert_eq!(*thread, 0xABCD),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_stops_decoding_without_error() {
        let mut data = Vec::new();
        data.put_u8(0);
        data.put_i32(2);
        data.put_u8(40); // method entry, not handled
        data.put_i32(9);
        data.put_u64(1);

        let set = parse_event_packet(&data).unwrap();
        assert_eq!(set.events.len(), 1);
        assert!(matches!(set.events[0].details, EventKind::Other { kind: 40 }));
    }
}
