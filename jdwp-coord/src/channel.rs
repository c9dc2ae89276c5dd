// Event channel
//
// Ordered queue of event sets from the controlled process. Every set that
// is handed out must be resumed exactly once.

use crate::events::EventSet;
use crate::protocol::{CoordError, CoordResult};
use crate::suspension::SuspensionController;
use crate::transport::Transport;
use crate::types::{SuspendPolicy, ThreadId};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Suspension a delivered set still holds
#[derive(Debug, Clone)]
struct Held {
    policy: SuspendPolicy,
    threads: Vec<ThreadId>,
}

/// Consumer side of the event stream
///
/// The backlog is unbounded: a stop nobody reads yet stays queued and no
/// event is ever dropped or reordered.
#[derive(Debug)]
pub struct EventChannel {
    events: mpsc::UnboundedReceiver<EventSet>,
    next_seq: u64,
    pending: BTreeMap<u64, Held>,
    closed: bool,
}

impl EventChannel {
    pub fn new(events: mpsc::UnboundedReceiver<EventSet>) -> Self {
        Self {
            events,
            next_seq: 1,
            pending: BTreeMap::new(),
            closed: false,
        }
    }

    /// Take over a transport's event stream
    pub fn from_transport<T: Transport>(transport: &mut T) -> CoordResult<Self> {
        transport
            .take_events()
            .map(Self::new)
            .ok_or_else(|| CoordError::Protocol("Event stream already taken".to_string()))
    }

    /// Block until the next set arrives
    ///
    /// The suspension the set caused is recorded before it is returned.
    pub async fn next(
        &mut self,
        suspension: &mut SuspensionController,
        timeout: Duration,
    ) -> CoordResult<EventSet> {
        if self.closed {
            return Err(CoordError::Disconnected);
        }

        let mut set = match tokio::time::timeout(timeout, self.events.recv()).await {
            Err(_) => {
                warn!("No event within {:?}", timeout);
                return Err(CoordError::Timeout(timeout));
            }
            Ok(None) => {
                info!("Event stream closed");
                self.closed = true;
                return Err(CoordError::Disconnected);
            }
            Ok(Some(set)) => set,
        };

        set.seq = self.next_seq;
        self.next_seq += 1;

        let threads = set.threads();
        suspension.record_event_suspension(set.suspend_policy, &threads).await;
        self.pending.insert(
            set.seq,
            Held {
                policy: set.suspend_policy,
                threads,
            },
        );

        debug!(
            "Delivered event set {} ({} events, {:?})",
            set.seq,
            set.events.len(),
            set.suspend_policy
        );
        Ok(set)
    }

    /// Release the suspension scope of a delivered set
    pub async fn resume<T: Transport>(
        &mut self,
        transport: &mut T,
        suspension: &mut SuspensionController,
        set: &EventSet,
    ) -> CoordResult<()> {
        let mut held = self.pending.remove(&set.seq).ok_or(CoordError::DoubleResume(set.seq))?;

        if let Err(e) = suspension
            .release_event_suspension(transport, held.policy, &mut held.threads)
            .await
        {
            warn!("Resume of event set {} failed: {}", set.seq, e);
            // only the threads still stopped stay pending
            if !e.is_fatal() {
                self.pending.insert(set.seq, held);
            }
            return Err(e);
        }

        debug!("Resumed event set {}", set.seq);
        Ok(())
    }

    /// Sequence numbers of sets delivered but not yet resumed
    pub fn pending(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
