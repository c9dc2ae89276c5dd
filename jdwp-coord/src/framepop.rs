// Frame handles and pop-frame coordination
//
// A FrameHandle is only meaningful for the stack generation it was taken
// from. Popping bumps the generation, which turns every older handle of the
// thread stale.

use crate::protocol::{error_codes, CoordError, CoordResult};
use crate::suspension::{SuspensionController, ThreadHandle, ThreadState};
use crate::transport::{Command, Transport};
use crate::types::{FrameId, FrameInfo, Location, ThreadId};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameHandle {
    thread: ThreadId,
    index: usize,
    generation: u64,
    frame_id: FrameId,
    location: Location,
}

impl FrameHandle {
    fn new(thread: ThreadId, index: usize, generation: u64, info: FrameInfo) -> Self {
        Self {
            thread,
            index,
            generation,
            frame_id: info.frame_id,
            location: info.location,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Depth at acquisition; 0 is the innermost frame
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Location captured with the handle, without revalidation
    pub fn captured_location(&self) -> Location {
        self.location
    }

    fn check_current(&self, thread: ThreadId, state: &ThreadState) -> CoordResult<()> {
        if self.thread != thread || self.generation != state.stack_generation {
            return Err(CoordError::StaleFrame {
                thread,
                held: self.generation,
                current: state.stack_generation,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FramePopCoordinator {
    pops: u64,
}

impl FramePopCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful pops so far
    pub fn pops(&self) -> u64 {
        self.pops
    }

    pub async fn frame_count<T: Transport>(&self, transport: &mut T, thread: &ThreadHandle) -> CoordResult<usize> {
        let state = thread.lock().await;
        SuspensionController::require_suspended(thread.id(), &state)?;
        transport
            .send(Command::FrameCount(thread.id()))
            .await
            .and_then(|r| r.into_count())
            .map_err(|e| stack_error(e, thread.id(), &state, 0, 0))
    }

    /// Every frame of a suspended thread, innermost first
    pub async fn frames<T: Transport>(
        &self,
        transport: &mut T,
        thread: &ThreadHandle,
    ) -> CoordResult<Vec<FrameHandle>> {
        let state = thread.lock().await;
        SuspensionController::require_suspended(thread.id(), &state)?;

        let frames = transport
            .send(Command::Frames {
                thread: thread.id(),
                start: 0,
                length: None,
            })
            .await
            .and_then(|r| r.into_frames())
            .map_err(|e| stack_error(e, thread.id(), &state, 0, 0))?;

        debug!(
            "Thread {:#x}: {} frames at generation {}",
            thread.id(),
            frames.len(),
            state.stack_generation
        );
        Ok(frames
            .into_iter()
            .enumerate()
            .map(|(index, info)| FrameHandle::new(thread.id(), index, state.stack_generation, info))
            .collect())
    }

    pub async fn frame<T: Transport>(
        &self,
        transport: &mut T,
        thread: &ThreadHandle,
        index: usize,
    ) -> CoordResult<FrameHandle> {
        let state = thread.lock().await;
        SuspensionController::require_suspended(thread.id(), &state)?;

        let count = transport
            .send(Command::FrameCount(thread.id()))
            .await
            .and_then(|r| r.into_count())
            .map_err(|e| stack_error(e, thread.id(), &state, index, 0))?;
        if index >= count {
            return Err(CoordError::FrameIndexOutOfRange {
                thread: thread.id(),
                index,
                count,
            });
        }

        let info = transport
            .send(Command::Frames {
                thread: thread.id(),
                start: index,
                length: Some(1),
            })
            .await
            .and_then(|r| r.into_frames())
            .map_err(|e| stack_error(e, thread.id(), &state, index, count))?
            .into_iter()
            .next()
            .ok_or(CoordError::FrameIndexOutOfRange {
                thread: thread.id(),
                index,
                count,
            })?;

        Ok(FrameHandle::new(thread.id(), index, state.stack_generation, info))
    }

    /// Revalidate a handle and return its location
    pub async fn location(&self, thread: &ThreadHandle, frame: &FrameHandle) -> CoordResult<Location> {
        let state = thread.lock().await;
        SuspensionController::require_suspended(thread.id(), &state)?;
        frame.check_current(thread.id(), &state)?;
        Ok(frame.location)
    }

    /// Pop `frame` and every frame above it
    ///
    /// On success the thread's caller is positioned just before the call
    /// instruction and the returned value is the thread's new stack
    /// generation. On failure neither the stack nor the generation changes.
    pub async fn pop_frame<T: Transport>(
        &mut self,
        transport: &mut T,
        thread: &ThreadHandle,
        frame: &FrameHandle,
    ) -> CoordResult<u64> {
        // Held across the round trip: nobody observes the stack half popped
        let mut state = thread.lock().await;
        SuspensionController::require_suspended(thread.id(), &state)?;
        frame.check_current(thread.id(), &state)?;

        let result = transport
            .send(Command::PopFrames {
                thread: thread.id(),
                frame_id: frame.frame_id,
            })
            .await
            .and_then(|r| r.into_done());
        if let Err(e) = result {
            let e = stack_error(e, thread.id(), &state, frame.index, frame.index);
            warn!("Pop of frame {} on thread {:#x} failed: {}", frame.index, thread.id(), e);
            return Err(e);
        }

        state.stack_generation += 1;
        self.pops += 1;
        info!(
            "Popped {} frame(s) on thread {:#x}, generation now {}",
            frame.index + 1,
            thread.id(),
            state.stack_generation
        );
        Ok(state.stack_generation)
    }
}

/// Translate stack-related JDWP error codes into the engine taxonomy
fn stack_error(error: CoordError, thread: ThreadId, state: &ThreadState, index: usize, count: usize) -> CoordError {
    match error {
        CoordError::JdwpErrorCode(error_codes::INVALID_FRAMEID, _) => CoordError::StaleFrame {
            thread,
            held: state.stack_generation,
            current: state.stack_generation,
        },
        CoordError::JdwpErrorCode(error_codes::NO_MORE_FRAMES | error_codes::INVALID_INDEX, _) => {
            CoordError::FrameIndexOutOfRange { thread, index, count }
        }
        CoordError::JdwpErrorCode(error_codes::THREAD_NOT_SUSPENDED, _) => CoordError::ThreadNotSuspended(thread),
        CoordError::JdwpErrorCode(error_codes::VM_DEAD, _) => CoordError::Disconnected,
        other => other,
    }
}
