// Suspension bookkeeping
//
// Mirrors the controlled process's per-thread suspend counts so stack
// operations can be refused locally when their thread is running.

use crate::protocol::{error_codes, CoordError, CoordResult};
use crate::transport::{Command, Reply, Transport};
use crate::types::{SuspendPolicy, ThreadId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Mutable per-thread state; both counters are guarded by the same lock
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadState {
    pub suspend_count: u32,
    pub stack_generation: u64,
    pub detached: bool,
}

impl ThreadState {
    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    fn acquire(&mut self) {
        self.suspend_count += 1;
    }

    /// Drop one suspension; a thread that starts running invalidates its frames
    fn release(&mut self) {
        self.suspend_count -= 1;
        if self.suspend_count == 0 {
            self.stack_generation += 1;
        }
    }
}

/// Cloneable reference to one controlled-process thread
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    id: ThreadId,
    state: Arc<Mutex<ThreadState>>,
}

impl ThreadHandle {
    fn new(id: ThreadId, suspend_count: u32) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(ThreadState {
                suspend_count,
                ..ThreadState::default()
            })),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, ThreadState> {
        self.state.lock().await
    }

    pub async fn snapshot(&self) -> ThreadState {
        self.state.lock().await.clone()
    }

    pub async fn suspend_count(&self) -> u32 {
        self.state.lock().await.suspend_count
    }

    pub async fn stack_generation(&self) -> u64 {
        self.state.lock().await.stack_generation
    }
}

#[derive(Debug, Default)]
pub struct SuspensionController {
    threads: HashMap<ThreadId, ThreadHandle>,
    vm_suspends: u32,
}

impl SuspensionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the handle for a thread
    ///
    /// A thread first seen during a VM-wide suspension starts suspended once
    /// per outstanding VM suspension.
    pub fn thread(&mut self, id: ThreadId) -> ThreadHandle {
        let vm_suspends = self.vm_suspends;
        self.threads
            .entry(id)
            .or_insert_with(|| ThreadHandle::new(id, vm_suspends))
            .clone()
    }

    pub fn get(&self, id: ThreadId) -> Option<ThreadHandle> {
        self.threads.get(&id).cloned()
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadHandle> {
        self.threads.values()
    }

    /// Outstanding VM-wide suspensions (explicit or from SuspendAll event sets)
    pub fn vm_suspends(&self) -> u32 {
        self.vm_suspends
    }

    pub async fn is_suspended(&self, thread: &ThreadHandle) -> bool {
        thread.lock().await.is_suspended()
    }

    /// Guard for every stack-inspecting or stack-mutating operation
    pub fn require_suspended(id: ThreadId, state: &ThreadState) -> CoordResult<()> {
        if state.detached {
            return Err(CoordError::Disconnected);
        }
        if !state.is_suspended() {
            return Err(CoordError::ThreadNotSuspended(id));
        }
        Ok(())
    }

    pub async fn suspend<T: Transport>(
        &mut self,
        transport: &mut T,
        thread: &ThreadHandle,
    ) -> CoordResult<()> {
        let mut state = thread.lock().await;
        if state.detached {
            return Err(CoordError::Disconnected);
        }

        transport.send(Command::SuspendThread(thread.id)).await?.into_done()?;
        state.acquire();
        debug!("Suspended thread {:#x} (count {})", thread.id, state.suspend_count);
        Ok(())
    }

    pub async fn resume_one<T: Transport>(
        &mut self,
        transport: &mut T,
        thread: &ThreadHandle,
    ) -> CoordResult<()> {
        let mut state = thread.lock().await;
        if state.detached {
            return Err(CoordError::Disconnected);
        }
        if state.suspend_count == 0 {
            return Err(CoordError::UnbalancedResume(format!("thread {:#x} is running", thread.id)));
        }

        transport.send(Command::ResumeThread(thread.id)).await?.into_done()?;
        state.release();
        debug!("Resumed thread {:#x} (count {})", thread.id, state.suspend_count);
        Ok(())
    }

    pub async fn suspend_all<T: Transport>(&mut self, transport: &mut T) -> CoordResult<()> {
        transport.send(Command::SuspendAll).await?.into_done()?;
        self.acquire_all().await;
        info!("Suspended all threads (vm suspends {})", self.vm_suspends);
        Ok(())
    }

    pub async fn resume_all<T: Transport>(&mut self, transport: &mut T) -> CoordResult<()> {
        if self.vm_suspends == 0 {
            return Err(CoordError::UnbalancedResume(
                "no VM-wide suspension outstanding".to_string(),
            ));
        }

        transport.send(Command::ResumeAll).await?.into_done()?;
        self.vm_suspends -= 1;
        for thread in self.threads.values() {
            let mut state = thread.lock().await;
            if state.suspend_count > 0 {
                state.release();
            }
        }
        info!("Resumed all threads (vm suspends {})", self.vm_suspends);
        Ok(())
    }

    async fn acquire_all(&mut self) {
        self.vm_suspends += 1;
        for thread in self.threads.values() {
            thread.lock().await.acquire();
        }
    }

    /// Record the suspension the controlled process applied when it stopped
    pub async fn record_event_suspension(&mut self, policy: SuspendPolicy, threads: &[ThreadId]) {
        match policy {
            SuspendPolicy::None => {}
            SuspendPolicy::EventThread => {
                for &id in threads {
                    self.thread(id).lock().await.acquire();
                }
            }
            SuspendPolicy::All => {
                // register first so the firing threads get exactly one count
                for &id in threads {
                    self.thread(id);
                }
                self.acquire_all().await;
            }
        }
    }

    /// Release the suspension recorded for an event set
    ///
    /// Threads are drained from `threads` as they are resumed, so after an
    /// error it lists exactly the ones still held.
    pub async fn release_event_suspension<T: Transport>(
        &mut self,
        transport: &mut T,
        policy: SuspendPolicy,
        threads: &mut Vec<ThreadId>,
    ) -> CoordResult<()> {
        match policy {
            SuspendPolicy::None => {}
            SuspendPolicy::EventThread => {
                while let Some(&id) = threads.first() {
                    self.release_event_thread(transport, id).await?;
                    threads.remove(0);
                }
            }
            SuspendPolicy::All => self.resume_all(transport).await?,
        }
        threads.clear();
        Ok(())
    }

    /// Resume a thread stopped by its own event; it may have ended meanwhile
    async fn release_event_thread<T: Transport>(
        &mut self,
        transport: &mut T,
        id: ThreadId,
    ) -> CoordResult<()> {
        let result = match self.threads.get(&id).cloned() {
            Some(handle) => self.resume_one(transport, &handle).await,
            // handle dropped by thread_died, the stop is still outstanding
            None => transport.send(Command::ResumeThread(id)).await.and_then(Reply::into_done),
        };

        match result {
            Err(CoordError::JdwpErrorCode(error_codes::INVALID_THREAD, _)) => {
                debug!("Thread {:#x} ended before its stop was released", id);
                self.thread_died(id).await;
                Ok(())
            }
            other => other,
        }
    }

    /// Mark a dead thread; later operations on it fail with Disconnected
    pub async fn thread_died(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.remove(&id) {
            thread.lock().await.detached = true;
            debug!("Thread {:#x} died", id);
        }
    }

    /// The controlled process is gone: every handle becomes unusable
    pub async fn detach_all(&mut self) {
        for thread in self.threads.values() {
            thread.lock().await.detached = true;
        }
        info!("Detached {} thread handles", self.threads.len());
    }
}
