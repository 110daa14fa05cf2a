//! Background decode worker.
//!
//! One thread, one queue, one active provider at a time. Per tick:
//! 1. If the local queue is empty, pull one provider from the cache's channel
//! 2. Advance the front provider by one step; pop it once complete
//! 3. Announce progress/completion on the event bus
//! 4. With nothing to advance, report idle
//!
//! Idle handling is the only difference between the two scheduling modes:
//! `Poll` sleeps a fixed interval, `Wait` blocks until a new provider (or
//! shutdown) arrives. Decode order and cache semantics are identical.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use log::{error, trace};

use super::event_bus::EventEmitter;
use super::events::{FrameProgressEvent, FrameReadyEvent, RedrawRequestedEvent};
use crate::entities::{ProviderState, SharedProvider};

/// How the worker thread spends idle time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleMode {
    /// Sleep this long, then look again
    Poll(Duration),
    /// Block until woken by new work
    Wait,
}

/// Outcome of one worker tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Busy,
    Idle,
}

/// Worker-side queue of providers being decoded
pub struct LoadQueue {
    queue: VecDeque<SharedProvider>,
    source: Receiver<SharedProvider>,
    events: Option<EventEmitter>,
}

impl LoadQueue {
    pub fn new(source: Receiver<SharedProvider>, events: Option<EventEmitter>) -> Self {
        Self {
            queue: VecDeque::new(),
            source,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// One bounded unit of background progress
    pub fn tick(&mut self) -> Tick {
        if self.queue.is_empty() {
            if let Ok(provider) = self.source.try_recv() {
                self.queue.push_back(provider);
            }
        }

        let Some(front) = self.queue.front().cloned() else {
            return Tick::Idle;
        };

        // Already finished elsewhere (an edit provider drove it as a child):
        // announce it now, consumers of the child itself are still waiting
        if front.is_complete() {
            self.queue.pop_front();
            self.finished(&front, &front.state());
            return Tick::Busy;
        }

        let before = percent(front.progress());
        let state = front.advance();
        match state {
            ProviderState::Done(_) | ProviderState::Failed(_) => {
                self.queue.pop_front();
                self.finished(&front, &state);
            }
            ProviderState::InProgress(p) if percent(p) != before => {
                if let Some(events) = &self.events {
                    events.emit(FrameProgressEvent {
                        key: front.key().clone(),
                        progress: p,
                    });
                }
            }
            _ => {}
        }
        Tick::Busy
    }

    fn finished(&self, provider: &SharedProvider, state: &ProviderState) {
        let ok = matches!(state, ProviderState::Done(_));
        trace!("Finished {} (ok={})", provider.key(), ok);
        if let Some(events) = &self.events {
            events.emit(FrameReadyEvent {
                key: provider.key().clone(),
                ok,
            });
            events.emit(RedrawRequestedEvent);
        }
    }

    /// Block until new work or shutdown; false means stop
    fn wait_for_work(&mut self, shutdown: &Receiver<()>) -> bool {
        select! {
            recv(self.source) -> msg => match msg {
                Ok(provider) => {
                    self.queue.push_back(provider);
                    true
                }
                Err(_) => false,
            },
            recv(shutdown) -> _ => false,
        }
    }
}

fn percent(p: f32) -> u32 {
    (p * 100.0) as u32
}

/// Owner of the worker thread.
///
/// Dropping it signals shutdown and waits briefly for the thread to exit.
pub struct Workers {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl Workers {
    /// Spawn the worker thread draining `queue`
    pub fn spawn(mut queue: LoadQueue, mode: IdleMode) -> std::io::Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("seqload-worker".into())
            .spawn(move || {
                trace!("Worker started ({:?})", mode);
                loop {
                    match shutdown_rx.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => break,
                    }
                    // Event callbacks run here too; one bad tick must not end the thread
                    match panic::catch_unwind(AssertUnwindSafe(|| queue.tick())) {
                        Ok(Tick::Busy) => continue,
                        Ok(Tick::Idle) => {}
                        Err(_) => {
                            error!("Worker tick panicked, continuing");
                            continue;
                        }
                    }
                    match mode {
                        IdleMode::Poll(interval) => thread::sleep(interval),
                        IdleMode::Wait => {
                            if !queue.wait_for_work(&shutdown_rx) {
                                break;
                            }
                        }
                    }
                }
                trace!("Worker stopped");
            })?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    /// Signal the thread and wait up to 500ms for it to finish.
    ///
    /// A decode blocked in I/O keeps the thread alive past the deadline;
    /// it is then left to die with the process.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.shutdown.try_send(());

        let deadline = Instant::now() + Duration::from_millis(500);
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                trace!("Shutdown timeout reached, detaching worker");
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.shutdown();
    }
}
