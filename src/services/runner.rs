//! Dedicated tick thread.
//!
//! [`spawn`] moves a [`Station`] onto its own thread, named `twpc-tick`,
//! which is the only place the station is ever touched. Everything else
//! talks to it through a [`StationHandle`]:
//!
//! - jobs go in over an unbounded `mpsc` channel and are drained at the
//!   start of every tick, each answering on its own `oneshot`
//! - station events fan out on a `broadcast` channel
//! - an atomic flag stops the loop
//!
//! The blocking variants park the calling thread on the `oneshot` until the
//! tick thread answers. They must not be called from inside an async task.
//!
//! ```rust
//! use std::time::Duration;
//! use twpc_rail::commands::{HostCommand, HostReply};
//! use twpc_rail::config::Config;
//! use twpc_rail::hal::MockLines;
//! use twpc_rail::services::runner;
//! use twpc_rail::Station;
//!
//! let station = Station::new(&Config::default(), MockLines::new());
//! let handle = runner::spawn(station, Duration::ZERO).unwrap();
//!
//! let reply = handle.execute_blocking(HostCommand::LightOn).unwrap();
//! assert_eq!(reply, HostReply::On);
//!
//! let station = handle.stop().unwrap();
//! assert!(station.ticks() > 0);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::commands::{HostCommand, HostReply};
use crate::error::RunnerError;
use crate::messages::StationSnapshot;
use crate::station::{Station, StationEvent};
use crate::traits::LineInterface;

/// Events buffered per subscriber before it starts lagging.
pub const EVENT_CAPACITY: usize = 256;

type Job<L> = Box<dyn FnOnce(&mut Station<L>) + Send>;

/// Handle to a station running on its tick thread.
///
/// Dropping the handle stops the thread.
pub struct StationHandle<L> {
    jobs: mpsc::UnboundedSender<Job<L>>,
    events: broadcast::Sender<StationEvent>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Station<L>>>,
}

/// Start the tick thread. A zero `period` ticks as fast as possible.
pub fn spawn<L>(station: Station<L>, period: Duration) -> std::io::Result<StationHandle<L>>
where
    L: LineInterface + Send + 'static,
{
    let (jobs, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let running = Arc::new(AtomicBool::new(true));

    let thread = thread::Builder::new().name("twpc-tick".into()).spawn({
        let events = events.clone();
        let running = Arc::clone(&running);
        move || tick_loop(station, period, rx, events, running)
    })?;

    Ok(StationHandle {
        jobs,
        events,
        running,
        thread: Some(thread),
    })
}

fn tick_loop<L: LineInterface>(
    mut station: Station<L>,
    period: Duration,
    mut jobs: mpsc::UnboundedReceiver<Job<L>>,
    events: broadcast::Sender<StationEvent>,
    running: Arc<AtomicBool>,
) -> Station<L> {
    info!(period_us = period.as_micros() as u64, "tick thread started");
    while running.load(Ordering::Acquire) {
        while let Ok(job) = jobs.try_recv() {
            job(&mut station);
        }
        for event in station.tick() {
            // no subscribers is fine
            let _ = events.send(event);
        }
        if period.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(period);
        }
    }
    info!(ticks = station.ticks(), "tick thread stopped");
    station
}

impl<L: LineInterface + Send + 'static> StationHandle<L> {
    fn submit<R, F>(&self, f: F) -> Result<oneshot::Receiver<R>, RunnerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Station<L>) -> R + Send + 'static,
    {
        if !self.is_running() {
            return Err(RunnerError::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        let job: Job<L> = Box::new(move |station| {
            let _ = tx.send(f(station));
        });
        self.jobs.send(job).map_err(|_| RunnerError::Stopped)?;
        Ok(rx)
    }

    /// Run `f` on the tick thread between two ticks.
    pub async fn with<R, F>(&self, f: F) -> Result<R, RunnerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Station<L>) -> R + Send + 'static,
    {
        self.submit(f)?.await.map_err(|_| RunnerError::Stopped)
    }

    /// Blocking form of [`with`](Self::with).
    pub fn with_blocking<R, F>(&self, f: F) -> Result<R, RunnerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Station<L>) -> R + Send + 'static,
    {
        self.submit(f)?
            .blocking_recv()
            .map_err(|_| RunnerError::Stopped)
    }

    /// Carry out a host command.
    pub async fn execute(&self, command: HostCommand) -> Result<HostReply, RunnerError> {
        debug!(?command, "submitting host command");
        Ok(self.with(move |s| s.execute(command)).await??)
    }

    /// Blocking form of [`execute`](Self::execute).
    pub fn execute_blocking(&self, command: HostCommand) -> Result<HostReply, RunnerError> {
        Ok(self.with_blocking(move |s| s.execute(command))??)
    }

    /// Current station state.
    pub async fn snapshot(&self) -> Result<StationSnapshot, RunnerError> {
        self.with(|s| s.snapshot()).await
    }

    /// Blocking form of [`snapshot`](Self::snapshot).
    pub fn snapshot_blocking(&self) -> Result<StationSnapshot, RunnerError> {
        self.with_blocking(|s| s.snapshot())
    }

    /// Receive station events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    /// Whether the tick thread is still looping.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the tick thread and take the station back.
    pub fn stop(mut self) -> Result<Station<L>, RunnerError> {
        self.running.store(false, Ordering::Release);
        let thread = self.thread.take().ok_or(RunnerError::Stopped)?;
        thread.join().map_err(|_| RunnerError::Stopped)
    }
}

impl<L> Drop for StationHandle<L> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
