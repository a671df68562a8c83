//! Background sweep workers.
//!
//! Two threads, one per sweep. Each tick runs the sweep to completion on the
//! worker's own thread, so a sweep never overlaps with itself, and the failure
//! path (called from job runners) never waits on a sweep.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::ResilienceEngine;

#[derive(Debug, thiserror::Error)]
#[error("failed to spawn worker {name}: {source}")]
pub struct WorkerSpawnError {
    pub name: &'static str,
    #[source]
    pub source: std::io::Error,
}

/// Handle to control and join one periodic worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a thread that calls `tick` every `interval` until shut down.
    pub fn spawn_periodic<F>(name: &'static str, interval: Duration, mut tick: F) -> Result<Self, WorkerSpawnError>
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || periodic_loop(name, interval, shutdown_rx, &mut tick))
            .map_err(|source| WorkerSpawnError { name, source })?;

        Ok(Self {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A tick already in progress runs to completion first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn periodic_loop<F>(name: &'static str, interval: Duration, shutdown_rx: mpsc::Receiver<()>, tick: &mut F)
where
    F: FnMut(),
{
    info!(worker = name, interval_ms = interval.as_millis() as u64, "worker started");

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => tick(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = name, "worker stopped");
}

/// The engine's two sweep workers.
#[derive(Debug)]
pub struct ResilienceWorkers {
    breaker_sweep: WorkerHandle,
    dead_letter_sweep: WorkerHandle,
}

impl ResilienceWorkers {
    pub(crate) fn spawn(engine: Arc<ResilienceEngine>) -> Result<Self, WorkerSpawnError> {
        let cfg = engine.config().clone();

        let breaker_engine = Arc::clone(&engine);
        let breaker_sweep = WorkerHandle::spawn_periodic("breaker-sweep", cfg.breaker_sweep_interval, move || {
            let report = breaker_engine.sweep_circuit_breakers();
            if !report.recovered.is_empty() {
                debug!(recovered = ?report.recovered, still_open = report.still_open, "breaker sweep");
            }
        })?;

        let dead_letter_sweep = match WorkerHandle::spawn_periodic(
            "dead-letter-sweep",
            cfg.dead_letter_sweep_interval,
            move || {
                engine.sweep_dead_letters();
            },
        ) {
            Ok(handle) => handle,
            Err(err) => {
                breaker_sweep.shutdown();
                return Err(err);
            }
        };

        Ok(Self {
            breaker_sweep,
            dead_letter_sweep,
        })
    }

    /// Stop both sweeps, letting any in-flight sweep finish.
    pub fn shutdown(self) {
        self.dead_letter_sweep.shutdown();
        self.breaker_sweep.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn periodic_worker_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let handle = WorkerHandle::spawn_periodic("test-ticker", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        while ticks.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        let after = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn shutdown_waits_for_in_flight_tick() {
        let finished = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (f, s) = (Arc::clone(&finished), Arc::clone(&started));

        let handle = WorkerHandle::spawn_periodic("slow-ticker", Duration::from_millis(1), move || {
            s.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(40));
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        while started.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        handle.shutdown();

        assert_eq!(started.load(Ordering::SeqCst), finished.load(Ordering::SeqCst));
    }
}
