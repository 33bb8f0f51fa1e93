//! Background flusher for deferred persistence
//!
//! Mutations only signal the flusher thread; the thread rewrites the backing
//! file from the latest in-memory state. Requests are coalesced, so a burst of
//! mutations costs one write.

use crate::error::FlushError;
use crate::store::Shared;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Command sent to the flusher thread
enum FlushCommand {
    /// Write the backing file from current memory
    Flush,

    /// Final flush and exit
    Shutdown,
}

/// Handle to the background flusher thread
pub struct FlushHandle {
    /// Channel sender for sending commands to background thread
    sender: Sender<FlushCommand>,

    /// Set while a flush request is queued and not yet picked up
    pending: Arc<AtomicBool>,

    /// Background thread handle, yields the outcome of the final flush
    thread_handle: Option<JoinHandle<Result<(), FlushError>>>,
}

impl FlushHandle {
    /// Spawn the flusher thread for a store
    pub(crate) fn new(shared: Arc<Shared>) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<FlushCommand>();
        let pending = Arc::new(AtomicBool::new(false));

        let thread_pending = pending.clone();
        let thread_handle = thread::Builder::new()
            .name("tinystorage-flush".to_string())
            .spawn(move || Self::flusher_thread(shared, receiver, thread_pending))?;

        Ok(Self {
            sender,
            pending,
            thread_handle: Some(thread_handle),
        })
    }

    /// Ask for a flush (non-blocking)
    pub fn request_flush(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return; // Already queued, the queued flush will see this mutation
        }

        if let Err(e) = self.sender.send(FlushCommand::Flush) {
            self.pending.store(false, Ordering::Release);
            warn!("Failed to request flush: {}", e);
        }
    }

    /// Background flusher thread
    ///
    /// Failures of regular flushes go to the error handler. The final flush
    /// result is returned to whoever joins the thread.
    fn flusher_thread(
        shared: Arc<Shared>,
        receiver: Receiver<FlushCommand>,
        pending: Arc<AtomicBool>,
    ) -> Result<(), FlushError> {
        let delay = shared.config().flush_delay();
        debug!("Flusher thread started");

        loop {
            match receiver.recv() {
                Ok(FlushCommand::Flush) => {
                    if !delay.is_zero() {
                        match receiver.recv_timeout(delay) {
                            Ok(FlushCommand::Shutdown) => {
                                debug!("Shutdown during flush delay");
                                break;
                            }
                            Ok(FlushCommand::Flush) | Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }

                    pending.store(false, Ordering::Release);
                    Self::run_flush(&shared);
                }

                Ok(FlushCommand::Shutdown) => {
                    debug!("Shutdown signal received");
                    break;
                }

                Err(_) => {
                    info!("Channel disconnected, shutting down flusher");
                    break;
                }
            }
        }

        // Final flush before shutdown
        pending.store(false, Ordering::Release);
        let outcome = shared.flush_now();

        debug!("Flusher thread stopped");
        outcome
    }

    fn run_flush(shared: &Shared) {
        if let Err(e) = shared.flush_now() {
            shared.report_flush_error(&e);
        }
    }

    /// Internal shutdown implementation
    fn shutdown_internal(&mut self) -> std::thread::Result<Result<(), FlushError>> {
        // Send shutdown signal
        let _ = self.sender.send(FlushCommand::Shutdown);

        // Wait for thread to finish its final flush
        match self.thread_handle.take() {
            Some(handle) => handle.join(),
            None => Ok(Ok(())),
        }
    }

    /// Stop the flusher after a final flush (consumes self)
    ///
    /// The outer `Err` carries the panic payload of the flusher thread, the
    /// inner result is the outcome of the final flush.
    pub fn shutdown(mut self) -> std::thread::Result<Result<(), FlushError>> {
        self.shutdown_internal()
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            match self.shutdown_internal() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{}", e),
                Err(e) => error!("Failed to join flusher thread: {:?}", e),
            }
        }
    }
}
