//! In-order command queues
//!
//! One queue per logical stream: a dedicated worker thread pops commands
//! FIFO, waits each command's wait list, executes it against the device,
//! and completes the command's event. The host enqueues and returns;
//! blocking reads are the only host-side suspension point.
//!
//! A command that fails completes its event with an error status *and*
//! latches the failure on the queue, so the pipeline surfaces it on the
//! next `finish()` even when nobody waits on the event.

use crate::device::Device;
use crate::error::{BackendError, Result, STATUS_EXEC_ERROR};
use crate::event::{wait_all, Event, EventStatus};
use crate::program::{BuildOptions, Kernel};
use crate::driver::Routine;
use crate::types::{ArgValue, BufferHandle, NdRange};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

enum Command {
    Launch {
        routine: Routine,
        args: Vec<ArgValue>,
        options: BuildOptions,
        range: NdRange,
        wait: Vec<Event>,
        event: Event,
    },
    Read {
        buffer: BufferHandle,
        offset: usize,
        len: usize,
        wait: Vec<Event>,
        event: Event,
        reply: Sender<Result<Vec<u8>>>,
    },
    Write {
        buffer: BufferHandle,
        offset: usize,
        data: Vec<u8>,
        wait: Vec<Event>,
        event: Event,
    },
    Marker {
        wait: Vec<Event>,
        event: Event,
    },
    Shutdown,
}

/// An in-order command queue over a device
pub struct CommandQueue {
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    latched: Arc<Mutex<Option<String>>>,
}

impl CommandQueue {
    /// Spawn a queue worker over the device
    pub fn new(device: Arc<dyn Device>) -> Self {
        let (tx, rx) = unbounded();
        let latched = Arc::new(Mutex::new(None));
        let worker = {
            let latched = Arc::clone(&latched);
            std::thread::spawn(move || worker_loop(device, rx, latched))
        };
        Self {
            commands: tx,
            worker: Mutex::new(Some(worker)),
            latched,
        }
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| BackendError::QueueClosed)
    }

    /// Enqueue a kernel launch; returns the launch event
    pub fn enqueue_kernel(&self, kernel: &Kernel, range: NdRange, wait: &[Event]) -> Result<Event> {
        let event = Event::queued();
        self.submit(Command::Launch {
            routine: kernel.routine().clone(),
            args: kernel.snapshot_args()?,
            options: kernel.options().clone(),
            range,
            wait: wait.to_vec(),
            event: event.clone(),
        })?;
        Ok(event)
    }

    /// Enqueue an asynchronous host → device copy
    pub fn enqueue_write(
        &self,
        buffer: BufferHandle,
        offset: usize,
        data: Vec<u8>,
        wait: &[Event],
    ) -> Result<Event> {
        let event = Event::queued();
        self.submit(Command::Write {
            buffer,
            offset,
            data,
            wait: wait.to_vec(),
            event: event.clone(),
        })?;
        Ok(event)
    }

    /// Blocking device → host read
    ///
    /// Waits in queue order behind the wait list; returns the bytes and
    /// the (already complete) read event for callback chaining.
    pub fn read_blocking(
        &self,
        buffer: BufferHandle,
        offset: usize,
        len: usize,
        wait: &[Event],
    ) -> Result<(Vec<u8>, Event)> {
        let event = Event::queued();
        let (reply_tx, reply_rx) = bounded(1);
        self.submit(Command::Read {
            buffer,
            offset,
            len,
            wait: wait.to_vec(),
            event: event.clone(),
            reply: reply_tx,
        })?;
        let data = reply_rx.recv().map_err(|_| BackendError::QueueClosed)??;
        Ok((data, event))
    }

    /// Enqueue a marker gated on a wait list
    pub fn marker(&self, wait: &[Event]) -> Result<Event> {
        let event = Event::queued();
        self.submit(Command::Marker {
            wait: wait.to_vec(),
            event: event.clone(),
        })?;
        Ok(event)
    }

    /// Drain the queue and surface any latched error
    pub fn finish(&self) -> Result<()> {
        self.marker(&[])?.wait()?;
        match self.latched.lock().take() {
            Some(message) => Err(BackendError::ExecutionError(message)),
            None => Ok(()),
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(device: Arc<dyn Device>, commands: Receiver<Command>, latched: Arc<Mutex<Option<String>>>) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Launch {
                routine,
                args,
                options,
                range,
                wait,
                event,
            } => {
                if !gate(&wait, &event, &latched) {
                    continue;
                }
                event.transition(EventStatus::Running);
                match device.launch(&routine, &args, &options, range) {
                    Ok(()) => event.complete(),
                    Err(err) => {
                        tracing::error!(kernel = %routine.name, error = %err, "kernel launch failed");
                        *latched.lock() = Some(err.to_string());
                        event.fail(STATUS_EXEC_ERROR);
                    }
                }
            }
            Command::Read {
                buffer,
                offset,
                len,
                wait,
                event,
                reply,
            } => {
                if !gate(&wait, &event, &latched) {
                    let _ = reply.send(Err(BackendError::EventError(STATUS_EXEC_ERROR)));
                    continue;
                }
                event.transition(EventStatus::Running);
                let mut data = vec![0u8; len];
                match device.read_buffer(buffer, offset, &mut data) {
                    Ok(()) => {
                        event.complete();
                        let _ = reply.send(Ok(data));
                    }
                    Err(err) => {
                        let message = err.to_string();
                        tracing::error!(%buffer, error = %message, "buffer read failed");
                        *latched.lock() = Some(message);
                        event.fail(STATUS_EXEC_ERROR);
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::Write {
                buffer,
                offset,
                data,
                wait,
                event,
            } => {
                if !gate(&wait, &event, &latched) {
                    continue;
                }
                event.transition(EventStatus::Running);
                match device.write_buffer(buffer, offset, &data) {
                    Ok(()) => event.complete(),
                    Err(err) => {
                        tracing::error!(%buffer, error = %err, "buffer write failed");
                        *latched.lock() = Some(err.to_string());
                        event.fail(STATUS_EXEC_ERROR);
                    }
                }
            }
            Command::Marker { wait, event } => {
                if gate(&wait, &event, &latched) {
                    event.complete();
                }
            }
            Command::Shutdown => break,
        }
    }
}

/// Wait for a command's dependencies; on failure, fail the command's
/// event with the dependency's status and latch the error.
fn gate(wait: &[Event], event: &Event, latched: &Mutex<Option<String>>) -> bool {
    event.transition(EventStatus::Submitted);
    match wait_all(wait) {
        Ok(()) => true,
        Err(err) => {
            let code = match err {
                BackendError::EventError(code) => code,
                _ => STATUS_EXEC_ERROR,
            };
            let mut slot = latched.lock();
            if slot.is_none() {
                *slot = Some(err.to_string());
            }
            event.fail(code);
            false
        }
    }
}
