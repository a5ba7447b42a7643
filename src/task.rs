//! Background tasks and exclusive hardware access
//!
//! Every long running operation runs on its own named thread and reports through a channel of
//! [`TaskEvent`]s. A task always ends with exactly one [`TaskEvent::Finished`], including when
//! its job returned an error or panicked. Operator input travels the other way through
//! [`TaskHandle::provide_input`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Error;
use crate::instrument::{Observer, PointMeasured};
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Started,
    Log(String),
    Progress { done: usize, total: usize },
    Point(PointMeasured),
    /// The task waits for [`TaskHandle::provide_input`]
    InputRequested(String),
    Finished { ok: bool, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<T> {
    pub name: String,
    pub ok: bool,
    pub message: String,
    pub data: Option<T>,
}

/// The side of a task its job sees
pub struct TaskContext {
    name: String,
    events: Sender<TaskEvent>,
    input: Mutex<Receiver<String>>,
    input_timeout: Duration,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, event: TaskEvent) {
        // the receiving side may be gone, the task keeps running regardless
        let _ = self.events.send(event);
    }

    /// Ask the operator for a line of input and wait for it
    ///
    /// # Errors
    /// Returns [`Error::InputTimeout`] if nothing arrives within `timeout`.
    pub fn request_input(&self, prompt: &str, timeout: Duration) -> Result<String> {
        log::info!("{}: waiting for input: {prompt}", self.name);
        self.send(TaskEvent::InputRequested(prompt.to_owned()));
        self.input
            .lock()
            .recv_timeout(timeout)
            .map_err(|_| Error::InputTimeout(timeout))
    }

    /// [`TaskContext::request_input`] with the timeout the task was spawned with
    ///
    /// # Errors
    /// Returns [`Error::InputTimeout`] if nothing arrives in time.
    pub fn ask(&self, prompt: &str) -> Result<String> {
        self.request_input(prompt, self.input_timeout)
    }
}

impl Observer for TaskContext {
    fn log(&self, line: &str) {
        self.send(TaskEvent::Log(line.to_owned()));
    }

    fn point(&self, point: &PointMeasured) {
        self.send(TaskEvent::Point(point.clone()));
    }

    fn progress(&self, done: usize, total: usize) {
        self.send(TaskEvent::Progress { done, total });
    }
}

pub struct TaskHandle<T> {
    name: String,
    events: Receiver<TaskEvent>,
    input: Sender<String>,
    thread: JoinHandle<TaskResult<T>>,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Events emitted so far, blocking iteration ends once the task has finished
    pub const fn events(&self) -> &Receiver<TaskEvent> {
        &self.events
    }

    /// Answer an input request, returns `false` if the task is gone
    pub fn provide_input(&self, line: impl Into<String>) -> bool {
        self.input.send(line.into()).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the task to end
    pub fn join(self) -> TaskResult<T> {
        self.thread.join().unwrap_or_else(|_| TaskResult {
            ok: false,
            message: Error::TaskPanicked(self.name.clone()).to_string(),
            name: self.name,
            data: None,
        })
    }
}

/// Operator input timeout of tasks started with [`spawn`]
pub const DEFAULT_INPUT_TIMEOUT: Duration = Duration::from_secs(300);

/// Run `job` on a new thread named `name`
///
/// # Errors
/// Returns an error if the thread cannot be spawned.
pub fn spawn<T, F>(name: impl Into<String>, job: F) -> Result<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
{
    spawn_with_timeout(name, DEFAULT_INPUT_TIMEOUT, job)
}

/// [`spawn`] with the timeout [`TaskContext::ask`] waits for operator input
///
/// # Errors
/// Returns an error if the thread cannot be spawned.
pub fn spawn_with_timeout<T, F>(
    name: impl Into<String>,
    input_timeout: Duration,
    job: F,
) -> Result<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
{
    let name = name.into();
    let (event_tx, event_rx) = mpsc::channel();
    let (input_tx, input_rx) = mpsc::channel();
    let context = TaskContext {
        name: name.clone(),
        events: event_tx,
        input: Mutex::new(input_rx),
        input_timeout,
    };

    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
        log::info!("{} started", context.name);
        context.send(TaskEvent::Started);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&context)))
            .unwrap_or_else(|_| Err(Error::TaskPanicked(context.name.clone())));
        let (ok, message, data) = match outcome {
            Ok(data) => (true, "done".to_owned(), Some(data)),
            Err(e) => {
                log::error!("{} failed: {e}", context.name);
                (false, e.to_string(), None)
            }
        };
        context.send(TaskEvent::Finished {
            ok,
            message: message.clone(),
        });
        TaskResult {
            name: context.name.clone(),
            ok,
            message,
            data,
        }
    })?;

    Ok(TaskHandle {
        name,
        events: event_rx,
        input: input_tx,
        thread,
    })
}

/// Connect-on-first-use access to one piece of hardware
///
/// The lock is held for the whole of [`HardwareSlot::with_connected`], so tasks sharing a slot
/// run their hardware sections one after the other. The lock is not reentrant: `f` must not
/// use the same slot again.
pub struct HardwareSlot<H> {
    device: Arc<Mutex<Option<H>>>,
    connect: Arc<dyn Fn() -> Result<H> + Send + Sync>,
}

impl<H> Clone for HardwareSlot<H> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            connect: Arc::clone(&self.connect),
        }
    }
}

impl<H> HardwareSlot<H> {
    pub fn new(connect: impl Fn() -> Result<H> + Send + Sync + 'static) -> Self {
        Self {
            device: Arc::new(Mutex::new(None)),
            connect: Arc::new(connect),
        }
    }

    /// A slot holding an already connected device, which cannot reconnect once dropped
    pub fn connected(device: H) -> Self {
        Self {
            device: Arc::new(Mutex::new(Some(device))),
            connect: Arc::new(|| -> Result<H> { Err(Error::NotConnected) }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.device.lock().is_some()
    }

    /// Drop the connection, the next use connects again
    pub fn disconnect(&self) {
        if self.device.lock().take().is_some() {
            log::info!("hardware disconnected");
        }
    }

    /// Run `f` with exclusive access to the device, connecting first if needed
    ///
    /// # Errors
    /// Returns the connection error or whatever `f` returns.
    pub fn with_connected<T>(&self, f: impl FnOnce(&mut H) -> Result<T>) -> Result<T> {
        let mut guard = self.device.lock();
        if guard.is_none() {
            *guard = Some((self.connect)()?);
            log::info!("hardware connected");
        }
        let device = guard.as_mut().ok_or(Error::NotConnected)?;
        f(device)
    }
}
