use super::lock;
use crate::device::DeviceId;
use crate::error::{CollectiveError, Result};
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};

/// Work executed in order by a stream worker.
pub(crate) type Job = Box<dyn FnOnce() -> core::result::Result<(), String> + Send>;

/// An ordered queue of work executed by a dedicated host thread.
///
/// Errors are sticky: the first failing job is reported by every following
/// [synchronize](HostStream::synchronize).
#[derive(Clone)]
pub struct HostStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: u64,
    device: DeviceId,
    sender: mpsc::Sender<Job>,
    progress: Arc<Progress>,
}

#[derive(Default)]
struct Progress {
    state: Mutex<ProgressState>,
    cond: Condvar,
}

#[derive(Default)]
struct ProgressState {
    submitted: u64,
    done: u64,
    error: Option<String>,
}

impl HostStream {
    pub(crate) fn new(device: DeviceId) -> Result<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Job>();
        let progress = Arc::new(Progress::default());
        let worker = progress.clone();

        std::thread::Builder::new()
            .name(format!("host-stream-{}-{id}", device.index))
            .spawn(move || {
                // The worker exits once every handle to the stream is dropped.
                while let Ok(job) = receiver.recv() {
                    let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(job))
                        .unwrap_or_else(|payload| Err(panic_reason(payload)));
                    let mut state = lock(&worker.state);
                    if let Err(reason) = result {
                        log::error!("Stream {id} on {device} failed: {reason}");
                        state.error.get_or_insert(reason);
                    }
                    state.done += 1;
                    worker.cond.notify_all();
                }
            })
            .map_err(|err| {
                CollectiveError::library(format!("Can't spawn a stream worker: {err}"))
            })?;

        Ok(Self {
            inner: Arc::new(StreamInner {
                id,
                device,
                sender,
                progress,
            }),
        })
    }

    /// Unique identifier of the stream.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The device owning the stream.
    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    /// Whether every submitted job is done.
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.inner.progress.state);
        state.done == state.submitted
    }

    /// The first failure of a job executed on the stream, if any.
    pub fn error(&self) -> Option<String> {
        lock(&self.inner.progress.state).error.clone()
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let mut state = lock(&self.inner.progress.state);
        state.submitted += 1;

        if self.inner.sender.send(job).is_err() {
            state.submitted -= 1;
            return Err(CollectiveError::library(format!(
                "Stream {} is closed",
                self.inner.id
            )));
        }

        Ok(())
    }

    /// Block until every job submitted so far is done.
    pub fn synchronize(&self) -> Result<()> {
        let progress = &self.inner.progress;
        let mut state = lock(&progress.state);
        let target = state.submitted;

        while state.done < target {
            state = progress
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }

        match &state.error {
            Some(reason) => Err(CollectiveError::library(reason.clone())),
            None => Ok(()),
        }
    }
}

fn panic_reason(payload: Box<dyn core::any::Any + Send>) -> String {
    let message = match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => String::from(*message),
            Err(_) => String::from("unknown panic payload"),
        },
    };

    format!("A job panicked: {message}")
}

impl core::fmt::Debug for HostStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostStream")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .finish()
    }
}

std::thread_local! {
    static GROUP: RefCell<GroupState> = RefCell::new(GroupState::default());
}

#[derive(Default)]
struct GroupState {
    depth: usize,
    pending: Vec<Pending>,
}

struct Pending {
    stream: HostStream,
    job: Job,
    /// Eager jobs never block (sends), they run first when a group is launched.
    eager: bool,
}

/// Submit a job, deferring it until the group closes when a group bracket is open on this thread.
pub(crate) fn submit(stream: &HostStream, job: Job, eager: bool) -> Result<()> {
    let job = GROUP.with(|group| {
        let mut group = group.borrow_mut();
        if group.depth > 0 {
            group.pending.push(Pending {
                stream: stream.clone(),
                job,
                eager,
            });
            None
        } else {
            Some(job)
        }
    });

    match job {
        Some(job) => stream.enqueue(job),
        None => Ok(()),
    }
}

pub(crate) fn group_start() {
    GROUP.with(|group| group.borrow_mut().depth += 1);
}

pub(crate) fn group_end() -> Result<()> {
    let pending = GROUP.with(|group| {
        let mut group = group.borrow_mut();
        if group.depth == 0 {
            return Err(CollectiveError::library(
                "group_end called without a matching group_start",
            ));
        }
        group.depth -= 1;

        Ok(match group.depth {
            0 => core::mem::take(&mut group.pending),
            _ => Vec::new(),
        })
    })?;

    launch(pending)
}

/// Fuse the jobs of a closed group into one job per stream, so that every operation of the group
/// makes progress together.
fn launch(pending: Vec<Pending>) -> Result<()> {
    let mut fused: Vec<(HostStream, Vec<Job>, Vec<Job>)> = Vec::new();

    for Pending { stream, job, eager } in pending {
        let index = match fused.iter().position(|(s, ..)| s.id() == stream.id()) {
            Some(index) => index,
            None => {
                fused.push((stream, Vec::new(), Vec::new()));
                fused.len() - 1
            }
        };

        let (_, eager_jobs, jobs) = &mut fused[index];
        match eager {
            true => eager_jobs.push(job),
            false => jobs.push(job),
        }
    }

    for (stream, eager_jobs, jobs) in fused {
        stream.enqueue(Box::new(move || {
            let mut outcome = Ok(());
            // Keep going after a failure, peers may be waiting on the remaining jobs.
            for job in eager_jobs.into_iter().chain(jobs) {
                if let Err(reason) = job() {
                    if outcome.is_ok() {
                        outcome = Err(reason);
                    }
                }
            }
            outcome
        }))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_run_in_submission_order() {
        let stream = HostStream::new(DeviceId::gpu(0)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let order = order.clone();
            submit(
                &stream,
                Box::new(move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                }),
                false,
            )
            .unwrap();
        }
        stream.synchronize().unwrap();

        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn errors_are_sticky() {
        let stream = HostStream::new(DeviceId::gpu(0)).unwrap();

        submit(&stream, Box::new(|| Err("boom".into())), false).unwrap();
        submit(&stream, Box::new(|| Ok(())), false).unwrap();

        assert!(stream.synchronize().is_err());
        assert!(stream.synchronize().is_err());
        assert_eq!(stream.error().as_deref(), Some("boom"));
    }

    #[test]
    fn group_defers_and_runs_eager_jobs_first() {
        let stream = HostStream::new(DeviceId::gpu(0)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        group_start();
        for (name, eager) in [("recv", false), ("send", true)] {
            let order = order.clone();
            submit(
                &stream,
                Box::new(move || {
                    order.lock().unwrap().push(name);
                    Ok(())
                }),
                eager,
            )
            .unwrap();
        }
        assert!(stream.is_idle());
        group_end().unwrap();
        stream.synchronize().unwrap();

        assert_eq!(*order.lock().unwrap(), ["send", "recv"]);
    }

    #[test_log::test]
    fn panicking_job_becomes_a_sticky_error() {
        let stream = HostStream::new(DeviceId::gpu(0)).unwrap();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();

        submit(&stream, Box::new(|| panic!("division by zero")), false).unwrap();
        submit(
            &stream,
            Box::new(move || {
                *flag.lock().unwrap() = true;
                Ok(())
            }),
            false,
        )
        .unwrap();

        assert!(stream.synchronize().is_err());
        assert!(*ran.lock().unwrap());
        assert!(stream.error().unwrap().contains("division by zero"));
    }

    #[test]
    fn unbalanced_group_end_fails() {
        assert!(group_end().is_err());
    }
}
