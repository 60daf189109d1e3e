//! Batched awaiting of fence completion.
//!
//! Many waiters are multiplexed onto one background thread issuing a single
//! batched `vkWaitForFences` call per cycle, instead of parking one OS
//! thread per fence.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ash::vk;
use crossbeam_channel::{Receiver, Sender};
use futures::channel::oneshot;
use log::debug;

use crate::error::{Error, Result};

/// Sleep between cycles when no waiters are queued.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Timeout of one batched wait call.
const WAIT_TIMEOUT_NS: u64 = 5_000_000;

/// Fatal-state slot values: 0 while healthy, a raw negative `VkResult` after
/// a driver error, or this terminator once disposal starts.
const STATE_TERMINATED: i32 = i32::MAX;

/// The slice of the device the scheduler needs. Implemented for
/// [`ash::Device`]; tests substitute an in-memory fake.
pub trait FenceDevice: Send + Sync + 'static {
    /// `Ok(true)` when signalled, `Ok(false)` when not ready.
    fn fence_status(&self, fence: vk::Fence) -> std::result::Result<bool, vk::Result>;

    /// Batched wait. `Err(vk::Result::TIMEOUT)` when the timeout elapsed
    /// with no fence signalled.
    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> std::result::Result<(), vk::Result>;
}

impl FenceDevice for ash::Device {
    fn fence_status(&self, fence: vk::Fence) -> std::result::Result<bool, vk::Result> {
        unsafe { self.get_fence_status(fence) }
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> std::result::Result<(), vk::Result> {
        unsafe { ash::Device::wait_for_fences(self, fences, wait_all, timeout_ns) }
    }
}

struct Waiter {
    fence: vk::Fence,
    done: oneshot::Sender<Result<()>>,
}

/// Completion of one fence wait. Resolves to `Ok(())` once the fence
/// signals, or to an error if the fence or the scheduler failed.
pub struct FenceFuture(FutureState);

enum FutureState {
    Ready(Option<Result<()>>),
    Pending(oneshot::Receiver<Result<()>>),
}

impl FenceFuture {
    fn ready(result: Result<()>) -> FenceFuture {
        FenceFuture(FutureState::Ready(Some(result)))
    }

    fn pending(receiver: oneshot::Receiver<Result<()>>) -> FenceFuture {
        FenceFuture(FutureState::Pending(receiver))
    }
}

impl Future for FenceFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            FutureState::Ready(result) => {
                Poll::Ready(result.take().expect("fence future polled after completion"))
            }
            FutureState::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // the scheduler dropped the sender without completing us:
                // it was disposed while we were pending
                Poll::Ready(Err(oneshot::Canceled)) => {
                    Poll::Ready(Err(Error::InvalidOperation(vk::Result::ERROR_UNKNOWN)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Multiplexes fence waiters onto one background thread.
pub struct WaitScheduler<D: FenceDevice = ash::Device> {
    device: Arc<D>,
    state: Arc<AtomicI32>,
    queue: Sender<Waiter>,
    thread: Option<JoinHandle<()>>,
}

impl<D: FenceDevice> WaitScheduler<D> {
    pub fn new(device: Arc<D>) -> WaitScheduler<D> {
        let (queue, incoming) = crossbeam_channel::unbounded();
        let state = Arc::new(AtomicI32::new(0));
        let thread = {
            let device = device.clone();
            let state = state.clone();
            thread::Builder::new()
                .name("vkmem-fence-wait".into())
                .spawn(move || scheduler_loop(device, incoming, state))
                .expect("failed to spawn fence wait thread")
        };
        WaitScheduler {
            device,
            state,
            queue,
            thread: Some(thread),
        }
    }

    /// Await `fence`. Already-signalled fences complete immediately without
    /// touching the scheduler thread.
    pub fn wait(&self, fence: vk::Fence) -> Result<FenceFuture> {
        match self.state.load(Ordering::Acquire) {
            0 => {}
            STATE_TERMINATED => {
                return Err(Error::InvalidOperation(vk::Result::ERROR_UNKNOWN));
            }
            raw => return Err(Error::InvalidOperation(vk::Result::from_raw(raw))),
        }
        match self.device.fence_status(fence) {
            Ok(true) => Ok(FenceFuture::ready(Ok(()))),
            Err(result) => Err(Error::Driver(result)),
            Ok(false) => {
                let (done, receiver) = oneshot::channel();
                self.queue
                    .send(Waiter { fence, done })
                    .map_err(|_| Error::InvalidOperation(vk::Result::ERROR_UNKNOWN))?;
                Ok(FenceFuture::pending(receiver))
            }
        }
    }
}

impl<D: FenceDevice> Drop for WaitScheduler<D> {
    fn drop(&mut self) {
        self.state.store(STATE_TERMINATED, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn scheduler_loop<D: FenceDevice>(
    device: Arc<D>,
    incoming: Receiver<Waiter>,
    state: Arc<AtomicI32>,
) {
    let mut fences: Vec<vk::Fence> = Vec::new();
    let mut completions: Vec<oneshot::Sender<Result<()>>> = Vec::new();
    debug!("fence wait thread started");

    loop {
        let current = state.load(Ordering::Acquire);
        if current == STATE_TERMINATED {
            // pending futures are dropped unresolved; callers are expected
            // to have drained before disposal
            debug!("fence wait thread exiting");
            return;
        }

        while let Ok(waiter) = incoming.try_recv() {
            if current != 0 {
                let _ = waiter
                    .done
                    .send(Err(Error::InvalidOperation(vk::Result::from_raw(current))));
            } else {
                fences.push(waiter.fence);
                completions.push(waiter.done);
            }
        }

        if current != 0 {
            // fatal: keep draining and rejecting until disposed
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        if fences.is_empty() {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        match device.wait_for_fences(&fences, false, WAIT_TIMEOUT_NS) {
            Err(vk::Result::TIMEOUT) => continue,
            Ok(()) => {
                // at least one fence signalled; settle every finished one
                let mut index = 0;
                while index < fences.len() {
                    match device.fence_status(fences[index]) {
                        Ok(false) => index += 1,
                        Ok(true) => {
                            fences.swap_remove(index);
                            let done = completions.swap_remove(index);
                            let _ = done.send(Ok(()));
                        }
                        Err(result) => {
                            fences.swap_remove(index);
                            let done = completions.swap_remove(index);
                            let _ = done.send(Err(Error::Driver(result)));
                        }
                    }
                }
            }
            Err(result) => {
                log::error!("batched fence wait failed with {result}, failing all waiters");
                state.store(result.as_raw(), Ordering::Release);
                fences.clear();
                for done in completions.drain(..) {
                    let _ = done.send(Err(Error::Driver(result)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeDevice {
        signalled: Mutex<HashSet<u64>>,
        wait_error: Mutex<Option<vk::Result>>,
    }

    impl FakeDevice {
        fn signal(&self, fence: vk::Fence) {
            self.signalled.lock().insert(fence.as_raw());
        }

        fn fail_next_wait(&self, result: vk::Result) {
            *self.wait_error.lock() = Some(result);
        }
    }

    impl FenceDevice for FakeDevice {
        fn fence_status(&self, fence: vk::Fence) -> std::result::Result<bool, vk::Result> {
            Ok(self.signalled.lock().contains(&fence.as_raw()))
        }

        fn wait_for_fences(
            &self,
            fences: &[vk::Fence],
            _wait_all: bool,
            _timeout_ns: u64,
        ) -> std::result::Result<(), vk::Result> {
            if let Some(result) = self.wait_error.lock().take() {
                return Err(result);
            }
            let signalled = self.signalled.lock();
            if fences.iter().any(|f| signalled.contains(&f.as_raw())) {
                Ok(())
            } else {
                drop(signalled);
                thread::sleep(Duration::from_millis(1));
                Err(vk::Result::TIMEOUT)
            }
        }
    }

    fn fence(raw: u64) -> vk::Fence {
        vk::Fence::from_raw(raw)
    }

    fn settle() {
        thread::sleep(Duration::from_millis(50));
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn signalled_fence_completes_immediately() {
        init_logging();
        let device = Arc::new(FakeDevice::default());
        device.signal(fence(1));
        let scheduler = WaitScheduler::new(device);
        let future = scheduler.wait(fence(1)).unwrap();
        assert!(matches!(future.now_or_never(), Some(Ok(()))));
    }

    #[test]
    fn only_the_signalled_waiter_completes() {
        init_logging();
        let device = Arc::new(FakeDevice::default());
        let scheduler = WaitScheduler::new(device.clone());

        let mut futures: Vec<FenceFuture> = (1..=10)
            .map(|raw| scheduler.wait(fence(raw)).unwrap())
            .collect();
        device.signal(fence(5));
        settle();

        for (position, future) in futures.iter_mut().enumerate() {
            let raw = position as u64 + 1;
            match future.now_or_never() {
                Some(Ok(())) => assert_eq!(raw, 5, "only fence 5 may complete"),
                None => assert_ne!(raw, 5, "fence 5 must have completed"),
                Some(Err(err)) => panic!("unexpected failure for fence {raw}: {err}"),
            }
        }

        // disposal joins the thread within bounded time
        let started = Instant::now();
        drop(scheduler);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn later_signals_complete_later_waiters() {
        init_logging();
        let device = Arc::new(FakeDevice::default());
        let scheduler = WaitScheduler::new(device.clone());
        let mut first = scheduler.wait(fence(1)).unwrap();
        let mut second = scheduler.wait(fence(2)).unwrap();

        device.signal(fence(2));
        settle();
        assert!((&mut first).now_or_never().is_none());
        assert!(matches!((&mut second).now_or_never(), Some(Ok(()))));

        device.signal(fence(1));
        settle();
        assert!(matches!((&mut first).now_or_never(), Some(Ok(()))));
    }

    #[test]
    fn driver_error_fails_all_pending_and_poisons_the_scheduler() {
        init_logging();
        let device = Arc::new(FakeDevice::default());
        let scheduler = WaitScheduler::new(device.clone());
        let mut pending: Vec<FenceFuture> = (1..=3)
            .map(|raw| scheduler.wait(fence(raw)).unwrap())
            .collect();

        device.fail_next_wait(vk::Result::ERROR_DEVICE_LOST);
        settle();

        for future in pending.iter_mut() {
            assert!(matches!(
                future.now_or_never(),
                Some(Err(Error::Driver(vk::Result::ERROR_DEVICE_LOST)))
            ));
        }
        // new waiters are rejected with the stored status
        assert!(matches!(
            scheduler.wait(fence(9)),
            Err(Error::InvalidOperation(vk::Result::ERROR_DEVICE_LOST))
        ));
    }
}
