//! Real-time poll core.
//!
//! The capture thread has exactly one suspension point: [`RtPoll::run`].
//! It blocks on the driver's pollable descriptors, a relative timer, and
//! a self-pipe that message senders write to, and returns on the earliest
//! of the three. The message queue itself lives in crossbeam; the pipe
//! only carries the wakeup.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;

use pcmtap_foundation::error::CaptureError;

use crate::driver::PollDesc;

pub struct RtPoll {
    wake_r: File,
    wake_w: Arc<File>,
    timer: Option<Duration>,
}

/// Handle given to message senders; one write wakes the poll core.
#[derive(Clone)]
pub struct Waker {
    fd: Arc<File>,
}

impl Waker {
    pub fn wake(&self) {
        // A full pipe means a wakeup is already pending.
        let _ = (&*self.fd).write(&[1u8]);
    }
}

/// What one poll cycle observed.
pub struct PollRun {
    /// The relative timer fired before any descriptor did.
    pub timer_expired: bool,
    /// A message sender signalled the self-pipe.
    pub woken: bool,
    /// revents per driver descriptor, in `poll_descriptors` order.
    pub driver_revents: Vec<PollFlags>,
}

impl RtPoll {
    pub fn new() -> Result<Self, CaptureError> {
        let (r, w) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| CaptureError::Poll(format!("pipe2: {e}")))?;
        Ok(Self {
            wake_r: File::from(r),
            wake_w: Arc::new(File::from(w)),
            timer: None,
        })
    }

    pub fn waker(&self) -> Waker {
        Waker {
            fd: Arc::clone(&self.wake_w),
        }
    }

    pub fn set_timer_relative(&mut self, d: Duration) {
        self.timer = Some(d);
    }

    pub fn set_timer_disabled(&mut self) {
        self.timer = None;
    }

    /// Block until the timer expires, a driver descriptor becomes ready,
    /// or a message arrives.
    pub fn run(&mut self, driver_fds: &[PollDesc<'_>]) -> Result<PollRun, CaptureError> {
        let timeout = match self.timer {
            None => PollTimeout::NONE,
            Some(d) => {
                let ms = d.as_micros().div_ceil(1000);
                PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
            }
        };

        let mut fds = Vec::with_capacity(driver_fds.len() + 1);
        fds.push(PollFd::new(self.wake_r.as_fd(), PollFlags::POLLIN));
        for d in driver_fds {
            fds.push(PollFd::new(d.fd, d.events));
        }

        let n = loop {
            match poll(&mut fds, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(CaptureError::Poll(format!("poll: {e}"))),
            }
        };

        let woken = fds[0]
            .revents()
            .unwrap_or_else(PollFlags::empty)
            .contains(PollFlags::POLLIN);

        let driver_revents = fds[1..]
            .iter()
            .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
            .collect();

        drop(fds);

        if woken {
            self.drain_wake_pipe();
        }

        Ok(PollRun {
            timer_expired: n == 0,
            woken,
            driver_revents,
        })
    }

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = self.wake_r.read(&mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn timer_expiry_returns_without_fds() {
        let mut p = RtPoll::new().unwrap();
        p.set_timer_relative(Duration::from_millis(10));
        let start = Instant::now();
        let run = p.run(&[]).unwrap();
        assert!(run.timer_expired);
        assert!(!run.woken);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn waker_interrupts_a_blocking_run() {
        let mut p = RtPoll::new().unwrap();
        let waker = p.waker();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        let run = p.run(&[]).unwrap();
        assert!(run.woken);
        assert!(!run.timer_expired);
        t.join().unwrap();
    }

    #[test]
    fn driver_descriptor_event_is_reported() {
        let (r, w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut wf = File::from(w);
        wf.write_all(&[7]).unwrap();

        let mut p = RtPoll::new().unwrap();
        p.set_timer_relative(Duration::from_millis(100));
        let descs = [PollDesc {
            fd: r.as_fd(),
            events: PollFlags::POLLIN,
        }];
        let run = p.run(&descs).unwrap();
        assert!(!run.timer_expired);
        assert_eq!(run.driver_revents.len(), 1);
        assert!(run.driver_revents[0].contains(PollFlags::POLLIN));
    }

    #[test]
    fn repeated_wakes_coalesce() {
        let mut p = RtPoll::new().unwrap();
        let waker = p.waker();
        waker.wake();
        waker.wake();
        waker.wake();

        let run = p.run(&[]).unwrap();
        assert!(run.woken);

        // Pipe was drained: a timer-bounded second run times out.
        p.set_timer_relative(Duration::from_millis(5));
        let run = p.run(&[]).unwrap();
        assert!(run.timer_expired);
    }
}
