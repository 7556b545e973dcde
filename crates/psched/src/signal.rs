//! Unix interval timer: `setitimer(ITIMER_REAL)` delivering `SIGALRM`.
//!
//! The signal handler only writes one byte to a non-blocking pipe. A pump
//! thread turns bytes into [`Expiration`]s, so no controller logic ever runs
//! in signal context. Bytes written while the pipe is full are dropped, which
//! coalesces bursts the way the kernel already coalesces pending `SIGALRM`s.
#![expect(unsafe_code, reason = "setitimer, sigaction and pipe FFI")]

use crate::error::TimerError;
use crate::MICROS_PER_SECOND;
use crate::timer::{Expiration, TimerResult, TimerSource};
use crossbeam::channel::{self, Receiver, Sender};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::{self, JoinHandle};

/// Set while some `SignalTimer` has its handler installed.
static TIMER_OWNED: AtomicBool = AtomicBool::new(false);

/// Write end of the notification pipe, or -1.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_alarm(_signal: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let token: u8 = 1;
    // SAFETY: write(2) is async-signal-safe, `token` outlives the call and the
    // descriptor is non-blocking.
    let _written = unsafe { libc::write(fd, (&raw const token).cast(), 1) };
}

struct Installed {
    previous: libc::sigaction,
    writer: OwnedFd,
    pump: Option<JoinHandle<()>>,
}

/// Process-wide interval timer delivering `SIGALRM`.
///
/// Only one `SignalTimer` may be installed at a time; a second `install`
/// fails with [`TimerError::Busy`] until the first is uninstalled or dropped.
#[derive(Default)]
pub struct SignalTimer {
    installed: Option<Installed>,
}

impl fmt::Debug for SignalTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalTimer")
            .field("installed", &self.installed.is_some())
            .finish()
    }
}

impl SignalTimer {
    /// Create an uninstalled timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether this instance currently owns the process timer.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    fn install_owned(&mut self) -> TimerResult<Receiver<Expiration>> {
        let (reader, writer) = notification_pipe()?;
        let (expiration_tx, expiration_rx) = channel::unbounded();

        let pump = thread::Builder::new()
            .name("psched-sigalrm".into())
            .spawn(move || pump_notifications(reader, &expiration_tx))
            .map_err(|source| TimerError::Os {
                call: "thread spawn",
                source,
            })?;

        NOTIFY_FD.store(writer.as_raw_fd(), Ordering::Release);
        let previous = match install_handler() {
            Ok(previous) => previous,
            Err(err) => {
                NOTIFY_FD.store(-1, Ordering::Release);
                return Err(err);
            }
        };

        self.installed = Some(Installed {
            previous,
            writer,
            pump: Some(pump),
        });
        Ok(expiration_rx)
    }
}

impl TimerSource for SignalTimer {
    fn install(&mut self) -> TimerResult<Receiver<Expiration>> {
        self.uninstall()?;

        TIMER_OWNED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_owned| TimerError::Busy)?;

        self.install_owned().inspect_err(|_err| {
            TIMER_OWNED.store(false, Ordering::Release);
        })
    }

    fn arm(&mut self, initial_delay_us: u64, period_us: u64) -> TimerResult {
        if self.installed.is_none() {
            return Err(TimerError::NotInstalled);
        }
        set_interval(initial_delay_us, period_us)
    }

    fn disarm(&mut self) -> TimerResult {
        // Never touch the process timer unless this instance owns it.
        if self.installed.is_none() {
            return Ok(());
        }
        set_interval(0, 0)
    }

    fn uninstall(&mut self) -> TimerResult {
        let Some(mut installed) = self.installed.take() else {
            return Ok(());
        };

        let restored = restore_handler(&installed.previous);
        NOTIFY_FD.store(-1, Ordering::Release);
        // Closing the write end ends the pump thread.
        drop(installed.writer);
        if let Some(pump) = installed.pump.take()
            && pump.thread().id() != thread::current().id()
            && pump.join().is_err()
        {
            tracing::warn!("SIGALRM pump thread panicked before shutdown");
        }
        TIMER_OWNED.store(false, Ordering::Release);
        restored
    }
}

impl Drop for SignalTimer {
    fn drop(&mut self) {
        if let Err(err) = self.disarm() {
            tracing::warn!(error = %err, "Failed to disarm interval timer on drop");
        }
        if let Err(err) = self.uninstall() {
            tracing::warn!(error = %err, "Failed to restore SIGALRM disposition on drop");
        }
    }
}

fn pump_notifications(mut reader: File, expirations: &Sender<Expiration>) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {
                if expirations.send(Expiration::now()).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::warn!(error = %err, "SIGALRM notification pipe failed");
                return;
            }
        }
    }
}

fn notification_pipe() -> TimerResult<(File, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(TimerError::last_os_error("pipe"));
    }
    let [read_fd, write_fd] = fds;

    // SAFETY: pipe(2) succeeded, so `read_fd` is open and owned by nobody else.
    let reader = unsafe { File::from_raw_fd(read_fd) };
    // SAFETY: pipe(2) succeeded, so `write_fd` is open and owned by nobody else.
    let writer = unsafe { OwnedFd::from_raw_fd(write_fd) };

    add_fd_flags(reader.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    add_fd_flags(writer.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    add_fd_flags(writer.as_raw_fd(), libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
    Ok((reader, writer))
}

fn add_fd_flags(fd: RawFd, get: libc::c_int, set: libc::c_int, flags: libc::c_int) -> TimerResult {
    // SAFETY: `fd` is an open descriptor owned by the caller.
    let current = unsafe { libc::fcntl(fd, get) };
    if current < 0 {
        return Err(TimerError::last_os_error("fcntl"));
    }
    // SAFETY: as above; only flag bits are changed.
    if unsafe { libc::fcntl(fd, set, current | flags) } < 0 {
        return Err(TimerError::last_os_error("fcntl"));
    }
    Ok(())
}

fn install_handler() -> TimerResult<libc::sigaction> {
    // SAFETY: `sigaction` is plain data for which all-zero bytes are valid.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    let handler: extern "C" fn(libc::c_int) = on_alarm;
    action.sa_sigaction = handler as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    // SAFETY: `sa_mask` is a valid, writable signal set.
    unsafe { libc::sigemptyset(&raw mut action.sa_mask) };

    // SAFETY: `sigaction` is plain data for which all-zero bytes are valid.
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers reference live `sigaction` values.
    let rc = unsafe { libc::sigaction(libc::SIGALRM, &raw const action, &raw mut previous) };
    if rc != 0 {
        return Err(TimerError::last_os_error("sigaction"));
    }
    Ok(previous)
}

fn restore_handler(previous: &libc::sigaction) -> TimerResult {
    // SAFETY: `previous` was filled in by a successful sigaction(2) call.
    let rc = unsafe { libc::sigaction(libc::SIGALRM, previous, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(TimerError::last_os_error("sigaction"));
    }
    Ok(())
}

fn set_interval(initial_delay_us: u64, period_us: u64) -> TimerResult {
    let timer = libc::itimerval {
        it_interval: micros_to_timeval(period_us)?,
        it_value: micros_to_timeval(initial_delay_us)?,
    };
    // SAFETY: `timer` is a valid itimerval and the old value is not requested.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &raw const timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(TimerError::last_os_error("setitimer"));
    }
    Ok(())
}

fn micros_to_timeval(micros: u64) -> TimerResult<libc::timeval> {
    let out_of_range = |_overflow: std::num::TryFromIntError| TimerError::Os {
        call: "setitimer",
        source: std::io::Error::from(ErrorKind::InvalidInput),
    };
    Ok(libc::timeval {
        tv_sec: libc::time_t::try_from(micros / MICROS_PER_SECOND).map_err(out_of_range)?,
        tv_usec: libc::suseconds_t::try_from(micros % MICROS_PER_SECOND).map_err(out_of_range)?,
    })
}
