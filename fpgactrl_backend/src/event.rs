//! Named events with counters, used as barriers between board workers.
//!
//! Every worker owns a mailbox `"{name}_evt"`. A peer posts an [`EventMessage`] to it; the owner
//! waits for a message of a given event name, sender and counter. Counters increase by one per
//! barrier, so a message left over from an earlier attempt is recognised by its lower counter
//! and discarded. [`EventBus::prune`] clears such leftovers, including messages nobody waited
//! for, at the start of each run.
//!
//! [`LocalEventBus`] serves workers running as threads of one process. [`SocketEventBus`]
//! serves workers in separate processes through one Unix-domain socket per mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::CoordinationError;
use crate::utils::wall_clock_ms;

pub const EVENT_START: &str = "start";
pub const EVENT_STARTED: &str = "started";
pub const EVENT_STOPPED: &str = "stopped";

pub fn mailbox(worker: &str) -> String {
    format!("{}_evt", worker)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub from: String,
    pub counter: u32,
    /// Sender's wall clock in ms at posting.
    pub time_ms: u64,
    pub ok: bool,
    /// Sender saw a non-fatal problem, e.g. a clock loss.
    pub warn: bool,
}

impl EventMessage {
    pub fn new(event: &str, from: &str, counter: u32, ok: bool) -> Self {
        Self {
            event: event.to_string(),
            from: from.to_string(),
            counter,
            time_ms: wall_clock_ms(),
            ok,
            warn: false,
        }
    }

    pub fn with_warning(mut self, warn: bool) -> Self {
        self.warn = warn;
        self
    }
}

pub trait EventBus: Send + Sync {
    /// Delivers `message` to the mailbox of worker `to`.
    fn post(&self, to: &str, message: &EventMessage) -> Result<(), CoordinationError>;

    /// Blocks until `event` with `counter` from `from` reaches the mailbox of `me`.
    ///
    /// A message reporting `ok == false` is returned as
    /// [`CoordinationError::PeerReportedFailure`].
    fn wait(
        &self,
        me: &str,
        from: &str,
        event: &str,
        counter: u32,
        timeout: Duration,
    ) -> Result<EventMessage, CoordinationError>;

    /// Like [`EventBus::wait`] without blocking: `None` if the message has not arrived yet.
    fn poll(
        &self,
        me: &str,
        from: &str,
        event: &str,
        counter: u32,
    ) -> Option<Result<EventMessage, CoordinationError>>;

    /// Drops every message to `me` with a counter below `counter`. Returns how many.
    fn prune(&self, me: &str, counter: u32) -> usize;
}

/// Removes the awaited message from `inbox`. Stale messages are dropped on the way.
fn take_message(
    inbox: &mut Vec<EventMessage>,
    from: &str,
    event: &str,
    counter: u32,
) -> Option<Result<EventMessage, CoordinationError>> {
    let mut found = None;
    inbox.retain(|msg| {
        if found.is_some() || msg.from != from || msg.event != event {
            return true;
        }
        if msg.counter < counter {
            log::warn!(
                "Dropping stale {} from {} (counter {} < {})",
                msg.event,
                msg.from,
                msg.counter,
                counter
            );
            return false;
        }
        found = Some(msg.clone());
        false
    });
    let msg = found?;
    Some(if msg.counter != counter {
        Err(CoordinationError::CounterMismatch {
            event: event.to_string(),
            expected: counter,
            actual: msg.counter,
        })
    } else if !msg.ok {
        Err(CoordinationError::PeerReportedFailure {
            peer: from.to_string(),
            event: event.to_string(),
        })
    } else {
        Ok(msg)
    })
}

#[derive(Default)]
struct Mailboxes {
    inboxes: Mutex<HashMap<String, Vec<EventMessage>>>,
    arrived: Condvar,
}

/// In-process bus. Clones share the mailboxes.
#[derive(Clone, Default)]
pub struct LocalEventBus {
    inner: Arc<Mailboxes>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts `message` in `mailbox` and wakes every waiter.
    pub fn deliver(&self, mailbox: &str, message: EventMessage) {
        let mut inboxes = self.inner.inboxes.lock();
        inboxes.entry(mailbox.to_string()).or_default().push(message);
        self.inner.arrived.notify_all();
    }

    /// Messages waiting in `mailbox`.
    pub fn pending(&self, mailbox: &str) -> usize {
        self.inner.inboxes.lock().get(mailbox).map_or(0, Vec::len)
    }
}

impl EventBus for LocalEventBus {
    fn post(&self, to: &str, message: &EventMessage) -> Result<(), CoordinationError> {
        log::debug!(
            "{} posts {}({}) to {}",
            message.from,
            message.event,
            message.counter,
            to
        );
        self.deliver(&mailbox(to), message.clone());
        Ok(())
    }

    fn wait(
        &self,
        me: &str,
        from: &str,
        event: &str,
        counter: u32,
        timeout: Duration,
    ) -> Result<EventMessage, CoordinationError> {
        let deadline = Instant::now() + timeout;
        let mailbox = mailbox(me);
        let mut inboxes = self.inner.inboxes.lock();
        loop {
            if let Some(inbox) = inboxes.get_mut(&mailbox) {
                if let Some(result) = take_message(inbox, from, event, counter) {
                    log::debug!("{} got {}({}) from {}", me, event, counter, from);
                    return result;
                }
            }
            if self.inner.arrived.wait_until(&mut inboxes, deadline).timed_out() {
                if let Some(inbox) = inboxes.get_mut(&mailbox) {
                    if let Some(result) = take_message(inbox, from, event, counter) {
                        return result;
                    }
                }
                log::error!("{} timed out waiting for {}({}) from {}", me, event, counter, from);
                return Err(CoordinationError::BarrierTimeout {
                    peer: from.to_string(),
                    event: event.to_string(),
                });
            }
        }
    }

    fn poll(
        &self,
        me: &str,
        from: &str,
        event: &str,
        counter: u32,
    ) -> Option<Result<EventMessage, CoordinationError>> {
        let mut inboxes = self.inner.inboxes.lock();
        let result = take_message(inboxes.get_mut(&mailbox(me))?, from, event, counter)?;
        log::debug!("{} got {}({}) from {}", me, event, counter, from);
        Some(result)
    }

    fn prune(&self, me: &str, counter: u32) -> usize {
        let mut inboxes = self.inner.inboxes.lock();
        let Some(inbox) = inboxes.get_mut(&mailbox(me)) else {
            return 0;
        };
        let before = inbox.len();
        inbox.retain(|msg| msg.counter >= counter);
        let dropped = before - inbox.len();
        if dropped > 0 {
            log::debug!("{}: dropped {} messages older than {}", me, dropped, counter);
        }
        dropped
    }
}

#[cfg(unix)]
pub use self::socket::SocketEventBus;

#[cfg(unix)]
mod socket {
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use super::*;
    use crate::settings::WorkerSettings;

    const ACCEPT_POLL: Duration = Duration::from_millis(5);
    const MAX_MESSAGE_BYTES: usize = 1 << 16;

    fn bus_err(what: &str, err: impl std::fmt::Display) -> CoordinationError {
        CoordinationError::Bus(format!("{}: {}", what, err))
    }

    /// Cross-process bus: one listening socket `{dir}/{name}_evt.sock` per local worker,
    /// messages are u32 length-prefixed JSON.
    pub struct SocketEventBus {
        dir: PathBuf,
        post_timeout: Duration,
        read_timeout: Duration,
        inbox: LocalEventBus,
        bound: Mutex<Vec<PathBuf>>,
        stop: Arc<AtomicBool>,
    }

    impl SocketEventBus {
        /// `post_timeout` bounds both connecting to a peer and reading a message from one.
        pub fn new(dir: &Path, post_timeout: Duration) -> Self {
            Self {
                dir: dir.to_path_buf(),
                post_timeout,
                read_timeout: post_timeout,
                inbox: LocalEventBus::new(),
                bound: Mutex::new(Vec::new()),
                stop: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Sockets in `event_dir`; posts wait up to the barrier timeout, reads up to the
        /// operation timeout.
        pub fn from_settings(settings: &WorkerSettings) -> Self {
            Self::new(&settings.event_dir, settings.barrier_timeout())
                .with_read_timeout(settings.timeouts().operation)
        }

        /// A sender stalled for longer than `timeout` is dropped.
        pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
            self.read_timeout = timeout.max(Duration::from_millis(1));
            self
        }

        pub fn socket_path(&self, worker: &str) -> PathBuf {
            self.dir.join(format!("{}.sock", mailbox(worker)))
        }

        /// Starts receiving for `worker` on a background thread.
        pub fn bind(&self, worker: &str) -> Result<(), CoordinationError> {
            let path = self.socket_path(worker);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| bus_err("removing stale socket", e))?;
            }
            let listener = UnixListener::bind(&path).map_err(|e| bus_err("binding", e))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| bus_err("configuring listener", e))?;
            let inbox = self.inbox.clone();
            let stop = Arc::clone(&self.stop);
            let name = mailbox(worker);
            let read_timeout = self.read_timeout;
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || accept_loop(listener, &name, &inbox, &stop, read_timeout))
                .map_err(|e| bus_err("spawning listener", e))?;
            log::debug!("Listening for events on {}", path.display());
            self.bound.lock().push(path);
            Ok(())
        }
    }

    fn accept_loop(
        listener: UnixListener,
        mailbox: &str,
        inbox: &LocalEventBus,
        stop: &AtomicBool,
        read_timeout: Duration,
    ) {
        while !stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((mut stream, _)) => match read_message(&mut stream, read_timeout) {
                    Ok(message) => inbox.deliver(mailbox, message),
                    Err(e) => log::warn!("{}: dropping connection: {}", mailbox, e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    log::error!("{}: accept failed: {}", mailbox, e);
                    break;
                }
            }
        }
    }

    fn read_message(stream: &mut UnixStream, timeout: Duration) -> Result<EventMessage, CoordinationError> {
        stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(timeout)))
            .map_err(|e| bus_err("configuring stream", e))?;
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).map_err(|e| bus_err("reading length", e))?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_MESSAGE_BYTES {
            return Err(CoordinationError::Bus(format!("message of {} bytes", len)));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).map_err(|e| bus_err("reading message", e))?;
        serde_json::from_slice(&body).map_err(|e| bus_err("decoding message", e))
    }

    impl EventBus for SocketEventBus {
        fn post(&self, to: &str, message: &EventMessage) -> Result<(), CoordinationError> {
            let body = serde_json::to_vec(message).map_err(|e| bus_err("encoding message", e))?;
            let path = self.socket_path(to);
            let deadline = Instant::now() + self.post_timeout;
            // the peer may not be listening yet
            let mut stream = loop {
                match UnixStream::connect(&path) {
                    Ok(stream) => break stream,
                    Err(e) if Instant::now() >= deadline => {
                        return Err(bus_err(&format!("connecting to {}", path.display()), e))
                    }
                    Err(_) => thread::sleep(ACCEPT_POLL),
                }
            };
            stream
                .write_all(&(body.len() as u32).to_le_bytes())
                .and_then(|_| stream.write_all(&body))
                .map_err(|e| bus_err("sending message", e))?;
            log::debug!("{} posts {}({}) to {}", message.from, message.event, message.counter, to);
            Ok(())
        }

        fn wait(
            &self,
            me: &str,
            from: &str,
            event: &str,
            counter: u32,
            timeout: Duration,
        ) -> Result<EventMessage, CoordinationError> {
            self.inbox.wait(me, from, event, counter, timeout)
        }

        fn poll(
            &self,
            me: &str,
            from: &str,
            event: &str,
            counter: u32,
        ) -> Option<Result<EventMessage, CoordinationError>> {
            self.inbox.poll(me, from, event, counter)
        }

        fn prune(&self, me: &str, counter: u32) -> usize {
            self.inbox.prune(me, counter)
        }
    }

    impl Drop for SocketEventBus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            for path in self.bound.lock().drain(..) {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::debug!("Removing {}: {}", path.display(), e);
                }
            }
        }
    }
}
