//! Debug session lifecycle
//!
//! At most one session is live per process. [`SessionRegistry`] owns the
//! single optional session behind a non-reentrant lock:
//!
//! - NONE → ACTIVE: the first breakpoint opens a channel (blocking until a
//!   client attaches), binds the engine to it and optionally redirects stdio.
//! - ACTIVE → ACTIVE: later breakpoints reuse the session as is.
//! - ACTIVE → NONE: quit, EOF, an engine failure or a panic inside the
//!   engine tears the session down exactly once.

use crate::channel::DebugChannel;
use crate::config::params::process_env;
use crate::config::{Config, ServerParams, TraceOptions};
use crate::engine::{LineDebugger, Resume};
use crate::error::{RdbError, Result};
use crate::redirect::{ProcessStreams, StdioStreams, StreamName, StreamRedirector};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use tracing::{debug, info, warn};

/// A paused host bound to one attached operator
pub struct DebugSession<S: ProcessStreams> {
    channel: DebugChannel,
    engine: Box<dyn LineDebugger>,
    redirector: StreamRedirector<S>,
    patched: bool,
    active: bool,
}

impl<S: ProcessStreams> DebugSession<S> {
    /// Listen, wait for the client and attach to it
    pub fn open(params: &ServerParams, streams: S, engine: Box<dyn LineDebugger>) -> Result<Self> {
        let channel = DebugChannel::open(params)?;
        Self::attach(channel, streams, engine, params.patch_stdio)
    }

    /// Bind the engine to an accepted channel and redirect stdio if asked
    pub fn attach(
        channel: DebugChannel,
        streams: S,
        mut engine: Box<dyn LineDebugger>,
        patch_stdio: bool,
    ) -> Result<Self> {
        engine.bind(channel.reader()?, channel.writer()?);
        engine.set_prompt(&prompt_for(channel.local_addr().port()));

        let mut redirector = StreamRedirector::new(streams);
        if patch_stdio {
            let endpoint = redirector.streams_mut().channel_endpoint(channel.stream())?;
            redirector.apply(&StreamName::ALL, &endpoint)?;
        }

        Ok(Self {
            channel,
            engine,
            redirector,
            patched: patch_stdio,
            active: true,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn channel(&self) -> &DebugChannel {
        &self.channel
    }

    /// Hand control to the engine at `location` until it pauses
    pub fn trap(&mut self, location: &str) -> Result<Resume> {
        self.engine.set_location(location);
        let resume = self.engine.run_until_pause().map_err(RdbError::Engine)?;
        if resume == Resume::Continue {
            self.redirector.flush_all();
        }
        Ok(resume)
    }

    /// Flush stdio, restore redirected streams and close the channel. Idempotent.
    pub fn cleanup(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        self.redirector.flush_all();
        if self.patched {
            if let Err(e) = self.redirector.restore() {
                warn!("Failed to restore standard streams: {}", e);
            }
        }
        self.channel.close();
        info!("Debug session with {} ended", self.channel.peer_addr());
    }
}

impl<S: ProcessStreams> Drop for DebugSession<S> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn prompt_for(port: u16) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("RDB@{}:{} >>> ", host, port)
}

/// Holder of the process-wide session slot
pub struct SessionRegistry<S: ProcessStreams> {
    slot: Mutex<Option<DebugSession<S>>>,
}

impl<S: ProcessStreams> SessionRegistry<S> {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(None),
        }
    }

    /// Take the slot if nobody else holds it
    pub fn try_acquire(&self) -> Option<SessionLease<'_, S>> {
        self.slot.try_lock().map(|guard| SessionLease { guard })
    }

    /// Take the slot, waiting for another breakpoint to finish with it.
    ///
    /// The lock is not reentrant: acquiring twice on one thread deadlocks.
    pub fn acquire(&self) -> SessionLease<'_, S> {
        SessionLease {
            guard: self.slot.lock(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Enter a breakpoint: reuse the live session or create one with `open`
    pub fn enter<F>(&self, open: F) -> Result<Trap<'_, S>>
    where
        F: FnOnce() -> Result<DebugSession<S>>,
    {
        let mut lease = self.acquire();
        if lease.session().is_some() {
            debug!("Reusing live debug session");
        } else {
            let session = open()?;
            lease.install(session);
        }
        Ok(Trap {
            lease,
            running: false,
        })
    }
}

impl<S: ProcessStreams> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the session slot; released on drop
pub struct SessionLease<'a, S: ProcessStreams> {
    guard: MutexGuard<'a, Option<DebugSession<S>>>,
}

impl<'a, S: ProcessStreams> SessionLease<'a, S> {
    pub fn session(&mut self) -> Option<&mut DebugSession<S>> {
        self.guard.as_mut()
    }

    fn install(&mut self, session: DebugSession<S>) {
        *self.guard = Some(session);
    }

    /// Tear down and forget the live session. Returns false when there was none.
    pub fn cleanup(&mut self) -> bool {
        match self.guard.take() {
            Some(mut session) => {
                session.cleanup();
                true
            }
            None => false,
        }
    }

    pub fn release(self) {}
}

/// Handle for one breakpoint hit, holding the session slot until it finishes
pub struct Trap<'a, S: ProcessStreams> {
    lease: SessionLease<'a, S>,
    running: bool,
}

impl<'a, S: ProcessStreams> Trap<'a, S> {
    /// Run the engine at `location` and apply the resulting transition
    pub fn run(mut self, location: &str) -> Result<Resume> {
        let session = self.lease.session().ok_or_else(|| {
            RdbError::Io(io::Error::new(io::ErrorKind::NotConnected, "no live debug session"))
        })?;

        self.running = true;
        let outcome = session.trap(location);
        self.running = false;

        match outcome {
            Ok(Resume::Continue) => Ok(Resume::Continue),
            Ok(resume) => {
                self.lease.cleanup();
                Ok(resume)
            }
            Err(e) => {
                self.lease.cleanup();
                Err(e)
            }
        }
    }
}

impl<'a, S: ProcessStreams> Drop for Trap<'a, S> {
    fn drop(&mut self) {
        // Only reachable while unwinding out of the engine.
        if self.running {
            self.lease.cleanup();
        }
    }
}

static SESSION: SessionRegistry<StdioStreams> = SessionRegistry::new();

/// The process-wide registry used by [`set_trace`]
pub fn global_registry() -> &'static SessionRegistry<StdioStreams> {
    &SESSION
}

/// Pause here and hand control to a remote operator.
///
/// The first call listens on the resolved address and blocks until a client
/// connects; `engine` is only invoked then. While that session is live,
/// later calls reuse it.
#[track_caller]
pub fn set_trace<F>(options: &TraceOptions, engine: F) -> Result<Resume>
where
    F: FnOnce() -> Box<dyn LineDebugger>,
{
    let caller = std::panic::Location::caller();
    let location = format!("{}:{}", caller.file(), caller.line());

    let trap = global_registry().enter(|| {
        let config = Config::load_or_default();
        let params = ServerParams::resolve(options, &config.rdb, process_env)?;
        DebugSession::open(&params, StdioStreams::new(), engine())
    })?;
    trap.run(&location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redirect::tests::FakeStreams;
    use std::collections::VecDeque;
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    enum Step {
        Resume(Resume),
        Fail,
        Panic,
    }

    /// Engine that replays canned outcomes and records what the session did to it
    struct ScriptedEngine {
        id: usize,
        steps: Arc<Mutex<VecDeque<Step>>>,
        binds: Arc<AtomicUsize>,
        traps: Arc<Mutex<Vec<(usize, String)>>>,
        prompt: Arc<Mutex<String>>,
    }

    impl LineDebugger for ScriptedEngine {
        fn bind(&mut self, _input: Box<dyn io::BufRead + Send>, _output: Box<dyn io::Write + Send>) {
            self.binds.fetch_add(1, Ordering::SeqCst);
        }

        fn set_prompt(&mut self, prompt: &str) {
            *self.prompt.lock() = prompt.to_string();
        }

        fn set_location(&mut self, location: &str) {
            self.traps.lock().push((self.id, location.to_string()));
        }

        fn run_until_pause(&mut self) -> anyhow::Result<Resume> {
            match self.steps.lock().pop_front() {
                Some(Step::Resume(resume)) => Ok(resume),
                Some(Step::Fail) => anyhow::bail!("engine raised"),
                Some(Step::Panic) => panic!("engine panicked"),
                None => Ok(Resume::Eof),
            }
        }
    }

    #[derive(Clone, Default)]
    struct Harness {
        steps: Arc<Mutex<VecDeque<Step>>>,
        binds: Arc<AtomicUsize>,
        opened: Arc<AtomicUsize>,
        traps: Arc<Mutex<Vec<(usize, String)>>>,
        prompt: Arc<Mutex<String>>,
        streams: FakeStreams,
    }

    impl Harness {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Arc::new(Mutex::new(steps.into())),
                streams: FakeStreams::with_defaults(),
                ..Self::default()
            }
        }

        /// Open a real loopback channel; the returned thread yields whatever
        /// the client read before the server closed the connection.
        fn open(&self, patch_stdio: bool) -> Result<(DebugSession<FakeStreams>, JoinHandle<Vec<u8>>)> {
            let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            let params = ServerParams {
                host: "127.0.0.1".to_string(),
                port: 0,
                patch_stdio,
                accept_timeout: Some(Duration::from_secs(10)),
            };
            let pending = DebugChannel::listen(&params)?;
            let addr = pending.local_addr();
            let client = thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                let mut seen = Vec::new();
                let _ = stream.read_to_end(&mut seen);
                seen
            });
            let channel = pending.accept(params.accept_timeout)?;
            let engine = ScriptedEngine {
                id,
                steps: self.steps.clone(),
                binds: self.binds.clone(),
                traps: self.traps.clone(),
                prompt: self.prompt.clone(),
            };
            let session = DebugSession::attach(channel, self.streams.clone(), Box::new(engine), patch_stdio)?;
            Ok((session, client))
        }

        fn enter<'r>(
            &self,
            registry: &'r SessionRegistry<FakeStreams>,
            clients: &mut Vec<JoinHandle<Vec<u8>>>,
            patch_stdio: bool,
        ) -> Result<Trap<'r, FakeStreams>> {
            registry.enter(|| {
                let (session, client) = self.open(patch_stdio)?;
                clients.push(client);
                Ok(session)
            })
        }
    }

    #[test]
    fn test_reuse_does_not_reopen() {
        let harness = Harness::new(vec![Step::Resume(Resume::Continue), Step::Resume(Resume::Quit)]);
        let registry = SessionRegistry::new();
        let mut clients = Vec::new();

        let trap = harness.enter(&registry, &mut clients, true).unwrap();
        assert_eq!(trap.run("host.rs:10").unwrap(), Resume::Continue);
        assert!(registry.is_active());
        assert_eq!(harness.streams.current(StreamName::Stdout).split(':').next(), Some("socket"));

        let trap = registry
            .enter(|| panic!("a live session must be reused"))
            .unwrap();
        assert_eq!(trap.run("host.rs:20").unwrap(), Resume::Quit);

        assert_eq!(harness.opened.load(Ordering::SeqCst), 1);
        assert_eq!(harness.binds.load(Ordering::SeqCst), 1);
        let traps = harness.traps.lock().clone();
        assert_eq!(
            traps,
            vec![(1, "host.rs:10".to_string()), (1, "host.rs:20".to_string())]
        );
        assert!(harness.prompt.lock().starts_with("RDB@"));
    }

    #[test]
    fn test_quit_cleans_up_and_closes_socket() {
        let harness = Harness::new(vec![Step::Resume(Resume::Quit)]);
        let registry = SessionRegistry::new();
        let mut clients = Vec::new();

        let trap = harness.enter(&registry, &mut clients, true).unwrap();
        assert_eq!(trap.run("host.rs:1").unwrap(), Resume::Quit);

        assert!(!registry.is_active());
        assert_eq!(harness.streams.current(StreamName::Stdin), "tty-in");
        assert_eq!(harness.streams.current(StreamName::Stdout), "tty-out");
        assert_eq!(harness.streams.current(StreamName::Stderr), "tty-err");
        // client sees the remote close
        for client in clients {
            client.join().unwrap();
        }
    }

    #[test]
    fn test_new_session_after_eof() {
        let harness = Harness::new(vec![Step::Resume(Resume::Eof), Step::Resume(Resume::Continue)]);
        let registry = SessionRegistry::new();
        let mut clients = Vec::new();

        let trap = harness.enter(&registry, &mut clients, false).unwrap();
        assert_eq!(trap.run("a.rs:1").unwrap(), Resume::Eof);
        assert!(!registry.is_active());

        let trap = harness.enter(&registry, &mut clients, false).unwrap();
        assert_eq!(trap.run("a.rs:2").unwrap(), Resume::Continue);
        assert_eq!(harness.opened.load(Ordering::SeqCst), 2);
        assert_eq!(harness.traps.lock().last().unwrap().0, 2);

        registry.acquire().cleanup();
    }

    #[test]
    fn test_cleanup_twice() {
        let harness = Harness::new(vec![]);
        let (mut session, client) = harness.open(true).unwrap();
        let sets_after_apply = harness.streams.sets.load(Ordering::SeqCst);
        assert_eq!(sets_after_apply, 3);

        session.cleanup();
        assert!(!session.is_active());
        assert!(session.channel().is_closed());
        assert_eq!(harness.streams.sets.load(Ordering::SeqCst), 6);

        session.cleanup();
        drop(session);
        assert_eq!(harness.streams.sets.load(Ordering::SeqCst), 6);
        client.join().unwrap();
    }

    #[test]
    fn test_lease_cleanup_is_idempotent() {
        let registry: SessionRegistry<FakeStreams> = SessionRegistry::new();
        let mut lease = registry.acquire();
        assert!(!lease.cleanup());
        assert!(!lease.cleanup());
        lease.release();
    }

    #[test]
    fn test_engine_error_cleans_up_then_propagates() {
        let harness = Harness::new(vec![Step::Fail]);
        let registry = SessionRegistry::new();
        let mut clients = Vec::new();

        let trap = harness.enter(&registry, &mut clients, true).unwrap();
        let err = trap.run("boom.rs:3").unwrap_err();
        assert!(err.is_engine_failure());
        assert!(!registry.is_active());
        assert_eq!(harness.streams.current(StreamName::Stdout), "tty-out");
        assert_eq!(harness.streams.sets.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_engine_panic_still_restores() {
        let harness = Harness::new(vec![Step::Panic]);
        let registry = SessionRegistry::new();
        let mut clients = Vec::new();

        let trap = harness.enter(&registry, &mut clients, true).unwrap();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| trap.run("panic.rs:4")));
        assert!(outcome.is_err());

        assert!(!registry.is_active());
        assert_eq!(harness.streams.current(StreamName::Stderr), "tty-err");
        assert_eq!(harness.streams.sets.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_without_patch_streams_untouched() {
        let harness = Harness::new(vec![Step::Resume(Resume::Quit)]);
        let registry = SessionRegistry::new();
        let mut clients = Vec::new();

        let trap = harness.enter(&registry, &mut clients, false).unwrap();
        trap.run("plain.rs:5").unwrap();
        assert_eq!(harness.streams.sets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_failure_leaves_slot_empty() {
        let registry: SessionRegistry<FakeStreams> = SessionRegistry::new();
        let err = registry
            .enter(|| {
                Err(RdbError::Bind {
                    addr: "0.0.0.0:8268".to_string(),
                    source: io::Error::from(io::ErrorKind::AddrInUse),
                })
            })
            .err()
            .unwrap();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::AddrInUse));
        assert!(!registry.is_active());
    }

    #[test]
    fn test_try_acquire_is_exclusive() {
        let registry: SessionRegistry<FakeStreams> = SessionRegistry::new();
        let lease = registry.try_acquire().unwrap();
        assert!(registry.try_acquire().is_none());
        thread::scope(|s| {
            let blocked = s.spawn(|| registry.try_acquire().is_none()).join().unwrap();
            assert!(blocked);
        });

        lease.release();
        assert!(registry.try_acquire().is_some());
    }
}
