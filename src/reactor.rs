use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::connection::Handler;
use crate::connection::Role;
use crate::error::ConnectionError;
use crate::error::Error;
use crate::error::ReactorError;
use crate::queue::Queue;
use crate::socket;
use crate::task::Schedule;
use crate::task::Task;
use crate::task::TaskFn;
use crate::task::TaskQueue;
use log::debug;
use log::error;
use log::trace;
use log::warn;
use mio::Events;
use mio::Poll;
use mio::Registry;
use mio::Token;
use mio::Waker;
use std::collections::HashMap;
use std::io;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// Token reserved for the cross-thread waker.
const WAKER: Token = Token(0);

/// Connection tokens are allocated above the waker token.
const FIRST_TOKEN: usize = 1;

/// Default selector timeout, i.e. the longest an idle tick can take.
pub const DEFAULT_MAX_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Work sent to the loop thread. Everything that mutates the connection
/// registry or the task queue travels through this channel, which is what
/// keeps both single-threaded.
enum Action {
    Attach(Connection, Driver),
    Schedule(Task),
}

/// What drives a registered socket: a handler for streams, an accept
/// factory for listeners.
enum Driver {
    Handler(Box<dyn Handler>),
    Acceptor(Box<dyn FnMut() -> Box<dyn Handler> + Send>),
}

/// One registry entry: a connection plus whatever drives it.
struct Slot {
    conn: Connection,
    driver: Driver,
}

/// What a dispatch decided about a connection's fate.
enum Verdict {
    Keep,
    Close {
        reason: Option<ConnectionError>,
        notify: bool,
    },
}

struct LifeState {
    /// Set from loop start to teardown; also covers the window between
    /// `run_in_thread` returning and the spawned loop publishing itself,
    /// so schedulers never race the startup.
    claimed: bool,
    /// The thread executing the loop, present exactly while it runs.
    thread: Option<thread::Thread>,
}

struct Shared {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    actions: Mutex<mpsc::Sender<Action>>,
    action_rx: Mutex<mpsc::Receiver<Action>>,
    actions_pending: AtomicBool,
    ticks: AtomicU64,
    next_token: AtomicUsize,
    stop: AtomicBool,
    max_tick_interval: Option<Duration>,
    state: Mutex<LifeState>,
    stopped: Condvar,
    conn_ids: Mutex<Vec<ConnectionId>>,
}

/// A single-threaded network event reactor.
///
/// One loop thread multiplexes every registered socket, dispatches readiness
/// to the connection handlers and interleaves deferred tasks with I/O. The
/// handle itself is cheap to clone and safe to share: `stop`, the task
/// schedulers and `connect`/`listen` may be called from any thread and take
/// effect on the loop.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

//---------------------------------------------------------
//  LIFECYCLE.
//---------------------------------------------------------

impl Reactor {
    /// Creates an idle reactor. `max_tick_interval` bounds how long the
    /// selector may block per tick; `None` blocks until readiness or a
    /// cross-thread wake-up.
    pub fn new(max_tick_interval: impl Into<Option<Duration>>) -> Self {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKER).unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let (sender, receiver) = mpsc::channel();

        Reactor {
            shared: Arc::new(Shared {
                poll: Mutex::new(poll),
                registry,
                waker,
                actions: Mutex::new(sender),
                action_rx: Mutex::new(receiver),
                actions_pending: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                next_token: AtomicUsize::new(FIRST_TOKEN),
                stop: AtomicBool::new(false),
                max_tick_interval: max_tick_interval.into(),
                state: Mutex::new(LifeState {
                    claimed: false,
                    thread: None,
                }),
                stopped: Condvar::new(),
                conn_ids: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Runs the loop on the calling thread until the reactor is stopped.
    pub fn run(&self) -> Result<(), ReactorError> {
        self.try_claim()?;
        self.run_loop(None, false);
        Ok(())
    }

    /// Like [`run`], with `first_tick` executed as the first tick's task.
    ///
    /// [`run`]: Reactor::run
    pub fn run_with<F>(&self, first_tick: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.try_claim()?;
        self.run_loop(Some(once_body(first_tick)), false);
        Ok(())
    }

    /// Runs a short-lived loop: `body` executes on the loop thread as the
    /// first tick, and ticking continues until the reactor is stopped or
    /// nothing remains to drive (no connections, no tasks, no pending
    /// scheduling).
    pub fn run_block<F>(&self, body: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.try_claim()?;
        self.run_loop(Some(once_body(body)), true);
        Ok(())
    }

    /// Spawns a fresh thread and runs the loop there.
    pub fn run_in_thread(&self) -> Result<thread::JoinHandle<()>, ReactorError> {
        self.try_claim()?;
        let reactor = self.clone();
        Ok(thread::spawn(move || reactor.run_loop(None, false)))
    }

    /// Requests termination. Idempotent, callable from any thread, a no-op
    /// when no loop is active. The request rides the task queue as a
    /// one-off, so the loop observes it at a tick boundary.
    pub fn stop(&self) {
        if self.ensure_active().is_err() {
            return;
        }
        let shared = self.shared.clone();
        self.send_action(Action::Schedule(Task::new(
            Schedule::NextTick,
            Box::new(move |_| shared.stop.store(true, Ordering::SeqCst)),
        )));
    }

    /// Blocks until the loop has fully torn down. Returns immediately when
    /// nothing runs, or when called on the loop thread itself (which could
    /// never observe its own exit).
    pub fn wait(&self) {
        if self.in_loop_thread().unwrap_or(false) {
            warn!("wait() called from the loop thread, not blocking");
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        while state.claimed {
            state = self.shared.stopped.wait(state).unwrap();
        }
    }

    /// True iff a loop thread is executing.
    pub fn running(&self) -> bool {
        self.shared.state.lock().unwrap().thread.is_some()
    }

    /// The loop thread, if one is executing.
    pub fn thread(&self) -> Option<thread::Thread> {
        self.shared.state.lock().unwrap().thread.clone()
    }

    /// Ticks completed so far; zero whenever the loop is not running.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    /// Whether the caller is on the loop thread.
    pub fn in_loop_thread(&self) -> Result<bool, ReactorError> {
        match &self.shared.state.lock().unwrap().thread {
            Some(handle) => Ok(handle.id() == thread::current().id()),
            None => Err(ReactorError::NotRunning),
        }
    }

    /// Whether `other` is a handle to this very reactor instance.
    pub fn ptr_eq(&self, other: &Reactor) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn try_claim(&self) -> Result<(), ReactorError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.claimed {
            return Err(ReactorError::AlreadyRunning);
        }
        state.claimed = true;
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), ReactorError> {
        if self.shared.state.lock().unwrap().claimed {
            Ok(())
        } else {
            Err(ReactorError::NotRunning)
        }
    }
}

//---------------------------------------------------------
//  SCHEDULING.
//---------------------------------------------------------

impl Reactor {
    /// Schedules `body` to run on every tick until the reactor stops.
    pub fn on_tick<F>(&self, body: F) -> Result<(), ReactorError>
    where
        F: FnMut(&Reactor) + Send + 'static,
    {
        self.schedule_task(Schedule::EveryTick, Box::new(body))
    }

    /// Schedules `body` to run once, on the next tick.
    pub fn next_tick<F>(&self, body: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.schedule_task(Schedule::NextTick, once_body(body))
    }

    /// Schedules `body` to run every `interval`, first in one `interval`
    /// from now. Deadlines advance by the interval itself, so the cadence
    /// does not drift with callback latency.
    pub fn at_interval<F>(&self, interval: Duration, body: F) -> Result<(), ReactorError>
    where
        F: FnMut(&Reactor) + Send + 'static,
    {
        self.schedule_task(
            Schedule::Interval {
                interval,
                next_fire: Instant::now() + interval,
            },
            Box::new(body),
        )
    }

    /// Schedules `body` to run once, no earlier than `delay` from now.
    pub fn delay<F>(&self, delay: Duration, body: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.schedule_task(
            Schedule::Once {
                fire_at: Instant::now() + delay,
            },
            once_body(body),
        )
    }

    /// Runs `body` on the loop thread: inline when the caller already is the
    /// loop thread, as a next-tick task otherwise.
    pub fn schedule<F>(&self, body: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.ensure_active()?;
        if self.in_loop_thread().unwrap_or(false) {
            body(self);
            Ok(())
        } else {
            self.next_tick(body)
        }
    }

    /// Returns a FIFO queue whose consumers run on this reactor's loop
    /// thread.
    pub fn create_queue<T: Send + 'static>(&self) -> Queue<T> {
        Queue::new(self.clone())
    }

    fn schedule_task(&self, schedule: Schedule, body: TaskFn) -> Result<(), ReactorError> {
        self.ensure_active()?;
        self.send_action(Action::Schedule(Task::new(schedule, body)));
        Ok(())
    }

    fn send_action(&self, action: Action) {
        let sender = self.shared.actions.lock().unwrap();
        if sender.send(action).is_ok() {
            self.shared.actions_pending.store(true, Ordering::SeqCst);
        }
        drop(sender);
        // Interrupt the selector so the loop notices promptly.
        let _ = self.shared.waker.wake();
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.shared.next_token.fetch_add(1, Ordering::SeqCst))
    }
}

//---------------------------------------------------------
//  CONNECT AND LISTEN.
//---------------------------------------------------------

impl Reactor {
    /// Opens a non-blocking TCP connection towards `host:port` driven by
    /// `handler`.
    ///
    /// Failures never surface here: whatever goes wrong, at creation or
    /// later, is reported through the handler's `on_close` reason. The call
    /// itself only fails when no loop is active.
    pub fn connect_tcp<H>(&self, host: &str, port: u16, handler: H) -> Result<ConnectionId, ReactorError>
    where
        H: Handler + 'static,
    {
        self.ensure_active()?;
        let id = self.next_id();
        let conn = match socket::connect_tcp(host, port) {
            Ok(socket) => Connection::new(id, Role::Client, socket),
            Err(reason) => Connection::dead(id, Role::Client, reason),
        };
        self.send_action(Action::Attach(conn, Driver::Handler(Box::new(handler))));
        Ok(id)
    }

    /// Opens a non-blocking UNIX-domain connection towards `path`. Same
    /// failure contract as [`connect_tcp`].
    ///
    /// [`connect_tcp`]: Reactor::connect_tcp
    pub fn connect_unix<H, P>(&self, path: P, handler: H) -> Result<ConnectionId, ReactorError>
    where
        H: Handler + 'static,
        P: AsRef<Path>,
    {
        self.ensure_active()?;
        let id = self.next_id();
        let conn = match socket::connect_unix(path.as_ref()) {
            Ok(socket) => Connection::new(id, Role::Client, socket),
            Err(reason) => Connection::dead(id, Role::Client, reason),
        };
        self.send_action(Action::Attach(conn, Driver::Handler(Box::new(handler))));
        Ok(id)
    }

    /// Starts a TCP listener on `host:port`. `factory` produces a fresh
    /// handler for every accepted peer.
    ///
    /// Unlike `connect`, configuration failures (resolution, bind,
    /// permission) are raised synchronously: they are the caller's to fix.
    pub fn listen_tcp<H, F>(&self, host: &str, port: u16, factory: F) -> Result<ConnectionId, Error>
    where
        H: Handler + 'static,
        F: FnMut() -> H + Send + 'static,
    {
        self.ensure_active()?;
        let socket = socket::listen_tcp(host, port)?;
        Ok(self.attach_listener(socket, factory))
    }

    /// Starts a UNIX-domain listener at `path`. Same contract as
    /// [`listen_tcp`].
    ///
    /// [`listen_tcp`]: Reactor::listen_tcp
    pub fn listen_unix<H, F, P>(&self, path: P, factory: F) -> Result<ConnectionId, Error>
    where
        H: Handler + 'static,
        F: FnMut() -> H + Send + 'static,
        P: AsRef<Path>,
    {
        self.ensure_active()?;
        let socket = socket::listen_unix(path.as_ref())?;
        Ok(self.attach_listener(socket, factory))
    }

    /// Snapshot of the currently attached connections.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.shared.conn_ids.lock().unwrap().clone()
    }

    fn attach_listener<H, F>(&self, socket: socket::Socket, mut factory: F) -> ConnectionId
    where
        H: Handler + 'static,
        F: FnMut() -> H + Send + 'static,
    {
        let id = self.next_id();
        let conn = Connection::new(id, Role::Listener, socket);
        let factory = Box::new(move || Box::new(factory()) as Box<dyn Handler>);
        self.send_action(Action::Attach(conn, Driver::Acceptor(factory)));
        id
    }
}

//---------------------------------------------------------
//  THE LOOP.
//---------------------------------------------------------

impl Reactor {
    fn run_loop(&self, first_tick: Option<TaskFn>, drain_when_idle: bool) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.thread = Some(thread::current());
        }
        debug!("reactor loop started");

        let mut connections: HashMap<Token, Slot> = HashMap::new();
        let mut tasks = TaskQueue::new();
        let mut events = Events::with_capacity(1024);

        if let Some(body) = first_tick {
            tasks.push(Task::new(Schedule::NextTick, body));
        }

        loop {
            self.prepare(&mut connections, &mut tasks);
            self.sync_interests(&mut connections);

            let timeout = self.poll_timeout(&tasks);
            {
                let mut poll = self.shared.poll.lock().unwrap();
                match poll.poll(&mut events, timeout) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => events.clear(),
                    Err(err) => panic!("selector failure: {err}"),
                }
            }

            let mut errored = Vec::new();
            let mut writable = Vec::new();
            let mut readable = Vec::new();

            for event in events.iter() {
                let token = event.token();
                // Token(0) only signals that someone woke us up.
                if token == WAKER {
                    continue;
                }
                if event.is_error() {
                    errored.push(token);
                }
                if event.is_writable() {
                    writable.push(token);
                }
                if event.is_readable() || event.is_read_closed() {
                    readable.push(token);
                }
            }

            // Errors first, then writes before reads so outgoing buffers
            // drain before new bytes arrive.
            for token in errored {
                self.dispatch_error(&mut connections, token);
            }
            for token in writable {
                self.dispatch_write(&mut connections, token);
            }
            for token in readable {
                self.dispatch_read(&mut connections, token);
            }

            tasks.run(self);

            self.shared.ticks.fetch_add(1, Ordering::SeqCst);

            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
            if drain_when_idle
                && connections.is_empty()
                && tasks.is_empty()
                && !self.shared.actions_pending.load(Ordering::SeqCst)
            {
                break;
            }
        }

        self.teardown(&mut connections, &mut tasks);
    }

    /// Drains the action channel: attaches pending connections and appends
    /// scheduled tasks, in arrival order.
    fn prepare(&self, connections: &mut HashMap<Token, Slot>, tasks: &mut TaskQueue) {
        self.shared.actions_pending.store(false, Ordering::SeqCst);
        let pending: Vec<Action> = {
            let receiver = self.shared.action_rx.lock().unwrap();
            receiver.try_iter().collect()
        };

        for action in pending {
            match action {
                Action::Attach(conn, driver) => self.attach(connections, conn, driver),
                Action::Schedule(task) => tasks.push(task),
            }
        }
    }

    fn attach(&self, connections: &mut HashMap<Token, Slot>, conn: Connection, driver: Driver) {
        let mut slot = Slot { conn, driver };

        // A connect that already failed never registers; attaching it only
        // reports the stored reason.
        if let Some(reason) = slot.conn.take_pending_error() {
            self.close_slot(slot, Some(reason), true);
            return;
        }

        if let Err(err) = slot.conn.sync_registration(&self.shared.registry) {
            warn!("failed to register {:?}: {err}", slot.conn.id());
            self.close_slot(slot, Some(err.into()), true);
            return;
        }

        self.shared.conn_ids.lock().unwrap().push(slot.conn.id());
        trace!("attached {:?} as {:?}", slot.conn.id(), slot.conn.role());
        connections.insert(slot.conn.token(), slot);
    }

    /// Re-registers whichever sockets changed their desired interest, e.g.
    /// because bytes were queued or an outgoing buffer drained.
    fn sync_interests(&self, connections: &mut HashMap<Token, Slot>) {
        for slot in connections.values_mut() {
            if let Err(err) = slot.conn.sync_registration(&self.shared.registry) {
                warn!("failed to update interest for {:?}: {err}", slot.conn.id());
            }
        }
    }

    /// Bounded by `max_tick_interval` and by the nearest timed-task
    /// deadline. Cross-thread scheduling interrupts the wait via the waker.
    fn poll_timeout(&self, tasks: &TaskQueue) -> Option<Duration> {
        let cap = self.shared.max_tick_interval;
        match tasks.next_timed_due(Instant::now()) {
            Some(next) => Some(match cap {
                Some(cap) => cap.min(next),
                None => next,
            }),
            None => cap,
        }
    }

    /// Internal shutdown: close everything without user callbacks, clear the
    /// queues and reset the counters so the instance is reusable.
    fn teardown(&self, connections: &mut HashMap<Token, Slot>, tasks: &mut TaskQueue) {
        for (_, slot) in connections.drain() {
            self.close_slot(slot, None, false);
        }
        self.shared.conn_ids.lock().unwrap().clear();
        tasks.clear();

        // Whatever was scheduled but never observed dies with the loop.
        {
            let receiver = self.shared.action_rx.lock().unwrap();
            while receiver.try_recv().is_ok() {}
        }
        self.shared.actions_pending.store(false, Ordering::SeqCst);

        self.shared.ticks.store(0, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock().unwrap();
            state.thread = None;
            state.claimed = false;
        }
        self.shared.stopped.notify_all();
        debug!("reactor loop stopped");
    }
}

//---------------------------------------------------------
//  READINESS DISPATCH.
//---------------------------------------------------------

impl Reactor {
    /// An error-flagged socket closes its connection with the translated
    /// reason.
    fn dispatch_error(&self, connections: &mut HashMap<Token, Slot>, token: Token) {
        let mut slot = match connections.remove(&token) {
            Some(slot) => slot,
            None => return,
        };
        let reason = slot
            .conn
            .take_socket_error()
            .map(ConnectionError::from)
            .unwrap_or_else(|| ConnectionError::Other("socket error".into()));
        self.close_slot(slot, Some(reason), true);
    }

    fn dispatch_write(&self, connections: &mut HashMap<Token, Slot>, token: Token) {
        let mut slot = match connections.remove(&token) {
            Some(slot) => slot,
            None => return,
        };
        if slot.conn.role() == Role::Listener {
            connections.insert(token, slot);
            return;
        }
        match self.write_ready(&mut slot) {
            Verdict::Keep => {
                connections.insert(token, slot);
            }
            Verdict::Close { reason, notify } => self.close_slot(slot, reason, notify),
        }
    }

    fn dispatch_read(&self, connections: &mut HashMap<Token, Slot>, token: Token) {
        let listener = matches!(
            connections.get(&token),
            Some(slot) if slot.conn.role() == Role::Listener
        );
        if listener {
            self.accept_ready(connections, token);
            return;
        }

        let mut slot = match connections.remove(&token) {
            Some(slot) => slot,
            None => return,
        };
        match self.read_ready(&mut slot) {
            Verdict::Keep => {
                connections.insert(token, slot);
            }
            Verdict::Close { reason, notify } => self.close_slot(slot, reason, notify),
        }
    }

    fn write_ready(&self, slot: &mut Slot) -> Verdict {
        let Slot { conn, driver } = slot;
        let handler = match driver {
            Driver::Handler(handler) => handler,
            Driver::Acceptor(_) => return Verdict::Keep,
        };

        // First writable on a client socket means the non-blocking connect
        // finished, one way or the other.
        if !conn.connected() {
            if let Some(err) = conn.take_socket_error() {
                return Verdict::Close {
                    reason: Some(err.into()),
                    notify: true,
                };
            }
            conn.mark_connected();
            if !guarded("on_connect", conn.id(), || handler.on_connect(self, conn)) {
                return Verdict::Close {
                    reason: Some(panic_reason()),
                    notify: true,
                };
            }
            if conn.wants_close() {
                let reason = conn.take_close_reason();
                return Verdict::Close {
                    reason,
                    notify: true,
                };
            }
        }

        if conn.has_outgoing() {
            match conn.flush_outgoing() {
                Ok(true) => {
                    if !guarded("on_write", conn.id(), || handler.on_write(self, conn)) {
                        return Verdict::Close {
                            reason: Some(panic_reason()),
                            notify: true,
                        };
                    }
                    if conn.wants_close() {
                        let reason = conn.take_close_reason();
                        return Verdict::Close {
                            reason,
                            notify: true,
                        };
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    return Verdict::Close {
                        reason: Some(err),
                        notify: true,
                    }
                }
            }
        } else if conn.wants_close() {
            // close_after_write with nothing left to flush.
            let reason = conn.take_close_reason();
            return Verdict::Close {
                reason,
                notify: true,
            };
        }

        Verdict::Keep
    }

    fn read_ready(&self, slot: &mut Slot) -> Verdict {
        let Slot { conn, driver } = slot;
        let handler = match driver {
            Driver::Handler(handler) => handler,
            Driver::Acceptor(_) => return Verdict::Keep,
        };

        let (data, eof) = match conn.read_available() {
            Ok(result) => result,
            Err(err) => {
                return Verdict::Close {
                    reason: Some(err),
                    notify: true,
                }
            }
        };

        if !data.is_empty() {
            conn.buffer_received(&data);
            if !guarded("on_read", conn.id(), || handler.on_read(self, conn, &data)) {
                return Verdict::Close {
                    reason: Some(panic_reason()),
                    notify: true,
                };
            }
            if conn.wants_close() {
                let reason = conn.take_close_reason();
                return Verdict::Close {
                    reason,
                    notify: true,
                };
            }
        }

        if eof {
            // Peer hung up.
            return Verdict::Close {
                reason: Some(ConnectionError::Closed),
                notify: true,
            };
        }

        Verdict::Keep
    }

    /// Accepts every queued peer on a readable listener, attaching a fresh
    /// handler from the factory for each.
    fn accept_ready(&self, connections: &mut HashMap<Token, Slot>, token: Token) {
        loop {
            let accepted = match connections.get_mut(&token) {
                Some(slot) => slot.conn.accept(),
                None => return,
            };
            let socket = match accepted {
                None => return,
                Some(Ok(socket)) => socket,
                Some(Err(err)) => {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    warn!("accept failed: {err}");
                    return;
                }
            };

            let handler = match connections.get_mut(&token) {
                Some(slot) => match &mut slot.driver {
                    Driver::Acceptor(factory) => factory(),
                    Driver::Handler(_) => return,
                },
                None => return,
            };

            let id = self.next_id();
            let mut slot = Slot {
                conn: Connection::new(id, Role::Server, socket),
                driver: Driver::Handler(handler),
            };

            if let Err(err) = slot.conn.sync_registration(&self.shared.registry) {
                warn!("failed to register accepted socket {id:?}: {err}");
                self.close_slot(slot, Some(err.into()), true);
                continue;
            }
            self.shared.conn_ids.lock().unwrap().push(id);
            trace!("accepted {id:?}");

            // Accepted sockets are connected from the start.
            let ok = {
                let Slot { conn, driver } = &mut slot;
                match driver {
                    Driver::Handler(handler) => {
                        guarded("on_connect", conn.id(), || handler.on_connect(self, conn))
                    }
                    Driver::Acceptor(_) => true,
                }
            };
            if !ok {
                self.close_slot(slot, Some(panic_reason()), true);
                continue;
            }
            if slot.conn.wants_close() {
                let reason = slot.conn.take_close_reason();
                self.close_slot(slot, reason, true);
                continue;
            }

            connections.insert(slot.conn.token(), slot);
        }
    }

    /// Detaches and closes a connection: registry entry first, then the
    /// close callback, then the socket handle.
    fn close_slot(&self, mut slot: Slot, reason: Option<ConnectionError>, notify: bool) {
        let id = slot.conn.id();
        self.shared.conn_ids.lock().unwrap().retain(|other| *other != id);
        slot.conn.deregister(&self.shared.registry);
        slot.conn.mark_closed();

        if notify {
            if let Driver::Handler(handler) = &mut slot.driver {
                guarded("on_close", id, || {
                    handler.on_close(self, &mut slot.conn, reason.as_ref())
                });
            }
        }

        slot.conn.release_socket();
        trace!("closed {id:?} ({reason:?})");
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TICK_INTERVAL)
    }
}

/// Adapts a one-shot closure to the reusable task-body shape.
fn once_body<F>(body: F) -> TaskFn
where
    F: FnOnce(&Reactor) + Send + 'static,
{
    let mut body = Some(body);
    Box::new(move |reactor| {
        if let Some(body) = body.take() {
            body(reactor);
        }
    })
}

/// Contains a panicking user callback: the loop must not die with it.
fn guarded<F: FnOnce()>(what: &str, id: ConnectionId, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            error!("{what} panicked on {id:?}, closing the connection");
            false
        }
    }
}

fn panic_reason() -> ConnectionError {
    ConnectionError::Other("handler panicked".into())
}
