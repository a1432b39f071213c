//! Supervisor: starts the long-running subsystems and shuts them down
//!
//! Each subsystem runs on its own thread with a private [`StopToken`]. The
//! first shutdown trigger (SIGINT or [`ExitHandle::request_exit`]) moves the
//! supervisor from `Running` to `ShuttingDown`: the shutdown hook runs, every
//! token is signalled, and every thread is joined. A subsystem acknowledges
//! its stop request by returning from [`Subsystem::run`]. Later triggers are
//! ignored.

use anyhow::Result;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// A long-running part of the master
pub trait Subsystem: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until `ctx.stop` is signalled, then release resources and return
    fn run(self: Box<Self>, ctx: SubsystemContext) -> Result<()>;
}

/// What a subsystem gets when it starts
#[derive(Debug, Clone)]
pub struct SubsystemContext {
    pub stop: StopToken,
    pub exit: ExitHandle,
}

/// Cooperative stop request
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; idempotent
    pub fn stop(&self) {
        let (stopped, cvar) = &*self.inner;
        *lock(stopped) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Block until a stop is requested
    pub fn wait(&self) {
        let (stopped, cvar) = &*self.inner;
        let mut guard = lock(stopped);
        while !*guard {
            guard = cvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`; returns whether a stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (stopped, cvar) = &*self.inner;
        let guard = lock(stopped);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Why the master is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    ExitRequested(i32),
}

impl ShutdownTrigger {
    pub fn exit_status(self) -> i32 {
        match self {
            ShutdownTrigger::Interrupt => 0,
            ShutdownTrigger::ExitRequested(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Cloneable handle for requesting process exit
#[derive(Debug, Clone)]
pub struct ExitHandle {
    tx: Sender<ShutdownTrigger>,
    state: Arc<Mutex<SupervisorState>>,
}

impl ExitHandle {
    /// Shut down and exit with `code`; a no-op once shutdown has begun
    pub fn request_exit(&self, code: i32) {
        let _ = self.tx.send(ShutdownTrigger::ExitRequested(code));
    }

    /// Shut down and exit with status 0
    pub fn interrupt(&self) {
        let _ = self.tx.send(ShutdownTrigger::Interrupt);
    }

    pub fn state(&self) -> SupervisorState {
        *lock(&self.state)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != SupervisorState::Running
    }
}

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Owns the subsystems and the exit status
pub struct Supervisor {
    subsystems: Vec<Box<dyn Subsystem>>,
    exit: ExitHandle,
    triggers: Receiver<ShutdownTrigger>,
    on_shutdown: Option<ShutdownHook>,
}

struct RunningSubsystem {
    name: &'static str,
    stop: StopToken,
    thread: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, triggers) = mpsc::channel();
        Self {
            subsystems: Vec::new(),
            exit: ExitHandle {
                tx,
                state: Arc::new(Mutex::new(SupervisorState::Running)),
            },
            triggers,
            on_shutdown: None,
        }
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    pub fn with_subsystem(mut self, subsystem: impl Subsystem) -> Self {
        self.subsystems.push(Box::new(subsystem));
        self
    }

    /// Run `hook` once, when shutdown begins and before any subsystem stops
    pub fn on_shutdown(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_shutdown = Some(Box::new(hook));
        self
    }

    /// Start every subsystem, wait for a trigger, stop everything
    ///
    /// Returns the exit status the process should terminate with.
    pub fn run(self) -> i32 {
        let Supervisor {
            subsystems,
            exit,
            triggers,
            on_shutdown,
        } = self;

        let mut running: Vec<RunningSubsystem> = subsystems
            .into_iter()
            .map(|subsystem| start(subsystem, &exit))
            .collect();

        // `exit` keeps a sender alive, so this only returns on a real trigger
        let trigger = triggers.recv().unwrap_or(ShutdownTrigger::Interrupt);
        *lock(&exit.state) = SupervisorState::ShuttingDown;
        info!(?trigger, "shutting down");

        if let Some(hook) = on_shutdown {
            hook();
        }

        for subsystem in &running {
            subsystem.stop.stop();
        }
        for subsystem in &mut running {
            let Some(thread) = subsystem.thread.take() else {
                continue;
            };
            match thread.join() {
                Ok(()) => debug!(subsystem = subsystem.name, "stopped"),
                Err(_) => error!(subsystem = subsystem.name, "panicked while stopping"),
            }
        }

        drop(triggers);
        *lock(&exit.state) = SupervisorState::Terminated;
        trigger.exit_status()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn start(subsystem: Box<dyn Subsystem>, exit: &ExitHandle) -> RunningSubsystem {
    let name = subsystem.name();
    let stop = StopToken::new();
    let ctx = SubsystemContext {
        stop: stop.clone(),
        exit: exit.clone(),
    };

    let spawned = thread::Builder::new()
        .name(format!("zeus-{}", name))
        .spawn(move || {
            let stop = ctx.stop.clone();
            let exit = ctx.exit.clone();
            if let Err(e) = subsystem.run(ctx) {
                error!(subsystem = name, "{:#}", e);
                if !stop.is_stopped() {
                    exit.request_exit(1);
                }
            }
        });

    let thread = match spawned {
        Ok(thread) => {
            debug!(subsystem = name, "started");
            Some(thread)
        }
        Err(e) => {
            error!(subsystem = name, "failed to start: {}", e);
            exit.request_exit(1);
            None
        }
    };

    RunningSubsystem { name, stop, thread }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
