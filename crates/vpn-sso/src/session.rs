//! Connection state machine.
//!
//! [`VpnService`] is a thin handle around a run-loop thread that owns every
//! piece of per-connection state. Commands, process output and cache
//! completions all arrive on one channel; timers (SSO timeout, device poll,
//! disconnect grace) are derived from that state each time round the loop.

use crate::cache::{CacheOp, CacheReply, CacheWorker, CredentialCache};
use crate::config::{ConnectionConfig, Protocol, ServiceSettings};
use crate::error::VpnSsoError;
use crate::launcher::{Launcher, SystemLauncher};
use crate::process::{ExitOutcome, ProcessEvent, ProcessKind, Stream};
use crate::secret::Credential;
use crate::session_env::{EnvironmentSource, SessionResolver};
use crate::sso::{self, SsoProcess};
use crate::tunnel::{TunnelConfig, TunnelNotice, TunnelProcess};
use crate::utils::CancellationToken;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::Level;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Authenticating,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the service reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    StateChanged(ConnectionState),
    TunnelReady(TunnelConfig),
    Log { level: Level, message: String },
    Failed(VpnSsoError),
}

enum Command {
    Connect {
        config: ConnectionConfig,
        reply: Sender<Result<(), VpnSsoError>>,
    },
    Disconnect {
        reply: Sender<()>,
    },
    Shutdown,
}

/// Everything the run loop reacts to.
enum LoopEvent {
    Command(Command),
    Process(ProcessEvent),
    Cache { attempt: u64, reply: CacheReply },
}

impl From<ProcessEvent> for LoopEvent {
    fn from(event: ProcessEvent) -> Self {
        LoopEvent::Process(event)
    }
}

/// Process (or cache request) currently driving an attempt. Never more than
/// one at a time.
enum Stage {
    CacheLookup,
    Sso(SsoProcess),
    Tunnel(TunnelProcess),
}

enum Teardown {
    /// Waiting for the process to react to the gentle signal.
    Graceful { until: Instant },
    /// SIGKILL sent; waiting for the exit to be observed.
    Killed { until: Instant },
}

/// State of one `connect()` request, dropped as a whole when it ends.
struct ConnectionAttempt {
    id: u64,
    config: ConnectionConfig,
    using_cached: bool,
    retried: bool,
    stage: Stage,
    teardown: Option<Teardown>,
}

impl ConnectionAttempt {
    fn stage_name(&self) -> &'static str {
        match self.stage {
            Stage::CacheLookup => "cache lookup",
            Stage::Sso(_) => "SSO",
            Stage::Tunnel(_) => "tunnel",
        }
    }
}

struct RunLoop {
    settings: ServiceSettings,
    launcher: Arc<dyn Launcher>,
    environment: Arc<dyn EnvironmentSource>,
    cache: Arc<CacheWorker>,
    loop_tx: Sender<LoopEvent>,
    events: Sender<ServiceEvent>,
    state: ConnectionState,
    shared_state: Arc<Mutex<ConnectionState>>,
    next_id: u64,
    attempt: Option<ConnectionAttempt>,
    disconnect_waiters: Vec<Sender<()>>,
    shutting_down: bool,
}

impl RunLoop {
    fn run(mut self, rx: Receiver<LoopEvent>) {
        log::debug!("Connection loop started");
        loop {
            self.fire_timers();
            if self.shutting_down && self.attempt.is_none() {
                break;
            }

            let event = match self.next_deadline() {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                LoopEvent::Command(cmd) => self.on_command(cmd),
                LoopEvent::Process(event) => self.on_process_event(event),
                LoopEvent::Cache { attempt, reply } => self.on_cache_reply(attempt, reply),
            }
        }
        log::debug!("Connection loop stopped");
    }

    // ================= Reporting =================

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::debug!("State {} -> {}", self.state, state);
        self.state = state;
        *self
            .shared_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
        self.emit(ServiceEvent::StateChanged(state));
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{}", message);
        self.emit(ServiceEvent::Log { level, message });
    }

    // ================= Commands =================

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { config, reply } => {
                let _ = reply.send(self.connect(config));
            }
            Command::Disconnect { reply } => {
                self.disconnect_waiters.push(reply);
                self.disconnect();
            }
            Command::Shutdown => {
                self.shutting_down = true;
                self.disconnect();
            }
        }
    }

    fn connect(&mut self, config: ConnectionConfig) -> Result<(), VpnSsoError> {
        if self.shutting_down {
            return Err(VpnSsoError::Busy);
        }
        if let Some(attempt) = &self.attempt {
            log::warn!(
                "Rejecting connect to {}: attempt {} is still in {} stage",
                config.gateway,
                attempt.id,
                attempt.stage_name()
            );
            return Err(VpnSsoError::Busy);
        }
        config.validate()?;

        self.next_id += 1;
        let id = self.next_id;
        self.notify(
            Level::Info,
            format!("Connecting to {} ({})", config.gateway, config.protocol),
        );

        let lookup = CacheOp::Lookup {
            gateway: config.gateway.clone(),
            protocol: config.protocol,
        };
        self.attempt = Some(ConnectionAttempt {
            id,
            config,
            using_cached: false,
            retried: false,
            stage: Stage::CacheLookup,
            teardown: None,
        });

        let tx = self.loop_tx.clone();
        self.cache.submit(lookup, move |reply| {
            let _ = tx.send(LoopEvent::Cache { attempt: id, reply });
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        let now = Instant::now();
        let grace = self.settings.disconnect_grace();
        let kill_wait = self.settings.kill_wait();

        let Some(attempt) = self.attempt.as_mut() else {
            self.release_waiters();
            return;
        };
        if attempt.teardown.is_some() {
            return;
        }

        match &mut attempt.stage {
            Stage::CacheLookup => {
                log::info!("Disconnect during cache lookup, dropping attempt {}", attempt.id);
                self.finish_attempt(ConnectionState::Idle);
                return;
            }
            Stage::Sso(sso) => {
                log::info!("Cancelling SSO authentication");
                sso.cancel();
                attempt.teardown = Some(Teardown::Killed {
                    until: now + kill_wait,
                });
            }
            Stage::Tunnel(tunnel) => {
                log::info!("Disconnecting tunnel (SIGHUP, session kept)");
                tunnel.hangup();
                attempt.teardown = Some(Teardown::Graceful {
                    until: now + grace,
                });
            }
        }
        self.set_state(ConnectionState::Disconnecting);
    }

    fn release_waiters(&mut self) {
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Drops the current attempt and settles in `state`.
    fn finish_attempt(&mut self, state: ConnectionState) {
        if let Some(attempt) = self.attempt.take() {
            log::debug!("Attempt {} finished ({})", attempt.id, state);
        }
        self.set_state(state);
        self.release_waiters();
    }

    fn fail(&mut self, err: VpnSsoError) {
        self.notify(Level::Error, err.to_string());
        self.emit(ServiceEvent::Failed(err));
        self.finish_attempt(ConnectionState::Failed);
    }

    // ================= Stage Transitions =================

    fn start_sso(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let started = SsoProcess::start(
            self.launcher.as_ref(),
            self.environment.as_ref(),
            &self.settings,
            &attempt.config,
            attempt.id,
            self.loop_tx.clone(),
        );
        match started {
            Ok(sso) => {
                attempt.stage = Stage::Sso(sso);
                self.set_state(ConnectionState::Authenticating);
                self.notify(Level::Info, "Waiting for SSO login in the browser");
            }
            Err(e) => self.fail(e),
        }
    }

    fn start_tunnel(&mut self, credential: Credential) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let started = TunnelProcess::start(
            self.launcher.as_ref(),
            &self.settings,
            &attempt.config,
            credential,
            attempt.id,
            self.loop_tx.clone(),
        );
        match started {
            Ok(tunnel) => {
                attempt.stage = Stage::Tunnel(tunnel);
                self.set_state(ConnectionState::Connecting);
            }
            Err(e) => self.fail(e),
        }
    }

    fn store_credential(&self, config: &ConnectionConfig, credential: Credential) {
        self.cache.submit_logged(CacheOp::Store {
            gateway: config.gateway.clone(),
            protocol: config.protocol,
            credential,
            ttl_hours: config.effective_cache_hours(),
        });
    }

    // ================= Events =================

    fn on_cache_reply(&mut self, id: u64, reply: CacheReply) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.id != id || !matches!(attempt.stage, Stage::CacheLookup) {
            log::debug!("Ignoring cache reply for stale attempt {}", id);
            return;
        }

        match reply {
            CacheReply::Lookup(Ok(Some(entry))) => {
                attempt.using_cached = true;
                let remaining = entry.expires_at - crate::utils::unix_now();
                self.notify(
                    Level::Info,
                    format!(
                        "Using cached credentials (valid for another {} min)",
                        remaining.max(0) / 60
                    ),
                );
                self.start_tunnel(entry.credential);
            }
            CacheReply::Lookup(Ok(None)) => {
                log::info!("No cached credentials, starting SSO");
                self.start_sso();
            }
            CacheReply::Lookup(Err(e)) => {
                log::warn!("{}; continuing without cache", e);
                self.start_sso();
            }
            other => log::debug!("Unexpected cache reply {:?}", other),
        }
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        let tag = event.tag();
        let current = match self.attempt.as_ref() {
            Some(attempt) => attempt.id == tag.attempt,
            None => false,
        };
        if !current {
            if let ProcessEvent::Exited { outcome, .. } = &event {
                log::debug!("Process from attempt {} ended with {}", tag.attempt, outcome);
            }
            return;
        }

        match event {
            ProcessEvent::Line { stream, line, .. } => self.on_line(tag.kind, stream, &line),
            ProcessEvent::Exited { outcome, .. } => self.on_exit(tag.kind, outcome),
        }
    }

    fn on_line(&mut self, kind: ProcessKind, stream: Stream, line: &str) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        match (&mut attempt.stage, kind) {
            (Stage::Sso(sso), ProcessKind::Sso) => sso.on_line(stream, line),
            (Stage::Tunnel(tunnel), ProcessKind::Tunnel) => {
                let notices = tunnel.on_line(stream, line);
                let config = attempt.config.clone();
                for notice in notices {
                    match notice {
                        TunnelNotice::Renewed(credential) => {
                            self.notify(Level::Info, "Session cookie renewed, updating cache");
                            self.store_credential(&config, credential);
                        }
                        TunnelNotice::Configured => {
                            self.notify(Level::Info, "Tunnel configured, waiting for device")
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn on_exit(&mut self, kind: ProcessKind, outcome: ExitOutcome) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };

        if attempt.teardown.is_some() {
            log::info!("{} process ended with {} during disconnect", attempt.stage_name(), outcome);
            self.attempt = Some(attempt);
            self.finish_attempt(ConnectionState::Idle);
            return;
        }

        let stage = std::mem::replace(&mut attempt.stage, Stage::CacheLookup);
        match (stage, kind) {
            (Stage::Sso(sso), ProcessKind::Sso) => {
                self.attempt = Some(attempt);
                match sso.finish(outcome) {
                    Ok(credential) => {
                        if let Some(attempt) = &self.attempt {
                            self.store_credential(&attempt.config, credential.clone());
                        }
                        self.start_tunnel(credential);
                    }
                    Err(e) => self.fail(e),
                }
            }
            (Stage::Tunnel(tunnel), ProcessKind::Tunnel) => {
                self.on_tunnel_exit(attempt, tunnel, outcome);
            }
            (stage, _) => {
                attempt.stage = stage;
                self.attempt = Some(attempt);
            }
        }
    }

    fn on_tunnel_exit(
        &mut self,
        mut attempt: ConnectionAttempt,
        tunnel: TunnelProcess,
        outcome: ExitOutcome,
    ) {
        let was_up = tunnel.is_reported();
        drop(tunnel);

        match outcome {
            ExitOutcome::Success => {
                self.attempt = Some(attempt);
                self.notify(Level::Info, "Tunnel closed by the server");
                self.finish_attempt(ConnectionState::Idle);
            }
            ExitOutcome::Failed(code) if attempt.using_cached && !attempt.retried => {
                let rejected = VpnSsoError::CredentialRejected(code);
                self.notify(
                    Level::Warn,
                    format!("{}, clearing cache and signing in again", rejected),
                );
                self.cache.submit_logged(CacheOp::Clear {
                    gateway: attempt.config.gateway.clone(),
                    protocol: attempt.config.protocol,
                });
                attempt.using_cached = false;
                attempt.retried = true;
                self.attempt = Some(attempt);
                self.start_sso();
            }
            ExitOutcome::Failed(code) => {
                self.attempt = Some(attempt);
                let reason = if was_up {
                    format!("tunnel dropped with exit code {}", code)
                } else {
                    format!("tunnel binary exited with code {}", code)
                };
                self.fail(VpnSsoError::Tunnel(reason));
            }
            ExitOutcome::Signaled(_) => {
                self.attempt = Some(attempt);
                self.fail(VpnSsoError::Tunnel(format!("tunnel binary {}", outcome)));
            }
        }
    }

    // ================= Timers =================

    fn next_deadline(&self) -> Option<Instant> {
        let attempt = self.attempt.as_ref()?;
        match &attempt.teardown {
            Some(Teardown::Graceful { until }) | Some(Teardown::Killed { until }) => {
                return Some(*until)
            }
            None => {}
        }
        match &attempt.stage {
            Stage::CacheLookup => None,
            Stage::Sso(sso) => Some(sso.deadline()),
            Stage::Tunnel(tunnel) => tunnel.poll_deadline(),
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let kill_wait = self.settings.kill_wait();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        match attempt.teardown {
            Some(Teardown::Graceful { until }) if now >= until => {
                log::warn!("Tunnel ignored SIGHUP, killing it");
                if let Stage::Tunnel(tunnel) = &mut attempt.stage {
                    tunnel.kill();
                }
                attempt.teardown = Some(Teardown::Killed {
                    until: now + kill_wait,
                });
                return;
            }
            Some(Teardown::Killed { until }) if now >= until => {
                log::warn!(
                    "{} process did not exit after SIGKILL, abandoning it",
                    attempt.stage_name()
                );
                self.finish_attempt(ConnectionState::Idle);
                return;
            }
            Some(_) => return,
            None => {}
        }

        match &mut attempt.stage {
            Stage::Sso(sso) if now >= sso.deadline() => {
                sso.cancel();
                let secs = self.settings.sso_timeout_secs;
                self.fail(VpnSsoError::Authentication(format!(
                    "timed out after {} seconds",
                    secs
                )));
            }
            Stage::Tunnel(tunnel) if tunnel.poll_deadline().is_some_and(|d| now >= d) => {
                if let Some(config) = tunnel.poll_device(&self.settings) {
                    self.set_state(ConnectionState::Connected);
                    self.notify(
                        Level::Info,
                        format!("VPN connected on {}", config.device),
                    );
                    self.emit(ServiceEvent::TunnelReady(config));
                }
            }
            _ => {}
        }
    }
}

/// Builds a [`VpnService`]. Anything not supplied uses the system default.
pub struct VpnServiceBuilder {
    settings: ServiceSettings,
    launcher: Option<Arc<dyn Launcher>>,
    environment: Option<Arc<dyn EnvironmentSource>>,
    cache: Option<CredentialCache>,
}

impl VpnServiceBuilder {
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentSource>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn cache(mut self, cache: CredentialCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<VpnService, VpnSsoError> {
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(SessionResolver::default()));
        let launcher = self.launcher.unwrap_or_else(|| Arc::new(SystemLauncher));
        let cache = match self.cache {
            Some(cache) => cache,
            None => CredentialCache::from_settings(&self.settings, environment.clone())?,
        };
        let cache = Arc::new(CacheWorker::spawn(cache));

        let (loop_tx, loop_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let state = Arc::new(Mutex::new(ConnectionState::Idle));

        let run_loop = RunLoop {
            settings: self.settings.clone(),
            launcher: launcher.clone(),
            environment: environment.clone(),
            cache: cache.clone(),
            loop_tx: loop_tx.clone(),
            events: events_tx,
            state: ConnectionState::Idle,
            shared_state: state.clone(),
            next_id: 0,
            attempt: None,
            disconnect_waiters: Vec::new(),
            shutting_down: false,
        };
        let thread = thread::Builder::new()
            .name("vpn-connection".into())
            .spawn(move || run_loop.run(loop_rx))
            .map_err(|e| VpnSsoError::spawn("connection loop", &e))?;

        Ok(VpnService {
            commands: loop_tx,
            state,
            events: events_rx,
            settings: self.settings,
            launcher,
            environment,
            cache,
            thread: Some(thread),
        })
    }
}

/// Handle to the connection orchestrator.
///
/// All methods may be called from any thread. Dropping the service
/// disconnects whatever is active and stops the loop.
pub struct VpnService {
    commands: Sender<LoopEvent>,
    state: Arc<Mutex<ConnectionState>>,
    events: Receiver<ServiceEvent>,
    settings: ServiceSettings,
    launcher: Arc<dyn Launcher>,
    environment: Arc<dyn EnvironmentSource>,
    cache: Arc<CacheWorker>,
    thread: Option<JoinHandle<()>>,
}

impl VpnService {
    pub fn builder(settings: ServiceSettings) -> VpnServiceBuilder {
        VpnServiceBuilder {
            settings,
            launcher: None,
            environment: None,
            cache: None,
        }
    }

    /// Starts a connection attempt. Returns once the request has been
    /// accepted; progress is reported through [`events`](Self::events).
    pub fn connect(&self, config: ConnectionConfig) -> Result<(), VpnSsoError> {
        let (reply, rx) = bounded(1);
        self.send(Command::Connect { config, reply })?;
        rx.recv().map_err(|_| loop_gone())?
    }

    /// Tears down the active attempt and waits until the service is idle.
    ///
    /// Never fails: without a running attempt this returns immediately.
    pub fn disconnect(&self) {
        let (reply, rx) = bounded(1);
        if self.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.recv();
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> &Receiver<ServiceEvent> {
        &self.events
    }

    pub fn cache_backend(&self) -> &'static str {
        self.cache.backend_name()
    }

    /// Forgets cached credentials for one gateway, or all of them.
    pub fn clear_cache(&self, target: Option<(&str, Protocol)>) -> Result<(), VpnSsoError> {
        let op = match target {
            Some((gateway, protocol)) => CacheOp::Clear {
                gateway: gateway.to_string(),
                protocol,
            },
            None => CacheOp::ClearAll,
        };
        match self.cache.call(op) {
            CacheReply::Cleared(result) => result,
            other => Err(VpnSsoError::CacheIo(format!("unexpected reply {:?}", other))),
        }
    }

    /// Runs only the SSO helper on the calling thread, bypassing the state
    /// machine and the cache.
    pub fn authenticate(
        &self,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<Credential, VpnSsoError> {
        sso::authenticate(
            self.launcher.as_ref(),
            self.environment.as_ref(),
            &self.settings,
            config,
            cancel,
        )
    }

    fn send(&self, cmd: Command) -> Result<(), VpnSsoError> {
        self.commands
            .send(LoopEvent::Command(cmd))
            .map_err(|_| loop_gone())
    }
}

impl Drop for VpnService {
    fn drop(&mut self) {
        let _ = self.commands.send(LoopEvent::Command(Command::Shutdown));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn loop_gone() -> VpnSsoError {
    VpnSsoError::Internal("connection loop is not running".into())
}
