//! Handle on one spawned external tool.
//!
//! The child itself is owned by a supervisor thread which reaps it and
//! reports the exit status over a channel, while reader threads forward
//! every output line. The owner of the [`ProcessHandle`] only keeps the pid
//! (for signals) and the stdin pipe.
//!
//! Children normally lead a process group of their own, so signals go to the
//! whole group and reach anything the tool started, a browser for instance.

use crate::error::VpnSsoError;
use crate::launcher::{LaunchSpec, Launcher};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{ChildStdin, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

/// How long output still buffered in the pipes may take to arrive after the
/// child was reaped. Descendants keeping the pipes open are not waited for.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    Sso,
    Tunnel,
}

/// Identifies which process of which connection attempt an event belongs to,
/// so events from a torn-down attempt can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessTag {
    pub attempt: u64,
    pub kind: ProcessKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failed(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitOutcome::Success,
            (Some(code), _) => ExitOutcome::Failed(code),
            (None, Some(sig)) => ExitOutcome::Signaled(sig),
            (None, None) => ExitOutcome::Failed(-1),
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitOutcome::Success
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Success => f.write_str("exit status 0"),
            ExitOutcome::Failed(code) => write!(f, "exit status {}", code),
            ExitOutcome::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(s) => write!(f, "killed by {}", s),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Line {
        tag: ProcessTag,
        stream: Stream,
        line: String,
    },
    /// Sent once, right after the child is reaped and its pending output was
    /// forwarded. Lines written later by descendants that inherited the pipes
    /// may still follow.
    Exited { tag: ProcessTag, outcome: ExitOutcome },
}

impl ProcessEvent {
    pub fn tag(&self) -> ProcessTag {
        match self {
            ProcessEvent::Line { tag, .. } | ProcessEvent::Exited { tag, .. } => *tag,
        }
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    program: String,
    stdin: Option<ChildStdin>,
}

impl ProcessHandle {
    /// Launches `spec` and starts forwarding its output to `events`.
    pub fn spawn<T>(
        launcher: &dyn Launcher,
        spec: &LaunchSpec,
        tag: ProcessTag,
        events: Sender<T>,
    ) -> Result<Self, VpnSsoError>
    where
        T: From<ProcessEvent> + Send + 'static,
    {
        let program = spec.program_name();
        let mut child = launcher
            .launch(spec)
            .map_err(|e| VpnSsoError::spawn(program.clone(), &e))?;

        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        log::debug!("Started {} (pid {})", program, pid);

        let name = format!("{}-{}", program, pid);
        let supervisor = thread::Builder::new().name(name).spawn(move || {
            // Every reader holds a clone; the channel disconnects once all of them hit EOF.
            let (drained_tx, drained_rx) = bounded::<()>(0);
            if let Some(s) = stdout {
                pump(s, tag, Stream::Stdout, events.clone(), drained_tx.clone());
            }
            if let Some(s) = stderr {
                pump(s, tag, Stream::Stderr, events.clone(), drained_tx.clone());
            }
            drop(drained_tx);

            let outcome = match child.wait() {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => {
                    log::warn!("Failed to wait for pid {}: {}", pid, e);
                    ExitOutcome::Failed(-1)
                }
            };

            if let Err(RecvTimeoutError::Timeout) =
                drained_rx.recv_deadline(Instant::now() + OUTPUT_DRAIN)
            {
                log::debug!("pid {} exited but its output is still held open", pid);
            }
            let _ = events.send(ProcessEvent::Exited { tag, outcome }.into());
        });

        if let Err(e) = supervisor {
            let _ = signal::kill(pid, Signal::SIGKILL);
            return Err(VpnSsoError::spawn(program, &e));
        }

        Ok(Self {
            pid,
            program,
            stdin,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Writes `line` plus a newline to the child's stdin and closes it.
    pub fn write_stdin_and_close(&mut self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin not piped")
        })?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    /// Sends `sig` to the child's process group, or to the child alone when
    /// it does not lead one. Failures are logged and reported as `false`.
    pub fn signal(&self, sig: Signal) -> bool {
        let sent = match signal::killpg(self.pid, sig) {
            Err(Errno::ESRCH) => signal::kill(self.pid, sig),
            other => other,
        };
        match sent {
            Ok(()) => {
                log::debug!("Sent {} to {} (pid {})", sig, self.program, self.pid);
                true
            }
            Err(e) => {
                log::debug!("Could not send {} to pid {}: {}", sig, self.pid, e);
                false
            }
        }
    }

    pub fn kill(&self) -> bool {
        self.signal(Signal::SIGKILL)
    }
}

/// Forwards lines from `source` until end-of-file, then drops `drained`.
/// Invalid UTF-8 is replaced rather than ending the stream.
fn pump<R, T>(source: R, tag: ProcessTag, stream: Stream, events: Sender<T>, drained: Sender<()>)
where
    R: Read + Send + 'static,
    T: From<ProcessEvent> + Send + 'static,
{
    thread::spawn(move || {
        let _drained = drained;
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(&['\n', '\r'][..])
                        .to_string();
                    let event = ProcessEvent::Line { tag, stream, line };
                    if events.send(event.into()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Read error on {:?}: {}", stream, e);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::SystemLauncher;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    const TAG: ProcessTag = ProcessTag {
        attempt: 1,
        kind: ProcessKind::Tunnel,
    };

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").args(["-c", script])
    }

    fn collect(rx: &crossbeam_channel::Receiver<ProcessEvent>) -> (Vec<String>, ExitOutcome) {
        let mut lines = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
                ProcessEvent::Line { line, .. } => lines.push(line),
                ProcessEvent::Exited { outcome, .. } => return (lines, outcome),
            }
        }
    }

    #[test]
    fn lines_arrive_before_exit() {
        let (tx, rx) = unbounded();
        let _handle =
            ProcessHandle::spawn(&SystemLauncher, &sh("echo one; echo two >&2; exit 3"), TAG, tx)
                .unwrap();
        let (mut lines, outcome) = collect(&rx);
        lines.sort();
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(outcome, ExitOutcome::Failed(3));
    }

    #[test]
    fn stdin_is_written_then_closed() {
        let (tx, rx) = unbounded();
        let mut spec = sh("read tok; echo \"got $tok\"; cat; echo eof");
        spec.stdin = true;
        let mut handle = ProcessHandle::spawn(&SystemLauncher, &spec, TAG, tx).unwrap();
        handle.write_stdin_and_close("secret").unwrap();
        let (lines, outcome) = collect(&rx);
        assert_eq!(lines, vec!["got secret", "eof"]);
        assert!(outcome.is_success());
    }

    #[test]
    fn kill_reports_signal() {
        let (tx, rx) = unbounded();
        let handle = ProcessHandle::spawn(&SystemLauncher, &sh("exec sleep 30"), TAG, tx).unwrap();
        assert!(handle.kill());
        let (_, outcome) = collect(&rx);
        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGKILL as i32));
        assert!(outcome.to_string().contains("SIGKILL"));
    }

    #[test]
    fn spawn_failure_names_the_program() {
        let (tx, _rx) = unbounded::<ProcessEvent>();
        let err = ProcessHandle::spawn(&SystemLauncher, &LaunchSpec::new("/nope/openconnect"), TAG, tx)
            .unwrap_err();
        assert!(matches!(err, VpnSsoError::Spawn { ref program, .. } if program == "openconnect"));
    }

    #[test]
    fn exit_is_reported_while_a_descendant_holds_the_output() {
        let (tx, rx) = unbounded();
        let started = Instant::now();
        let handle =
            ProcessHandle::spawn(&SystemLauncher, &sh("sleep 30 & echo COOKIE=abc; exit 0"), TAG, tx)
                .unwrap();
        let (lines, outcome) = collect(&rx);
        assert_eq!(lines, vec!["COOKIE=abc"]);
        assert!(outcome.is_success());
        assert!(started.elapsed() < Duration::from_secs(2));
        // The group outlives its leader, so the background sleep is still reachable.
        assert!(handle.kill());
    }

    #[test]
    fn signals_reach_the_whole_group() {
        let (tx, rx) = unbounded();
        let handle =
            ProcessHandle::spawn(&SystemLauncher, &sh("sleep 30 & echo $!; wait"), TAG, tx).unwrap();
        let child = match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            ProcessEvent::Line { line, .. } => line.parse::<u32>().unwrap(),
            other => panic!("unexpected event {:?}", other),
        };
        assert!(handle.kill());
        let (_, outcome) = collect(&rx);
        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGKILL as i32));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_gone(child) {
            assert!(Instant::now() < deadline, "background child {} survived", child);
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Dead or a zombie waiting for its new parent to reap it.
    fn is_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }
}
