// Process supervision for `exec`
//
// This module handles running the target command:
// - Environment construction (secrets over the inherited environment)
// - Spawning with inherited standard streams
// - Forwarding the first SIGINT / SIGTERM to the child
// - Mirroring the child's exit status

use crate::envfile::EnvEntry;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Termination-class signals forwarded to the child.
///
/// SIGKILL is not listed: it cannot be caught, so it can never be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl TerminationSignal {
    /// Raw signal number.
    pub fn as_raw(&self) -> i32 {
        #[cfg(unix)]
        {
            match self {
                TerminationSignal::Interrupt => libc::SIGINT,
                TerminationSignal::Terminate => libc::SIGTERM,
            }
        }
        #[cfg(not(unix))]
        {
            match self {
                TerminationSignal::Interrupt => 2,
                TerminationSignal::Terminate => 15,
            }
        }
    }
}

/// How the child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code
    Code(i32),
    /// Killed by a signal
    Signaled(i32),
}

impl ExitOutcome {
    /// Exit code the supervisor should terminate with.
    ///
    /// Death by signal `n` maps to `128 + n`, as shells report it.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Code(code) => *code,
            ExitOutcome::Signaled(signal) => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signaled(signal);
            }
        }

        ExitOutcome::Code(1)
    }
}

/// Overlay `secrets` on the `ambient` environment.
///
/// Secrets win over inherited variables with the same name. Among secrets, the last
/// occurrence of a name wins.
pub fn build_environment<I>(ambient: I, secrets: &[EnvEntry]) -> BTreeMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut environment: BTreeMap<OsString, OsString> = ambient.into_iter().collect();
    for entry in secrets {
        environment.insert(
            OsString::from(&entry.name),
            OsString::from(&entry.value),
        );
    }
    environment
}

/// A command that has not been started yet.
#[derive(Debug)]
pub struct Supervisor {
    command: String,
    args: Vec<String>,
    environment: BTreeMap<OsString, OsString>,
}

impl Supervisor {
    /// Prepare `argv[0]` with the remaining arguments and the given environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `argv` is empty.
    pub fn new(argv: &[String], environment: BTreeMap<OsString, OsString>) -> Result<Self> {
        let (command, args) = argv
            .split_first()
            .ok_or_else(|| Error::config("No command given to exec"))?;

        Ok(Self {
            command: command.clone(),
            args: args.to_vec(),
            environment,
        })
    }

    /// Spawn the child with inherited standard streams.
    ///
    /// Termination signals are caught from the moment the child is running. A spawn
    /// failure leaves signal dispositions untouched.
    pub fn spawn(self) -> Result<RunningChild> {
        let program = resolve_command(&self.command)?;
        debug!("Starting {} ({})", self.command, program.display());

        let child = Command::new(&program)
            .args(&self.args)
            .env_clear()
            .envs(&self.environment)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let listener = Listener::install(&self.command);

        Ok(RunningChild {
            command: self.command,
            child,
            listener,
        })
    }

    /// Spawn the child, forward termination signals and wait for it.
    pub async fn run(self) -> Result<ExitOutcome> {
        self.spawn()?.wait().await
    }
}

fn resolve_command(command: &str) -> Result<PathBuf> {
    which::which(command).map_err(|_| Error::CommandNotFound {
        command: command.to_string(),
    })
}

/// Receiving end of the termination-signal listener task.
#[derive(Debug)]
struct Listener {
    signals: oneshot::Receiver<TerminationSignal>,
    task: JoinHandle<()>,
}

impl Listener {
    fn install(command: &str) -> Option<Self> {
        let (tx, signals) = oneshot::channel();
        match termination_listener(tx) {
            Ok(task) => Some(Self {
                signals,
                task: tokio::spawn(task),
            }),
            Err(e) => {
                warn!("Signals will not be forwarded to {}: {}", command, e);
                None
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A started child process.
#[derive(Debug)]
pub struct RunningChild {
    command: String,
    child: Child,
    listener: Option<Listener>,
}

impl RunningChild {
    /// OS process id, while the child has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child, forwarding the first termination signal received.
    ///
    /// The listener hands over at most one signal. If the child exits first the
    /// listener is dropped without effect.
    pub async fn wait(mut self) -> Result<ExitOutcome> {
        let mut listener = self.listener.take();
        let rx = async {
            match listener.as_mut() {
                Some(listener) => (&mut listener.signals).await,
                None => std::future::pending().await,
            }
        };

        let status = tokio::select! {
            status = self.child.wait() => status,
            received = rx => {
                match received {
                    Ok(signal) => {
                        if let Err(e) = self.forward(signal) {
                            warn!("{}", e);
                        }
                    }
                    Err(_) => debug!("Signal listener stopped without a signal"),
                }
                self.child.wait().await
            }
        };
        drop(listener);

        let outcome = ExitOutcome::from(status?);
        debug!("{} exited: {:?}", self.command, outcome);
        Ok(outcome)
    }

    /// Deliver `signal` to the child.
    ///
    /// A child that has already exited is not an error.
    pub fn forward(&mut self, signal: TerminationSignal) -> Result<()> {
        let Some(pid) = self.child.id() else {
            debug!("Child already exited, dropping signal {:?}", signal);
            return Ok(());
        };
        debug!("Forwarding {:?} to pid {}", signal, pid);

        #[cfg(unix)]
        {
            // SAFETY: kill(2) has no memory-safety preconditions
            let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
            if rc != 0 {
                let source = std::io::Error::last_os_error();
                if source.raw_os_error() == Some(libc::ESRCH) {
                    return Ok(());
                }
                return Err(Error::Signal {
                    signal: signal.as_raw(),
                    pid,
                    source,
                });
            }
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill().map_err(|source| Error::Signal {
                signal: signal.as_raw(),
                pid,
                source,
            })?;
        }

        Ok(())
    }
}

/// Install the signal handlers now and return the task that waits on them.
///
/// Registration happens before the task is spawned, so a signal arriving before
/// the task first runs is not lost.
#[cfg(unix)]
fn termination_listener(
    tx: oneshot::Sender<TerminationSignal>,
) -> Result<impl Future<Output = ()> + Send + 'static> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        let received = tokio::select! {
            Some(()) = interrupt.recv() => TerminationSignal::Interrupt,
            Some(()) = terminate.recv() => TerminationSignal::Terminate,
            else => return,
        };
        if tx.send(received).is_err() {
            warn!("Child already reaped, {:?} not forwarded", received);
        }
    })
}

#[cfg(not(unix))]
fn termination_listener(
    tx: oneshot::Sender<TerminationSignal>,
) -> Result<impl Future<Output = ()> + Send + 'static> {
    Ok(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(TerminationSignal::Interrupt);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_secrets_override_ambient() {
        let ambient = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from("API_KEY"), OsString::from("ambient")),
        ];
        let secrets = vec![
            EnvEntry::new("API_KEY", "first"),
            EnvEntry::new("DB", "postgres"),
            EnvEntry::new("API_KEY", "last"),
        ];

        let env = build_environment(ambient, &secrets);

        assert_eq!(env.get(&OsString::from("API_KEY")), Some(&OsString::from("last")));
        assert_eq!(env.get(&OsString::from("DB")), Some(&OsString::from("postgres")));
        assert_eq!(env.get(&OsString::from("PATH")), Some(&OsString::from("/usr/bin")));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_exit_outcome_codes() {
        assert_eq!(ExitOutcome::Code(0).exit_code(), 0);
        assert!(ExitOutcome::Code(0).success());
        assert_eq!(ExitOutcome::Code(7).exit_code(), 7);
        assert!(!ExitOutcome::Code(7).success());
        assert_eq!(ExitOutcome::Signaled(15).exit_code(), 143);
        assert!(!ExitOutcome::Signaled(15).success());
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        let err = Supervisor::new(&[], BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let supervisor = Supervisor::new(
            &["definitely-not-a-command-xyz".to_string()],
            build_environment(std::env::vars_os(), &[]),
        )
        .unwrap();

        let err = supervisor.spawn().unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_mirrored() {
        let supervisor =
            Supervisor::new(&sh("exit 7"), build_environment(std::env::vars_os(), &[])).unwrap();

        assert_eq!(supervisor.run().await.unwrap(), ExitOutcome::Code(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_sees_secrets() {
        let env = build_environment(
            std::env::vars_os(),
            &[EnvEntry::new("SECURE_TEST_VALUE", "a=b c")],
        );
        let supervisor =
            Supervisor::new(&sh(r#"test "$SECURE_TEST_VALUE" = "a=b c""#), env).unwrap();

        assert_eq!(supervisor.run().await.unwrap(), ExitOutcome::Code(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_death_by_signal_is_reported() {
        let supervisor = Supervisor::new(
            &sh("kill -TERM $$"),
            build_environment(std::env::vars_os(), &[]),
        )
        .unwrap();

        let outcome = supervisor.run().await.unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(libc::SIGTERM));
        assert_eq!(outcome.exit_code(), 128 + libc::SIGTERM);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forward_delivers_signal() {
        let supervisor =
            Supervisor::new(&sh("sleep 30"), build_environment(std::env::vars_os(), &[])).unwrap();
        let mut running = supervisor.spawn().unwrap();
        assert!(running.id().is_some());

        running.forward(TerminationSignal::Terminate).unwrap();
        let status = running.child.wait().await.unwrap();

        assert_eq!(ExitOutcome::from(status), ExitOutcome::Signaled(libc::SIGTERM));
    }
}
