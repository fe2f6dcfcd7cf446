//! A termination signal that arrives as soon as the child has started must be
//! forwarded, not take down the supervisor.
//!
//! Kept as the only test in its binary: the signal is raised on the test process.

#![cfg(unix)]

use secure_environment::supervisor::{build_environment, ExitOutcome, Supervisor};

#[tokio::test]
async fn test_signal_right_after_spawn_is_forwarded() {
    let argv = vec!["sleep".to_string(), "30".to_string()];
    let supervisor = Supervisor::new(&argv, build_environment(std::env::vars_os(), &[])).unwrap();

    let running = supervisor.spawn().unwrap();
    // Before wait(): the handlers are already installed, so the process survives
    let rc = unsafe { libc::raise(libc::SIGTERM) };
    assert_eq!(rc, 0);

    let outcome = running.wait().await.unwrap();
    assert_eq!(outcome, ExitOutcome::Signaled(libc::SIGTERM));
    assert_eq!(outcome.exit_code(), 143);
}
