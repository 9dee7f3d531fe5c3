//! Wrapped child process with process group support
//!
//! Bridges own their child through process-wrap's `ChildWrapper` so signals
//! and teardown reach the whole process group, not just the direct child.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use process_wrap::tokio::{ChildWrapper, CommandWrap, ProcessGroup};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};

/// How long an interrupted child gets before escalation to SIGTERM
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// How long a stopping child gets after stdin closes before it is killed
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A spawned agent child plus its taken stdio handles
#[derive(Debug)]
pub struct SpawnedChild {
    pub child: BridgeChild,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Wrapper around `Box<dyn ChildWrapper>` exposing the operations bridges need
#[derive(Debug)]
pub struct BridgeChild {
    inner: Box<dyn ChildWrapper>,
}

impl BridgeChild {
    /// Spawn `command` as a process-group leader with piped stdio
    pub fn spawn(mut command: Command) -> io::Result<SpawnedChild> {
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut wrap = CommandWrap::from(command);
        wrap.wrap(ProcessGroup::leader());
        let mut inner = wrap.spawn()?;

        let stdin = inner
            .stdin()
            .take()
            .ok_or_else(|| io::Error::other("child stdin not piped"))?;
        let stdout = inner
            .stdout()
            .take()
            .ok_or_else(|| io::Error::other("child stdout not piped"))?;
        let stderr = inner
            .stderr()
            .take()
            .ok_or_else(|| io::Error::other("child stderr not piped"))?;

        Ok(SpawnedChild {
            child: Self { inner },
            stdin,
            stdout,
            stderr,
        })
    }

    /// Kill the process group and wait for exit
    pub async fn kill(&mut self) -> io::Result<()> {
        Pin::from(self.inner.kill()).await
    }

    /// Start killing without waiting for exit
    pub fn start_kill(&mut self) -> io::Result<()> {
        self.inner.start_kill()
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        Pin::from(self.inner.wait()).await
    }

    /// Try to wait without blocking; `Some` means the child is reaped
    pub fn try_wait(&mut self) -> io::Result<Option<std::process::ExitStatus>> {
        self.inner.try_wait()
    }

    /// Send a signal to the process group (Unix only)
    #[cfg(unix)]
    pub fn signal(&self, sig: i32) -> io::Result<()> {
        self.inner.signal(sig)
    }

    /// Get the process ID
    pub fn id(&self) -> u32 {
        self.inner.id().unwrap_or(0)
    }

    /// Whether the child is still running (without blocking)
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Interrupt the child: SIGINT, a grace window, then SIGTERM
    ///
    /// Returns once the child exited or both signals have been sent.
    pub async fn interrupt(&mut self, grace: Duration) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        #[cfg(unix)]
        self.signal(libc::SIGINT)?;
        #[cfg(not(unix))]
        self.start_kill()?;

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.try_wait()?.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        #[cfg(unix)]
        self.signal(libc::SIGTERM)?;
        #[cfg(not(unix))]
        self.start_kill()?;
        Ok(())
    }

    /// Tear the child down and reap it
    ///
    /// The caller closes stdin first; this waits out the grace window, kills
    /// whatever is left, and reaps the process.
    pub async fn shutdown(&mut self, grace: Duration) -> io::Result<()> {
        let graceful = tokio::time::timeout(grace, self.wait()).await;
        match graceful {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                self.kill().await?;
            }
        }
        Ok(())
    }
}
