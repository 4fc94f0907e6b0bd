//! Single-port TCP connect probe.
//!
//! A probe stays undetermined until the first of its triggers fires; that
//! trigger alone decides the reported state. The probe is one future that
//! resolves exactly once, so a port can never be reported twice.

use log::debug;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;

use crate::types::PortState;

/// The event that determined a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTrigger {
    /// Handshake completed.
    Connected,
    /// Target answered with a reset.
    Refused,
    /// The socket layer reported a connect timeout.
    TimedOut,
    /// The attempt ended with some other error and no definitive signal.
    ClosedWithoutSignal,
    /// The local watchdog expired first and the socket was dropped.
    WatchdogExpired,
}

impl ProbeTrigger {
    /// Map a failed connect to the trigger it represents.
    pub fn from_connect_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ProbeTrigger::Refused,
            io::ErrorKind::TimedOut => ProbeTrigger::TimedOut,
            _ => ProbeTrigger::ClosedWithoutSignal,
        }
    }

    pub fn state(self) -> PortState {
        match self {
            ProbeTrigger::Connected => PortState::Open,
            ProbeTrigger::Refused => PortState::Closed,
            ProbeTrigger::TimedOut
            | ProbeTrigger::ClosedWithoutSignal
            | ProbeTrigger::WatchdogExpired => PortState::Filtered,
        }
    }
}

/// Attempt one TCP connection to `addr:port`, bounded by `watchdog`.
///
/// An established connection is dropped immediately after it is observed.
pub async fn probe_port(addr: &str, port: u16, watchdog: Duration) -> PortState {
    let trigger = watch_connect(watchdog, TcpStream::connect((addr, port))).await;
    let state = trigger.state();
    debug!("PORT {port}: {state} ({trigger:?})");
    state
}

/// Race `connect` against `watchdog` and report which trigger fired first.
///
/// Whatever `connect` produced is dropped before returning.
pub async fn watch_connect<S, F>(watchdog: Duration, connect: F) -> ProbeTrigger
where
    F: Future<Output = io::Result<S>>,
{
    match time::timeout(watchdog, connect).await {
        Ok(Ok(stream)) => {
            drop(stream);
            ProbeTrigger::Connected
        }
        Ok(Err(e)) => {
            let t = ProbeTrigger::from_connect_error(&e);
            if t == ProbeTrigger::ClosedWithoutSignal {
                debug!("connect ended without a definitive signal: {e}");
            }
            t
        }
        Err(_elapsed) => ProbeTrigger::WatchdogExpired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn triggers_map_to_states() {
        assert_eq!(ProbeTrigger::Connected.state(), PortState::Open);
        assert_eq!(ProbeTrigger::Refused.state(), PortState::Closed);
        assert_eq!(ProbeTrigger::TimedOut.state(), PortState::Filtered);
        assert_eq!(ProbeTrigger::ClosedWithoutSignal.state(), PortState::Filtered);
        assert_eq!(ProbeTrigger::WatchdogExpired.state(), PortState::Filtered);
    }

    #[test]
    fn io_errors_classify() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        let other = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(ProbeTrigger::from_connect_error(&refused), ProbeTrigger::Refused);
        assert_eq!(ProbeTrigger::from_connect_error(&timed_out), ProbeTrigger::TimedOut);
        assert_eq!(
            ProbeTrigger::from_connect_error(&other),
            ProbeTrigger::ClosedWithoutSignal
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connect_hits_the_watchdog() {
        let started = time::Instant::now();
        let never = std::future::pending::<io::Result<()>>();
        let trigger = watch_connect(Duration::from_millis(5000), never).await;
        assert_eq!(trigger, ProbeTrigger::WatchdogExpired);
        assert_eq!(trigger.state(), PortState::Filtered);
        assert!(started.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn first_signal_beats_the_watchdog() {
        let refused = async {
            time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        };
        let trigger = watch_connect(Duration::from_millis(5000), refused).await;
        assert_eq!(trigger, ProbeTrigger::Refused);

        let connected = async { Ok::<_, io::Error>(42u8) };
        let trigger = watch_connect(Duration::from_millis(5000), connected).await;
        assert_eq!(trigger, ProbeTrigger::Connected);
    }

    #[tokio::test]
    async fn listening_port_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = probe_port("127.0.0.1", port, Duration::from_secs(2)).await;
        assert_eq!(state, PortState::Open);
    }

    #[tokio::test]
    async fn released_port_is_closed() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let state = probe_port("127.0.0.1", port, Duration::from_secs(2)).await;
        assert_eq!(state, PortState::Closed);
    }
}
