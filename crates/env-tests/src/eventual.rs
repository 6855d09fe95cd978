//! Eventual consistency helpers for checks against real containers.
//!
//! Readiness only says a service accepts connections. Some follow-up
//! effects (a stub becoming visible, a published port closing after
//! teardown) settle a little later, so tests poll for them with backoff.

use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

/// What a test is waiting for, each with its own deadline.
#[derive(Debug, Clone, Copy)]
pub enum Settle {
    /// A stub registered on the HTTP mock answers requests.
    MockRegistration,

    /// A published host port stops accepting connections after teardown.
    PortRelease,

    /// Broker metadata reflects a just-started broker.
    BrokerMetadata,
}

impl Settle {
    pub fn timeout(&self) -> Duration {
        match self {
            Settle::MockRegistration => Duration::from_secs(5),
            Settle::PortRelease => Duration::from_secs(15),
            Settle::BrokerMetadata => Duration::from_secs(30),
        }
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_millis(250)
    }
}

/// Poll `condition` with doubling delays until it holds or `settle` times out.
pub async fn wait_until<F, Fut>(settle: Settle, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let timeout = settle.timeout();
    let mut delay = settle.initial_delay();
    let start = Instant::now();

    loop {
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!("{settle:?} not observed within {timeout:?}"));
        }

        sleep(delay.min(timeout.saturating_sub(elapsed))).await;
        delay *= 2;
    }
}

/// True while something accepts TCP connections on `address`.
pub async fn port_open(address: &str) -> bool {
    TcpStream::connect(address).await.is_ok()
}
