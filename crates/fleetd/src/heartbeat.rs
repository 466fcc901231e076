//! Periodic liveness check.
//!
//! While a session is connected a `ping` is enqueued every interval. Pongs are
//! not tracked: only a transport error ends the session.

use std::time::Duration;

use fleet_protocol::ClientMessage;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::outbox::Outbox;

/// Enqueues a ping every `period`, starting one period from now.
///
/// Never returns; the session drops the future when it ends.
pub async fn run(period: Duration, outbox: Outbox) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        trace!("Sending heartbeat");
        outbox.send(&ClientMessage::Ping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pings_once_per_interval() {
        let (outbox, mut rx) = Outbox::new(16);
        let handle = tokio::spawn(run(Duration::from_secs(30), outbox));

        // Nothing before the first interval elapses.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let frame = rx.try_recv().unwrap();
        assert_eq!(ClientMessage::decode(&frame).unwrap(), ClientMessage::Ping);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        handle.abort();
    }
}
