//! Timer-driven data generator.
//!
//! Fills a scanner's response payload with fresh data once per block and
//! wakes its state machine, which then enables reception for one
//! acknowledgement round. Tests and hosts with real sensors can skip the
//! timer and drive the [`DataFeed`](crate::scanner::DataFeed) directly.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::scanner::DataFeed;

/// Periodic generator of response payloads.
///
/// Dropping the generator stops the timer; the feed it drives stays usable.
pub struct DataGenerator {
    task: JoinHandle<()>,
}

impl DataGenerator {
    /// Starts generating into `feed` every `period`.
    ///
    /// The usual period is [`Config::block_time`](crate::Config::block_time).
    /// The first payload is generated one full period after the start.
    pub fn start(feed: DataFeed, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of an interval fires immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                log::debug!("data generated");
                feed.generate();
            }
        });
        Self { task }
    }
}

impl Drop for DataGenerator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        counter::MemoryStore,
        crypto::{scanner_key_id, SoftKeyStore},
        loopback::LoopbackRadio,
        Address, Config, DeviceId, Scanner,
    };

    fn scanner() -> Scanner {
        let keys = Arc::new(SoftKeyStore::new());
        keys.generate_key(scanner_key_id(DeviceId(1))).unwrap();
        let air = LoopbackRadio::new(Address::new([0xc0, 0, 0, 0, 0, 1]), 1);
        Scanner::new(
            Config::default(),
            DeviceId(1),
            Arc::new(air.scanner_port()),
            keys,
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn generator_fires_once_per_period() {
        let scanner = scanner();
        let feed = scanner.data_feed();
        let _generator = DataGenerator::start(scanner.data_feed(), Duration::from_secs(10));

        // Nothing before the first period has elapsed.
        tokio::time::advance(Duration::from_secs(9)).await;
        tokio::task::yield_now().await;
        assert!(!feed.take_generated());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(feed.take_generated());
        assert!(!feed.take_generated());

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(feed.take_generated());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_generator_stops_it() {
        let scanner = scanner();
        let feed = scanner.data_feed();
        let generator = DataGenerator::start(scanner.data_feed(), Duration::from_secs(10));
        drop(generator);
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(!feed.take_generated());
    }
}
