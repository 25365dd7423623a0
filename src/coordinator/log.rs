//! Time-windowed, append-only log of multicasts, used to replay messages a
//! participant missed while disconnected.

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// One multicast as recorded in the coordinator's log. Never mutated after
/// insertion.
#[derive(Debug, Clone)]
pub struct LoggedMessage {
    pub text: String,
    pub timestamp: SystemTime,
    pub origin_id: u32,
}

/// An append-only log of [`LoggedMessage`]s, parameterized by a retention
/// `threshold`: on reconnect, only entries no older than `threshold` (at
/// the moment of reconnect) are eligible for replay.
pub struct MessageLog {
    threshold: Duration,
    entries: Mutex<Vec<LoggedMessage>>,
}

impl MessageLog {
    pub fn new(threshold: Duration) -> Self {
        MessageLog {
            threshold,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends a new entry with `timestamp` (the moment of first successful
    /// send, per the caller).
    pub fn append(&self, origin_id: u32, text: String, timestamp: SystemTime) {
        self.entries.lock().push(LoggedMessage {
            text,
            timestamp,
            origin_id,
        });
    }

    /// Returns, in insertion order, every entry strictly newer than
    /// `disconnect_time` and no older than `threshold` relative to `now`.
    /// `now` is taken explicitly (rather than read from the clock here) so
    /// replay windowing is exercisable with fixed, reproducible instants in
    /// tests.
    pub fn replay(&self, disconnect_time: SystemTime, now: SystemTime) -> Vec<LoggedMessage> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.timestamp > disconnect_time)
            .filter(|entry| {
                now.duration_since(entry.timestamp)
                    .map(|age| age <= self.threshold)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Convenience wrapper over [`replay`](Self::replay) using the current
    /// wall-clock time.
    pub fn replay_since(&self, disconnect_time: SystemTime) -> Vec<LoggedMessage> {
        self.replay(disconnect_time, SystemTime::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn replay_window_matches_the_canonical_scenario() {
        // threshold=10s; disconnect at t=0; broadcasts at t=1,3,12;
        // reconnect at t=13. Only t=3 and t=12 should replay: t=1 is
        // 13-1=12s old at reconnect, past the 10s threshold.
        let log = MessageLog::new(Duration::from_secs(10));
        let t0 = SystemTime::now();
        let at = |secs: u64| t0 + Duration::from_secs(secs);

        log.append(1, "at t=1".to_owned(), at(1));
        log.append(1, "at t=3".to_owned(), at(3));
        log.append(1, "at t=12".to_owned(), at(12));

        let replay = log.replay(t0, at(13));
        let texts: Vec<_> = replay.iter().map(|m| m.text.clone()).collect();
        assert_eq!(texts, vec!["at t=3", "at t=12"]);
    }

    #[test]
    fn replay_preserves_insertion_order() {
        let log = MessageLog::new(Duration::from_secs(60));
        let base = SystemTime::now();
        for i in 0..5 {
            log.append(1, format!("msg{}", i), base + Duration::from_millis(i));
        }
        let replay = log.replay_since(base - Duration::from_secs(1));
        let texts: Vec<_> = replay.iter().map(|m| m.text.clone()).collect();
        assert_eq!(texts, vec!["msg0", "msg1", "msg2", "msg3", "msg4"]);
    }
}
