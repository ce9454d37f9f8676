use core::fmt;

use heapless::Vec;

use crate::config::TIMER_SLOT_COUNT;
use crate::time::Instant;

/// Error returned when no timer slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerError;

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer queue full")
    }
}

impl core::error::Error for TimerError {}

/// What a timer fires for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An IPv4 reassembly queue ran out of time. The token is the queue slot.
    Ipv4Reassembly,
}

/// How [`TimerQueue::unset`] selects the timers to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// Only timers whose event, token and extra value all match.
    Exact,
    /// Every timer of the event.
    All,
}

/// A fired timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub event: Event,
    pub token: u32,
    pub extra: u32,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    event: Event,
    token: u32,
    extra: u32,
    expires_at: Instant,
}

/// A bounded set of one-shot timers.
#[derive(Debug, Default)]
pub struct TimerQueue {
    timers: Vec<Timer, TIMER_SLOT_COUNT>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue { timers: Vec::new() }
    }

    /// Arm a timer that fires at `expires_at`.
    pub fn set(
        &mut self,
        event: Event,
        token: u32,
        expires_at: Instant,
        extra: u32,
    ) -> Result<(), TimerError> {
        self.timers
            .push(Timer {
                event,
                token,
                extra,
                expires_at,
            })
            .map_err(|_| TimerError)
    }

    /// Cancel timers, returning how many were removed.
    pub fn unset(&mut self, event: Event, mode: Match, token: u32, extra: u32) -> usize {
        let before = self.timers.len();
        self.timers.retain(|timer| {
            let matched = timer.event == event
                && match mode {
                    Match::All => true,
                    Match::Exact => timer.token == token && timer.extra == extra,
                };
            !matched
        });
        before - self.timers.len()
    }

    /// Return the earliest expiry time of all armed timers.
    pub fn poll_at(&self) -> Option<Instant> {
        self.timers.iter().map(|timer| timer.expires_at).min()
    }

    /// Remove and return one timer that has expired by `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Expired> {
        let (position, _) = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, timer)| timer.expires_at <= now)
            .min_by_key(|(_, timer)| timer.expires_at)?;
        let timer = self.timers.swap_remove(position);
        Some(Expired {
            event: timer.event,
            token: timer.token,
            extra: timer.extra,
        })
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pop_expired_in_order() {
        let mut timers = TimerQueue::new();
        timers
            .set(Event::Ipv4Reassembly, 2, Instant::from_millis(200), 0)
            .unwrap();
        timers
            .set(Event::Ipv4Reassembly, 1, Instant::from_millis(100), 0)
            .unwrap();
        assert_eq!(timers.poll_at(), Some(Instant::from_millis(100)));
        assert_eq!(timers.pop_expired(Instant::from_millis(50)), None);

        let now = Instant::from_millis(300);
        assert_eq!(timers.pop_expired(now).map(|e| e.token), Some(1));
        assert_eq!(timers.pop_expired(now).map(|e| e.token), Some(2));
        assert_eq!(timers.pop_expired(now), None);
    }

    #[test]
    fn test_unset() {
        let mut timers = TimerQueue::new();
        for token in 0..3 {
            timers
                .set(Event::Ipv4Reassembly, token, Instant::from_millis(10), 0)
                .unwrap();
        }
        assert_eq!(timers.unset(Event::Ipv4Reassembly, Match::Exact, 1, 0), 1);
        assert_eq!(timers.unset(Event::Ipv4Reassembly, Match::Exact, 1, 0), 0);
        assert_eq!(timers.unset(Event::Ipv4Reassembly, Match::All, 0, 0), 2);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_full() {
        let mut timers = TimerQueue::new();
        for token in 0..TIMER_SLOT_COUNT as u32 {
            timers
                .set(Event::Ipv4Reassembly, token, Instant::ZERO, 0)
                .unwrap();
        }
        assert_eq!(
            timers.set(Event::Ipv4Reassembly, 99, Instant::ZERO, 0),
            Err(TimerError)
        );
    }
}
