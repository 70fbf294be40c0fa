//! Puffer für Signale, die vor dem `joined_voice` eines Teilnehmers eintreffen
//!
//! Einträge leben höchstens `ttl`; insgesamt werden nicht mehr als `capacity`
//! Payloads gehalten.

use crate::transport::SignalPayload;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

type PeerKey = (String, String);

#[derive(Debug)]
pub(crate) struct EarlySignalBuffer {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<PeerKey, VecDeque<(Instant, SignalPayload)>>,
}

impl EarlySignalBuffer {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    /// Puffert einen Payload; `false` wenn der Puffer voll ist
    pub fn push(&mut self, channel_id: &str, user_id: &str, payload: SignalPayload, now: Instant) -> bool {
        self.purge(now);
        if self.len() >= self.capacity {
            return false;
        }
        self.entries
            .entry((channel_id.to_string(), user_id.to_string()))
            .or_default()
            .push_back((now, payload));
        true
    }

    /// Entnimmt alle noch gültigen Payloads in Eingangsreihenfolge
    pub fn take(&mut self, channel_id: &str, user_id: &str, now: Instant) -> Vec<SignalPayload> {
        let key = (channel_id.to_string(), user_id.to_string());
        let ttl = self.ttl;
        self.entries
            .remove(&key)
            .map(|queue| {
                queue
                    .into_iter()
                    .filter(|(at, _)| now.duration_since(*at) <= ttl)
                    .map(|(_, payload)| payload)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Verwirft abgelaufene Payloads; gibt deren Anzahl zurück
    pub fn purge(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut dropped = 0;
        self.entries.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|(at, _)| now.duration_since(*at) <= ttl);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }

    pub fn clear_channel(&mut self, channel_id: &str) -> usize {
        let mut dropped = 0;
        self.entries.retain(|(channel, _), queue| {
            if channel == channel_id {
                dropped += queue.len();
                false
            } else {
                true
            }
        });
        dropped
    }
}
