use std::collections::{HashMap, VecDeque};

use crate::constants::{MAX_SEND_TRACES, RTT_SAMPLE_QUEUE, SEND_TRACE_DEPTH};
use crate::peer::Protocol;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub packets: u64,
    pub bytes: u64,
}

impl Counter {
    fn add(&mut self, bytes: usize) {
        self.packets += 1;
        self.bytes += bytes as u64;
    }
}

/// Snapshot of the send statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendStats {
    pub udp_sent: Counter,
    pub tcp_sent: Counter,
    pub received: Counter,
    pub rtt_samples: u64,
    /// Tracked requests that were never acknowledged.
    pub lost: u64,
}

#[derive(Debug)]
struct RttSample {
    peerid: String,
    seq: u32,
    time: u64,
}

#[derive(Debug, Default)]
struct Trace {
    sends: VecDeque<(u32, u64, bool)>,
    last: u64,
}

/// Packet counters, RTT sampling and per-destination loss attribution.
#[derive(Debug, Default)]
pub struct SendStat {
    stats: SendStats,
    samples: VecDeque<RttSample>,
    traces: HashMap<String, Trace>,
}

impl SendStat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a datagram. `track` marks first sends of requests, which are
    /// kept for RTT sampling and loss attribution.
    pub fn on_send(
        &mut self,
        peerid: &str,
        seq: u32,
        track: bool,
        protocol: Protocol,
        len: usize,
        now: u64,
    ) {
        match protocol {
            Protocol::Udp => self.stats.udp_sent.add(len),
            Protocol::Tcp => self.stats.tcp_sent.add(len),
        }
        if !track {
            return;
        }

        if self.samples.len() >= RTT_SAMPLE_QUEUE {
            self.samples.pop_front();
        }
        self.samples.push_back(RttSample {
            peerid: peerid.to_string(),
            seq,
            time: now,
        });

        if !self.traces.contains_key(peerid) && self.traces.len() >= MAX_SEND_TRACES {
            self.evict_oldest_trace();
        }
        let trace = self.traces.entry(peerid.to_string()).or_default();
        if trace.sends.len() >= SEND_TRACE_DEPTH {
            if let Some((_, _, acked)) = trace.sends.pop_front() {
                if !acked {
                    self.stats.lost += 1;
                }
            }
        }
        trace.sends.push_back((seq, now, false));
        trace.last = now;
    }

    /// Records an inbound datagram acknowledging `ack_seq`. Returns the RTT
    /// in milliseconds if the acknowledged request was sampled.
    pub fn on_recv(&mut self, peerid: &str, ack_seq: u32, len: usize, now: u64) -> Option<u32> {
        self.stats.received.add(len);

        if let Some(trace) = self.traces.get_mut(peerid) {
            for entry in trace.sends.iter_mut().filter(|(s, _, _)| *s == ack_seq) {
                entry.2 = true;
            }
        }

        let pos = self
            .samples
            .iter()
            .position(|s| s.seq == ack_seq && s.peerid == peerid)?;
        let sample = self.samples.remove(pos)?;
        self.stats.rtt_samples += 1;
        Some(now.saturating_sub(sample.time).min(u32::MAX as u64) as u32)
    }

    /// Share of traced requests to `peerid` older than `grace` ms that were
    /// never acknowledged.
    pub fn packet_loss(&self, peerid: &str, now: u64, grace: u64) -> Option<f32> {
        let trace = self.traces.get(peerid)?;
        let settled: Vec<_> = trace
            .sends
            .iter()
            .filter(|(_, t, _)| now.saturating_sub(*t) >= grace)
            .collect();
        if settled.is_empty() {
            return None;
        }
        let lost = settled.iter().filter(|(_, _, acked)| !acked).count();
        Some(lost as f32 / settled.len() as f32)
    }

    /// Forgets traces of destinations not sent to for `stale` ms.
    pub fn prune(&mut self, now: u64, stale: u64) {
        self.traces
            .retain(|_, t| now.saturating_sub(t.last) <= stale);
        while self
            .samples
            .front()
            .is_some_and(|s| now.saturating_sub(s.time) > stale)
        {
            self.samples.pop_front();
        }
    }

    pub fn snapshot(&self) -> SendStats {
        self.stats.clone()
    }

    fn evict_oldest_trace(&mut self) {
        let oldest = self
            .traces
            .iter()
            .min_by_key(|(_, t)| t.last)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.traces.remove(&id);
        }
    }
}
