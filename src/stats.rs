// Fanlight - Fast and light request router for multi-datacenter replicated key-value rings over minimal line protocol, and memory footprint
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

/// Fire-and-forget counters.
///
/// Everything here is written on the event-loop task and read only by the
/// periodic summary, so plain integers suffice.
#[derive(Debug, Default)]
pub struct Stats {
    pub client_connections: u64,
    pub client_eof: u64,
    pub client_err: u64,
    pub client_dropped_requests: u64,
    pub client_read_requests: u64,
    pub client_write_requests: u64,

    /// Requests forwarded to storage or peers, split by direction.
    pub read_requests: u64,
    pub write_requests: u64,

    pub peer_responses: u64,
    pub peer_response_bytes: u64,

    /// Queue gauges across all outbound connections.
    pub in_queue: u64,
    pub in_queue_bytes: u64,
    pub out_queue: u64,
    pub out_queue_bytes: u64,

    pub quorum_mismatches: u64,
    pub request_timeouts: u64,

    latency: Histogram,
}

impl Stats {
    pub fn add_latency(&mut self, micros: u64) {
        self.latency.add(micros);
    }

    pub fn summary(&self) -> String {
        format!(
            "(clients = {}/{} eof/{} err) (client reqs = {}r/{}w, {} dropped) (fanned = {}r/{}w) (peer rsps = {}, {} bytes) (inq = {}/{} bytes) (outq = {}/{} bytes) (timeouts = {}) (mismatches = {}) (latency = {})",
            self.client_connections,
            self.client_eof,
            self.client_err,
            self.client_read_requests,
            self.client_write_requests,
            self.client_dropped_requests,
            self.read_requests,
            self.write_requests,
            self.peer_responses,
            self.peer_response_bytes,
            self.in_queue,
            self.in_queue_bytes,
            self.out_queue,
            self.out_queue_bytes,
            self.request_timeouts,
            self.quorum_mismatches,
            self.latency.summary(),
        )
    }
}

/// Client latency histogram over power-of-two microsecond buckets.
#[derive(Debug)]
struct Histogram {
    buckets: [u64; 28],
    count: u64,
    sum: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: [0; 28],
            count: 0,
            sum: 0,
        }
    }
}

impl Histogram {
    fn add(&mut self, micros: u64) {
        let idx = (64 - micros.max(1).leading_zeros() as usize - 1).min(27);
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum += micros;
    }

    fn summary(&self) -> String {
        if self.count == 0 {
            return "n/a".to_string();
        }

        format!("{} reqs, {}us avg", self.count, self.sum / self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_magnitude() {
        let mut h = Histogram::default();

        h.add(0);
        h.add(1);
        h.add(3);
        h.add(1024);

        assert_eq!(h.buckets[0], 2);
        assert_eq!(h.buckets[1], 1);
        assert_eq!(h.buckets[10], 1);
        assert_eq!(h.count, 4);
    }
}
