// Fanlight - Fast and light request router for multi-datacenter replicated key-value rings over minimal line protocol, and memory footprint
// Copyright (C) 2021  rumblefrog

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::Deserialize;

use crate::message::Consistency;
use crate::router::NodeState;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(rename(deserialize = "General"))]
    pub general: General,

    #[serde(rename(deserialize = "Consistency"), default)]
    pub consistency: ConsistencySection,

    #[serde(rename(deserialize = "Topology"))]
    pub topology: TopologySection,
}

#[derive(Deserialize, Debug)]
pub struct General {
    /// Client-facing bind address.
    pub bind_address: String,

    /// Peer-facing bind address.
    /// Also this node's identity within the topology peer lists.
    pub peer_bind_address: String,

    /// Address of the local single-node storage backend.
    pub storage_address: String,

    /// Per-request timeout in milliseconds.
    /// The clock starts when a request is queued for an outbound connection.
    pub request_timeout: u64,

    /// Maximum rate over the span of 5 seconds.
    /// Multiple connections on a single IP address are aggregated together.
    pub rate_limit: u32,

    /// When set, delete requests owned by this node are acknowledged
    /// without touching storage.
    #[serde(default)]
    pub admin_mode: bool,

    /// When set, peer frames carry sealed payloads.
    #[serde(default)]
    pub secure: bool,

    /// Upper bound on simultaneously live messages.
    /// Replica clones are skipped once the table is full.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    #[serde(default = "default_node_state")]
    pub node_state: NodeState,

    /// Interval in seconds between stats summary lines.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

#[derive(Deserialize, Debug)]
pub struct ConsistencySection {
    #[serde(default = "default_consistency")]
    pub read: Consistency,

    #[serde(default = "default_consistency")]
    pub write: Consistency,
}

#[derive(Deserialize, Debug)]
pub struct TopologySection {
    /// Name of the datacenter this node lives in.
    pub datacenter: String,

    /// Name of the rack this node lives in.
    pub rack: String,

    /// Optional two-character pair delimiting the routing portion of a key,
    /// e.g. "{}" routes "user:{42}:name" by "42".
    #[serde(default)]
    pub hash_tag: Option<String>,

    pub datacenters: Vec<DatacenterSection>,
}

#[derive(Deserialize, Debug)]
pub struct DatacenterSection {
    pub name: String,

    pub racks: Vec<RackSection>,
}

#[derive(Deserialize, Debug)]
pub struct RackSection {
    pub name: String,

    /// Peer node addresses holding this rack's replica of the keyspace.
    pub peers: Vec<String>,
}

impl Default for ConsistencySection {
    fn default() -> Self {
        Self {
            read: default_consistency(),
            write: default_consistency(),
        }
    }
}

fn default_consistency() -> Consistency {
    Consistency::LocalQuorum
}

fn default_node_state() -> NodeState {
    NodeState::Normal
}

fn default_max_messages() -> usize {
    65536
}

fn default_stats_interval() -> u64 {
    30
}
