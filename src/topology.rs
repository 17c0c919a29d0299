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

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::net::SocketAddr;

use rand::Rng;

use crate::config::TopologySection;
use crate::error::{FanlightError, FanlightResult};
use crate::message::MAX_REPLICAS_PER_DC;

/// A node holding a share of one rack's keyspace replica.
#[derive(Debug)]
pub struct PeerNode {
    pub addr: SocketAddr,

    /// Whether this peer is the node we are running on.
    pub local: bool,
}

/// A fault-isolation group holding one full replica of the keyspace.
#[derive(Debug)]
pub struct Rack {
    pub name: String,

    peers: Vec<PeerNode>,
}

#[derive(Debug)]
pub struct Datacenter {
    pub name: String,

    /// Whether this is the datacenter the node lives in.
    pub local: bool,

    pub racks: Vec<Rack>,
}

/// The datacenter -> rack -> peer tree plus this node's own identity.
///
/// Membership is static for the life of the process; the subsystem that
/// would keep the peer lists fresh lives outside the router.
#[derive(Debug)]
pub struct Topology {
    datacenters: Vec<Datacenter>,

    local_rack: String,

    /// Optional key delimiter pair, e.g. `{` and `}`.
    hash_tag: Option<(u8, u8)>,
}

impl Topology {
    pub fn from_config(section: &TopologySection, local_addr: SocketAddr) -> FanlightResult<Self> {
        let hash_tag = match &section.hash_tag {
            None => None,
            Some(tag) => {
                let b = tag.as_bytes();

                if b.len() != 2 {
                    return Err(FanlightError::InvalidHashTag);
                }

                Some((b[0], b[1]))
            }
        };

        let mut datacenters = Vec::with_capacity(section.datacenters.len());

        for dc in &section.datacenters {
            let mut racks = Vec::with_capacity(dc.racks.len());

            for rack in &dc.racks {
                let mut peers = Vec::with_capacity(rack.peers.len());

                for peer in &rack.peers {
                    let addr: SocketAddr = peer.parse()?;

                    peers.push(PeerNode {
                        addr,
                        local: addr == local_addr,
                    });
                }

                racks.push(Rack {
                    name: rack.name.clone(),
                    peers,
                });
            }

            datacenters.push(Datacenter {
                name: dc.name.clone(),
                local: dc.name == section.datacenter,
                racks,
            });
        }

        // The read-quorum selection rule is only written for this bound.
        let local_rack_cnt = datacenters
            .iter()
            .filter(|dc| dc.local)
            .map(|dc| dc.racks.len())
            .max()
            .unwrap_or(0);

        if local_rack_cnt > MAX_REPLICAS_PER_DC {
            return Err(FanlightError::TooManyRacks(MAX_REPLICAS_PER_DC));
        }

        let local_site_known = datacenters
            .iter()
            .filter(|dc| dc.local)
            .flat_map(|dc| dc.racks.iter())
            .any(|rack| rack.name == section.rack);

        if !local_site_known {
            return Err(FanlightError::UnknownLocalSite {
                datacenter: section.datacenter.clone(),
                rack: section.rack.clone(),
            });
        }

        Ok(Self {
            datacenters,
            local_rack: section.rack.clone(),
            hash_tag,
        })
    }

    pub fn datacenters(&self) -> &[Datacenter] {
        &self.datacenters
    }

    pub fn local_dc(&self) -> &Datacenter {
        // Validated at construction.
        self.datacenters.iter().find(|dc| dc.local).unwrap()
    }

    pub fn local_rack(&self) -> &Rack {
        self.local_dc()
            .racks
            .iter()
            .find(|rack| rack.name == self.local_rack)
            .unwrap()
    }

    pub fn is_local_rack(&self, dc: &Datacenter, rack: &Rack) -> bool {
        dc.local && rack.name == self.local_rack
    }

    pub fn local_rack_count(&self) -> usize {
        self.local_dc().racks.len()
    }

    /// The portion of a key requests are routed by.
    ///
    /// With a hash tag configured, the span between the first open and the
    /// following close byte; an absent or empty tag span falls back to the
    /// whole key.
    pub fn routing_key<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        if let Some((open, close)) = self.hash_tag {
            if let Some(start) = key.iter().position(|&b| b == open) {
                if let Some(len) = key[start + 1..].iter().position(|&b| b == close) {
                    if len > 0 {
                        return &key[start + 1..start + 1 + len];
                    }
                }
            }
        }

        key
    }

    /// The peer within a rack owning the given routing key.
    pub fn peer_for_key<'a>(&self, rack: &'a Rack, key: &[u8]) -> Option<&'a PeerNode> {
        if rack.peers.is_empty() {
            return None;
        }

        let mut hasher = DefaultHasher::new();
        hasher.write(key);

        let idx = (hasher.finish() % rack.peers.len() as u64) as usize;

        Some(&rack.peers[idx])
    }

    /// One rack of a remote datacenter, uniformly at random per request.
    pub fn random_rack<'a>(&self, dc: &'a Datacenter) -> Option<&'a Rack> {
        if dc.racks.is_empty() {
            return None;
        }

        let idx = rand::thread_rng().gen_range(0..dc.racks.len());

        Some(&dc.racks[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{DatacenterSection, RackSection};

    fn section() -> TopologySection {
        TopologySection {
            datacenter: "east".to_string(),
            rack: "e1".to_string(),
            hash_tag: Some("{}".to_string()),
            datacenters: vec![
                DatacenterSection {
                    name: "east".to_string(),
                    racks: vec![
                        RackSection {
                            name: "e1".to_string(),
                            peers: vec!["127.0.0.1:8101".to_string()],
                        },
                        RackSection {
                            name: "e2".to_string(),
                            peers: vec!["127.0.0.2:8101".to_string()],
                        },
                    ],
                },
                DatacenterSection {
                    name: "west".to_string(),
                    racks: vec![RackSection {
                        name: "w1".to_string(),
                        peers: vec!["127.0.1.1:8101".to_string()],
                    }],
                },
            ],
        }
    }

    #[test]
    fn marks_local_peer_and_sites() {
        let topo = Topology::from_config(&section(), "127.0.0.1:8101".parse().unwrap()).unwrap();

        assert_eq!(topo.local_dc().name, "east");
        assert_eq!(topo.local_rack().name, "e1");
        assert_eq!(topo.local_rack_count(), 2);

        let peer = topo.peer_for_key(topo.local_rack(), b"k").unwrap();
        assert!(peer.local);

        let west = topo.datacenters().iter().find(|dc| !dc.local).unwrap();
        let rack = topo.random_rack(west).unwrap();
        assert_eq!(rack.name, "w1");
        assert!(!topo.peer_for_key(rack, b"k").unwrap().local);
    }

    #[test]
    fn rejects_unknown_local_site() {
        let mut s = section();
        s.rack = "nope".to_string();

        assert!(Topology::from_config(&s, "127.0.0.1:8101".parse().unwrap()).is_err());
    }

    #[test]
    fn hash_tag_extraction() {
        let topo = Topology::from_config(&section(), "127.0.0.1:8101".parse().unwrap()).unwrap();

        assert_eq!(topo.routing_key(b"user:{42}:name"), b"42");
        assert_eq!(topo.routing_key(b"user:42"), b"user:42");
        assert_eq!(topo.routing_key(b"user:{}:name"), b"user:{}:name");
        assert_eq!(topo.routing_key(b"user:{42:name"), b"user:{42:name");
    }

    #[test]
    fn key_to_peer_is_stable() {
        let topo = Topology::from_config(&section(), "127.0.0.1:8101".parse().unwrap()).unwrap();
        let rack = topo.local_rack();

        let a = topo.peer_for_key(rack, b"alpha").unwrap().addr;
        let b = topo.peer_for_key(rack, b"alpha").unwrap().addr;

        assert_eq!(a, b);
    }
}
