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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FanlightError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed request")]
    MalformedRequest,

    #[error("Malformed response")]
    MalformedResponse,

    #[error("Malformed peer frame")]
    MalformedFrame,

    #[error("Exceeded ratelimit")]
    Ratelimited,

    #[error("Mismatching frame version, expected {expected}, received {received}")]
    VersionMismatch { expected: u8, received: u8 },

    #[error("Invalid frame kind {0}")]
    InvalidFrameKind(u8),

    #[error("Payload exceeds limit of {0} bytes")]
    OversizedPayload(usize),

    #[error("No peer available for key")]
    PeerUnavailable,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Node unavailable: {0}")]
    NodeUnavailable(&'static str),

    #[error("Message table full")]
    TableFull,

    #[error("Invalid consistency target, expected read or write")]
    InvalidConsistencyTarget,

    #[error("Invalid net address {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("Hash tag must be exactly two characters")]
    InvalidHashTag,

    #[error("At most {0} racks are supported in the local datacenter")]
    TooManyRacks(usize),

    #[error("Local site {datacenter}/{rack} is not in the configured topology")]
    UnknownLocalSite { datacenter: String, rack: String },
}

impl FanlightError {
    pub fn code(&self) -> u8 {
        match *self {
            FanlightError::MalformedRequest => 0,
            FanlightError::Ratelimited => 1,
            FanlightError::VersionMismatch {
                expected: _,
                received: _,
            } => 2,
            FanlightError::InvalidFrameKind(_) => 3,
            FanlightError::PeerUnavailable => 4,
            FanlightError::RequestTimeout => 5,
            FanlightError::NodeUnavailable(_) => 6,
            FanlightError::TableFull => 7,
            FanlightError::InvalidConsistencyTarget => 8,
            _ => 255,
        }
    }
}

pub type FanlightResult<T> = std::result::Result<T, FanlightError>;
