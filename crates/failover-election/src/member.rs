//! Candidate and leader identity records

use crate::error::{ElectionError, Result};
use crate::store::{KeyValue, LeaseId};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a candidate or of an observed leader.
///
/// A `Member` is immutable: observing a new record produces a new value that
/// replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    member_id: String,
    member_config: Vec<u8>,
    sequence: i64,
    lease_id: LeaseId,
}

/// On-store representation. Revision and lease come from the record itself.
#[derive(Serialize, Deserialize)]
struct EncodedMember {
    member_id: String,
    member_config: String,
}

impl Member {
    /// Create the candidacy record of this node
    pub fn new<T: Into<String>>(member_id: T, member_config: Vec<u8>) -> Self {
        Self {
            member_id: member_id.into(),
            member_config,
            sequence: 0,
            lease_id: 0,
        }
    }

    /// Stable identity of the member
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Opaque endpoint/role metadata
    pub fn member_config(&self) -> &[u8] {
        &self.member_config
    }

    /// Store revision of the record this view was built from
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Lease backing the record, 0 when unknown
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Whether both records describe the same candidate
    pub fn same_identity(&self, other: &Member) -> bool {
        self.member_id == other.member_id
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoded = EncodedMember {
            member_id: self.member_id.clone(),
            member_config: STANDARD.encode(&self.member_config),
        };
        Ok(serde_json::to_vec(&encoded)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let encoded: EncodedMember = serde_json::from_slice(data)?;
        if encoded.member_id.is_empty() {
            return Err(ElectionError::malformed_member("empty member id"));
        }

        let member_config = STANDARD
            .decode(encoded.member_config.as_bytes())
            .map_err(|e| ElectionError::malformed_member(format!("member config: {}", e)))?;

        Ok(Self::new(encoded.member_id, member_config))
    }

    /// Build the observed leader from a store record, stamping revision and lease
    pub fn from_key_value(kv: &KeyValue) -> Result<Self> {
        let member = Self::decode(&kv.value)?;
        Ok(Self {
            sequence: kv.mod_revision,
            lease_id: kv.lease,
            ..member
        })
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.member_id, self.sequence)
    }
}
