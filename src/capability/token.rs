//! Capability tokens.
//!
//! A token is an unforgeable, time-and-usage-bounded permission to perform
//! named operations on resources matching a pattern set. Tokens are immutable
//! after creation; the sha256 checksum over the identity fields detects any
//! tampering. Usage counting is atomic so a token can be shared between a
//! context and the auditor.

use crate::capability::pattern::ResourcePattern;
use crate::error::CapabilityError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Constraint set carried by a token. Every field is optional; an absent
/// field means "unconstrained" in that dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_keys: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
}

impl Constraints {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self
    }

    pub fn with_max_usage(mut self, max_usage: u64) -> Self {
        self.max_usage = Some(max_usage);
        self
    }

    /// True when `self` is no stricter than `other` in every dimension that
    /// `other` explicitly sets. Used by the validator: a granted token's
    /// constraints must not undercut what the declaration asks for.
    pub fn no_stricter_than(&self, other: &Constraints) -> bool {
        if let Some(their_expiry) = other.expires_at {
            match self.expires_at {
                Some(our_expiry) if our_expiry < their_expiry => return false,
                _ => {}
            }
        }
        if let Some(their_max) = other.max_usage {
            match self.max_usage {
                Some(our_max) if our_max < their_max => return false,
                _ => {}
            }
        }
        if let Some(their_size) = other.max_file_size {
            match self.max_file_size {
                Some(our_size) if our_size < their_size => return false,
                _ => {}
            }
        }
        if let Some(their_keys) = other.max_keys {
            match self.max_keys {
                Some(our_keys) if our_keys < their_keys => return false,
                _ => {}
            }
        }
        if !other.hosts.is_empty() {
            // Every host the declaration names must be permitted.
            if !self.hosts.is_empty() && !other.hosts.iter().all(|h| self.hosts.contains(h)) {
                return false;
            }
        }
        if !other.ports.is_empty()
            && !self.ports.is_empty()
            && !other.ports.iter().all(|p| self.ports.contains(p))
        {
            return false;
        }
        true
    }
}

fn serialize_atomic<S: serde::Serializer>(
    value: &AtomicU64,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.load(Ordering::SeqCst))
}

fn deserialize_atomic<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<AtomicU64, D::Error> {
    u64::deserialize(deserializer).map(AtomicU64::new)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilityToken {
    id: Uuid,
    capability_type: String,
    resource_patterns: Vec<ResourcePattern>,
    operations: BTreeSet<String>,
    constraints: Constraints,
    created_at: DateTime<Utc>,
    checksum: String,
    #[serde(
        serialize_with = "serialize_atomic",
        deserialize_with = "deserialize_atomic",
        default
    )]
    usage_count: AtomicU64,
}

impl Clone for CapabilityToken {
    fn clone(&self) -> Self {
        CapabilityToken {
            id: self.id,
            capability_type: self.capability_type.clone(),
            resource_patterns: self.resource_patterns.clone(),
            operations: self.operations.clone(),
            constraints: self.constraints.clone(),
            created_at: self.created_at,
            checksum: self.checksum.clone(),
            usage_count: AtomicU64::new(self.usage_count.load(Ordering::SeqCst)),
        }
    }
}

impl CapabilityToken {
    pub fn create(
        capability_type: impl Into<String>,
        patterns: &[&str],
        operations: &[&str],
        constraints: Constraints,
    ) -> Result<Self, CapabilityError> {
        let capability_type = capability_type.into();
        let resource_patterns = patterns
            .iter()
            .map(|p| ResourcePattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        let operations: BTreeSet<String> = operations.iter().map(|s| s.to_string()).collect();

        let id = Uuid::new_v4();
        let checksum = compute_checksum(&capability_type, &resource_patterns, &operations, &id);

        Ok(CapabilityToken {
            id,
            capability_type,
            resource_patterns,
            operations,
            constraints,
            created_at: Utc::now(),
            checksum,
            usage_count: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capability_type(&self) -> &str {
        &self.capability_type
    }

    pub fn resource_patterns(&self) -> &[ResourcePattern] {
        &self.resource_patterns
    }

    pub fn operations(&self) -> &BTreeSet<String> {
        &self.operations
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::SeqCst)
    }

    /// Recompute the checksum and compare with the stored value.
    pub fn checksum_valid(&self) -> bool {
        compute_checksum(
            &self.capability_type,
            &self.resource_patterns,
            &self.operations,
            &self.id,
        ) == self.checksum
    }

    pub fn is_expired(&self) -> bool {
        match self.constraints.expires_at {
            Some(expires_at) => Utc::now() >= expires_at,
            None => false,
        }
    }

    fn usage_exhausted(&self) -> bool {
        match self.constraints.max_usage {
            Some(max) => self.usage_count.load(Ordering::SeqCst) >= max,
            None => false,
        }
    }

    /// Token-level validity, independent of a particular resource.
    pub fn is_valid(&self) -> bool {
        self.checksum_valid() && !self.is_expired() && !self.usage_exhausted()
    }

    /// True iff the operation is allowed, some pattern matches the resource,
    /// and the token itself is still valid.
    pub fn can_access(&self, resource: &str, operation: &str) -> bool {
        self.is_valid()
            && self.operations.contains(operation)
            && self
                .resource_patterns
                .iter()
                .any(|pattern| pattern.matches(resource))
    }

    /// Atomically consume one use. Fails without incrementing when the token
    /// is invalid or the budget is already spent.
    pub fn use_once(&self) -> Result<u64, CapabilityError> {
        if !self.checksum_valid() {
            return Err(CapabilityError::ChecksumMismatch(
                self.capability_type.clone(),
            ));
        }
        if self.is_expired() {
            return Err(CapabilityError::Expired(self.capability_type.clone()));
        }

        let mut current = self.usage_count.load(Ordering::SeqCst);
        loop {
            if let Some(max) = self.constraints.max_usage {
                if current >= max {
                    return Err(CapabilityError::UsageExhausted(
                        self.capability_type.clone(),
                    ));
                }
            }
            match self.usage_count.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }
}

fn compute_checksum(
    capability_type: &str,
    patterns: &[ResourcePattern],
    operations: &BTreeSet<String>,
    id: &Uuid,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(capability_type.as_bytes());
    hasher.update(b"\x1f");
    for pattern in patterns {
        hasher.update(pattern.as_str().as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.update(b"\x1f");
    for operation in operations {
        hasher.update(operation.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.update(b"\x1f");
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
