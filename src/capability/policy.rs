//! Administrator policy files.
//!
//! A policy is a TOML document naming the principals it applies to and the
//! capabilities it grants: one record per capability type with resource
//! patterns, operations, and constraints (file size, key count, TTL, rate
//! limit, usage budget). The sandbox initializer mints `CapabilityToken`s
//! from the union of all applicable policies.
//!
//! A loaded `PolicyStore` is read-only; reloading builds a fresh store and
//! swaps it in atomically via `SharedPolicies`.

use crate::capability::token::{CapabilityToken, Constraints};
use crate::error::CapabilityError;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub name: String,
    /// Principals this policy applies to: user names, `group:NAME`, or `*`.
    #[serde(default = "default_applies_to")]
    pub applies_to: Vec<String>,
    #[serde(default, rename = "capability")]
    pub capabilities: Vec<CapabilityGrant>,
}

fn default_applies_to() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityGrant {
    #[serde(rename = "type")]
    pub capability_type: String,
    pub resources: Vec<String>,
    pub operations: Vec<String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub max_usage: Option<u64>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub max_keys: Option<u64>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl CapabilityGrant {
    fn constraints(&self) -> Constraints {
        Constraints {
            expires_at: self.ttl_seconds.map(|s| Utc::now() + Duration::seconds(s)),
            max_usage: self.max_usage,
            max_file_size: self.max_file_size,
            max_keys: self.max_keys,
            rate_limit_per_minute: self.rate_limit_per_minute,
            hosts: self.hosts.clone(),
            ports: self.ports.clone(),
        }
    }

    pub fn mint(&self) -> Result<Arc<CapabilityToken>, CapabilityError> {
        let patterns: Vec<&str> = self.resources.iter().map(String::as_str).collect();
        let operations: Vec<&str> = self.operations.iter().map(String::as_str).collect();
        Ok(Arc::new(CapabilityToken::create(
            self.capability_type.clone(),
            &patterns,
            &operations,
            self.constraints(),
        )?))
    }
}

impl PolicyDocument {
    pub fn parse(text: &str) -> Result<Self, CapabilityError> {
        let document: PolicyDocument =
            toml::from_str(text).map_err(|e| CapabilityError::InvalidDeclaration {
                name: "policy".to_string(),
                reason: e.to_string(),
            })?;
        // Patterns are validated eagerly so a bad policy fails at load time,
        // not at first access.
        for grant in &document.capabilities {
            if grant.resources.is_empty() {
                return Err(CapabilityError::InvalidDeclaration {
                    name: document.name.clone(),
                    reason: format!(
                        "capability `{}` grants no resources",
                        grant.capability_type
                    ),
                });
            }
            if grant.operations.is_empty() {
                return Err(CapabilityError::InvalidDeclaration {
                    name: document.name.clone(),
                    reason: format!(
                        "capability `{}` grants no operations",
                        grant.capability_type
                    ),
                });
            }
            for resource in &grant.resources {
                crate::capability::pattern::ResourcePattern::parse(resource)?;
            }
        }
        Ok(document)
    }

    pub fn applies_to(&self, principal: &str) -> bool {
        self.applies_to.iter().any(|entry| {
            entry == "*" || entry == principal || entry.strip_prefix("group:") == Some(principal)
        })
    }
}

/// An immutable collection of loaded policies.
#[derive(Debug, Default, Clone)]
pub struct PolicyStore {
    policies: Vec<PolicyDocument>,
}

impl PolicyStore {
    pub fn new(policies: Vec<PolicyDocument>) -> Self {
        PolicyStore { policies }
    }

    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, CapabilityError> {
        let mut policies = Vec::new();
        for path in paths {
            let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
                CapabilityError::InvalidDeclaration {
                    name: path.as_ref().display().to_string(),
                    reason: format!("cannot read policy file: {}", e),
                }
            })?;
            policies.push(PolicyDocument::parse(&text)?);
        }
        Ok(PolicyStore::new(policies))
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policies(&self) -> &[PolicyDocument] {
        &self.policies
    }

    /// Union of grants from every policy applicable to `principal`.
    pub fn grants_for(&self, principal: &str) -> Vec<&CapabilityGrant> {
        self.policies
            .iter()
            .filter(|p| p.applies_to(principal))
            .flat_map(|p| p.capabilities.iter())
            .collect()
    }

    /// Mint the granted token set for `principal`.
    pub fn mint_tokens(
        &self,
        principal: &str,
    ) -> Result<Vec<Arc<CapabilityToken>>, CapabilityError> {
        self.grants_for(principal)
            .into_iter()
            .map(CapabilityGrant::mint)
            .collect()
    }
}

/// Atomic handle for hot-reload: readers clone the current `Arc`, reloads
/// swap in a fresh store.
#[derive(Default)]
pub struct SharedPolicies {
    current: Mutex<Arc<PolicyStore>>,
}

impl SharedPolicies {
    pub fn new(store: PolicyStore) -> Self {
        SharedPolicies {
            current: Mutex::new(Arc::new(store)),
        }
    }

    pub fn load(&self) -> Arc<PolicyStore> {
        Arc::clone(&self.current.lock().expect("policy lock"))
    }

    pub fn swap(&self, store: PolicyStore) {
        *self.current.lock().expect("policy lock") = Arc::new(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
        name = "analysts"
        applies_to = ["alice", "group:data"]

        [[capability]]
        type = "file"
        resources = ["data/*.csv"]
        operations = ["read"]
        ttl_seconds = 3600
        max_usage = 100
        max_file_size = 1048576

        [[capability]]
        type = "network"
        resources = ["api.example.com/*"]
        operations = ["get"]
        hosts = ["api.example.com"]
        ports = [443]
    "#;

    #[test]
    fn test_parse_and_applicability() {
        let doc = PolicyDocument::parse(POLICY).unwrap();
        assert_eq!(doc.name, "analysts");
        assert!(doc.applies_to("alice"));
        assert!(doc.applies_to("data"));
        assert!(!doc.applies_to("bob"));
        assert_eq!(doc.capabilities.len(), 2);
    }

    #[test]
    fn test_mint_tokens() {
        let store = PolicyStore::new(vec![PolicyDocument::parse(POLICY).unwrap()]);
        let tokens = store.mint_tokens("alice").unwrap();
        assert_eq!(tokens.len(), 2);
        let file = &tokens[0];
        assert_eq!(file.capability_type(), "file");
        assert!(file.can_access("data/a.csv", "read"));
        assert!(!file.can_access("data/a.csv", "write"));
        assert_eq!(file.constraints().max_file_size, Some(1048576));
        assert!(file.constraints().expires_at.is_some());

        assert!(store.mint_tokens("bob").unwrap().is_empty());
    }

    #[test]
    fn test_default_applies_to_everyone() {
        let doc = PolicyDocument::parse(
            r#"
            name = "open"
            [[capability]]
            type = "math"
            resources = ["**"]
            operations = ["call"]
        "#,
        )
        .unwrap();
        assert!(doc.applies_to("anyone"));
    }

    #[test]
    fn test_invalid_policies_rejected() {
        assert!(PolicyDocument::parse("name = 3").is_err());
        // Empty resource list
        assert!(PolicyDocument::parse(
            r#"
            name = "bad"
            [[capability]]
            type = "file"
            resources = []
            operations = ["read"]
        "#
        )
        .is_err());
        // Invalid glob
        assert!(PolicyDocument::parse(
            r#"
            name = "bad"
            [[capability]]
            type = "file"
            resources = ["data/{a"]
            operations = ["read"]
        "#
        )
        .is_err());
    }

    #[test]
    fn test_shared_policies_swap() {
        let shared = SharedPolicies::new(PolicyStore::default());
        assert!(shared.load().is_empty());
        shared.swap(PolicyStore::new(vec![PolicyDocument::parse(POLICY).unwrap()]));
        assert!(!shared.load().is_empty());
    }
}
