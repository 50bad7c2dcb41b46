//! Safe-attribute registry.
//!
//! Every dotted access executed by generated code goes through this gate:
//! the attribute must be registered for the object's type (or whitelisted in
//! the built-ins tables for strings, sequences, and mappings), any name
//! matching `__*__` is denied unconditionally, and the attribute's required
//! capabilities must be held by the current context.
//!
//! The registry is constructed in an explicit startup phase and immutable
//! afterward; readers never take a lock. Hot reload swaps the root
//! reference.

use crate::ast::is_dunder;
use crate::capability::CapabilityManager;
use crate::error::RegistryError;
use crate::fuzzy;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Property,
    Method,
    /// Explicitly denied even for dynamic index access.
    Forbidden,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafeAttribute {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    pub description: String,
}

impl SafeAttribute {
    pub fn method(name: &str, description: &str) -> Self {
        SafeAttribute {
            name: name.to_string(),
            kind: AttributeKind::Method,
            required_capabilities: Vec::new(),
            description: description.to_string(),
        }
    }

    pub fn property(name: &str, description: &str) -> Self {
        SafeAttribute {
            name: name.to_string(),
            kind: AttributeKind::Property,
            required_capabilities: Vec::new(),
            description: description.to_string(),
        }
    }

    pub fn forbidden(name: &str, description: &str) -> Self {
        SafeAttribute {
            name: name.to_string(),
            kind: AttributeKind::Forbidden,
            required_capabilities: Vec::new(),
            description: description.to_string(),
        }
    }

    pub fn requires(mut self, capability_type: &str) -> Self {
        self.required_capabilities.push(capability_type.to_string());
        self
    }
}

/// Startup-phase builder; `build` freezes the registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: BTreeMap<String, BTreeMap<String, SafeAttribute>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder::default()
    }

    pub fn register(&mut self, type_identifier: &str, attributes: Vec<SafeAttribute>) -> &mut Self {
        let entry = self.types.entry(type_identifier.to_string()).or_default();
        for attribute in attributes {
            entry.insert(attribute.name.clone(), attribute);
        }
        self
    }

    pub fn build(self) -> SafeAttributeRegistry {
        SafeAttributeRegistry { types: self.types }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SafeAttributeRegistry {
    types: BTreeMap<String, BTreeMap<String, SafeAttribute>>,
}

impl SafeAttributeRegistry {
    /// The standard registry: built-ins tables for the core value types.
    /// Bridge modules add their own entries through `RegistryBuilder`.
    pub fn standard() -> Self {
        let mut builder = RegistryBuilder::new();
        register_builtins(&mut builder);
        builder.build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Extend with additional entries, producing a fresh registry. The
    /// existing registry is untouched; callers swap the reference.
    pub fn extended(&self, register: impl FnOnce(&mut RegistryBuilder)) -> Self {
        let mut builder = RegistryBuilder {
            types: self.types.clone(),
        };
        register(&mut builder);
        builder.build()
    }

    pub fn lookup(&self, type_identifier: &str, name: &str) -> Option<&SafeAttribute> {
        self.types.get(type_identifier).and_then(|m| m.get(name))
    }

    fn known_names(&self, type_identifier: &str) -> Vec<&str> {
        self.types
            .get(type_identifier)
            .map(|m| {
                m.values()
                    .filter(|a| a.kind != AttributeKind::Forbidden)
                    .map(|a| a.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The full gate: dunder deny, registry lookup, capability check.
    pub fn check(&self, type_identifier: &str, name: &str) -> Result<&SafeAttribute, RegistryError> {
        if is_dunder(name) {
            return Err(self.denial(type_identifier, name));
        }

        let attribute = self
            .lookup(type_identifier, name)
            .ok_or_else(|| self.denial(type_identifier, name))?;
        if attribute.kind == AttributeKind::Forbidden {
            return Err(self.denial(type_identifier, name));
        }

        let manager = CapabilityManager::global();
        for capability_type in &attribute.required_capabilities {
            if !manager.has_capability(capability_type) {
                return Err(RegistryError::AttributeForbidden {
                    type_name: type_identifier.to_string(),
                    attribute: name.to_string(),
                    suggestion: None,
                });
            }
        }

        Ok(attribute)
    }

    /// Convenience predicate used by generated code and tests.
    pub fn is_safe(&self, type_identifier: &str, name: &str) -> bool {
        self.check(type_identifier, name).is_ok()
    }

    /// Gate for index access `x[k]` with a string key: dunder keys and
    /// explicitly forbidden entries are denied; plain data keys pass.
    pub fn allows_index_key(&self, type_identifier: &str, key: &str) -> bool {
        if is_dunder(key) {
            return false;
        }
        !matches!(
            self.lookup(type_identifier, key),
            Some(SafeAttribute {
                kind: AttributeKind::Forbidden,
                ..
            })
        )
    }

    fn denial(&self, type_identifier: &str, name: &str) -> RegistryError {
        let suggestion = if is_dunder(name) {
            None
        } else {
            fuzzy::best_match(name, self.known_names(type_identifier)).map(str::to_string)
        };
        RegistryError::AttributeForbidden {
            type_name: type_identifier.to_string(),
            attribute: name.to_string(),
            suggestion,
        }
    }

    /// JSON snapshot embedded into generated programs so the child-side gate
    /// works from the same data.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.types).expect("registry serializes")
    }

    pub fn type_identifiers(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

fn register_builtins(builder: &mut RegistryBuilder) {
    builder.register(
        "str",
        vec![
            SafeAttribute::method("upper", "uppercase copy"),
            SafeAttribute::method("lower", "lowercase copy"),
            SafeAttribute::method("strip", "trim surrounding whitespace"),
            SafeAttribute::method("split", "split on a separator"),
            SafeAttribute::method("join", "join a sequence with this separator"),
            SafeAttribute::method("replace", "replace occurrences of a substring"),
            SafeAttribute::method("startswith", "prefix test"),
            SafeAttribute::method("endswith", "suffix test"),
            SafeAttribute::method("find", "index of a substring or -1"),
            SafeAttribute::property("length", "number of characters"),
        ],
    );
    builder.register(
        "list",
        vec![
            SafeAttribute::method("index", "index of a value"),
            SafeAttribute::method("count", "occurrences of a value"),
            SafeAttribute::method("slice", "sub-sequence copy"),
            SafeAttribute::method("reverse", "reversed copy"),
            SafeAttribute::method("sort", "sorted copy"),
            SafeAttribute::method("contains", "membership test"),
            SafeAttribute::property("length", "number of elements"),
        ],
    );
    builder.register(
        "dict",
        vec![
            SafeAttribute::method("keys", "keys in insertion order"),
            SafeAttribute::method("values", "values in insertion order"),
            SafeAttribute::method("items", "key/value pairs in insertion order"),
            SafeAttribute::method("get", "value for a key, or a default"),
            SafeAttribute::method("has", "key membership test"),
            SafeAttribute::property("length", "number of entries"),
        ],
    );
    // Error values caught by `except (err)` blocks.
    builder.register(
        "error",
        vec![
            SafeAttribute::property("kind", "error kind name"),
            SafeAttribute::property("message", "human-readable description"),
        ],
    );
}
