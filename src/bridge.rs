//! Standard-library bridge interface.
//!
//! A bridge exposes host functionality to ML through the capability-checked
//! call interface. Each bridge registers a name, a load policy (capability
//! types it needs to be importable), a declarative table of callable entries
//! (required capabilities, audited operation name, which argument is the
//! resource, and an argument-count validator), and safe attributes for any
//! custom types it returns. Generated code calls bridges through the
//! manager, never directly.
//!
//! Only the descriptors live here; concrete host implementations are
//! supplied by the runtime preamble in the sandbox child.

use crate::registry::{RegistryBuilder, SafeAttribute};
use serde::Serialize;
use std::collections::BTreeMap;

/// Declarative argument validator for one entry.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArgSpec {
    pub min_args: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_args: Option<usize>,
}

impl ArgSpec {
    pub const fn exactly(n: usize) -> Self {
        ArgSpec {
            min_args: n,
            max_args: Some(n),
        }
    }

    pub const fn at_least(n: usize) -> Self {
        ArgSpec {
            min_args: n,
            max_args: None,
        }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        ArgSpec {
            min_args: min,
            max_args: Some(max),
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && self.max_args.map_or(true, |max| count <= max)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeEntry {
    /// Callable name inside the module, e.g. `read` for `file.read`.
    pub name: String,
    /// Capability type checked before the call; `None` for pure entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_type: Option<String>,
    /// Operation recorded in audit events and checked against the token.
    pub operation: String,
    /// Index of the argument treated as the resource, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_arg: Option<usize>,
    pub args: ArgSpec,
}

impl BridgeEntry {
    fn pure(name: &str, args: ArgSpec) -> Self {
        BridgeEntry {
            name: name.to_string(),
            capability_type: None,
            operation: "call".to_string(),
            resource_arg: None,
            args,
        }
    }

    fn gated(name: &str, capability_type: &str, operation: &str, args: ArgSpec) -> Self {
        BridgeEntry {
            name: name.to_string(),
            capability_type: Some(capability_type.to_string()),
            operation: operation.to_string(),
            resource_arg: Some(0),
            args,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeModule {
    pub name: String,
    /// Capability types required for the module to load at all.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub load_policy: Vec<String>,
    pub entries: Vec<BridgeEntry>,
    /// Safe attributes for custom types this bridge returns; merged into
    /// the safe-attribute registry at startup.
    #[serde(skip)]
    pub safe_types: Vec<(String, Vec<SafeAttribute>)>,
}

impl BridgeModule {
    pub fn entry(&self, name: &str) -> Option<&BridgeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// The table of bridges known to the compiler. Immutable after startup.
#[derive(Debug, Clone)]
pub struct BridgeRegistry {
    modules: BTreeMap<String, BridgeModule>,
}

impl BridgeRegistry {
    pub fn standard() -> Self {
        let mut modules = BTreeMap::new();
        for module in standard_bridges() {
            modules.insert(module.name.clone(), module);
        }
        BridgeRegistry { modules }
    }

    pub fn lookup(&self, name: &str) -> Option<&BridgeModule> {
        self.modules.get(name)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Merge every bridge's safe types into a registry builder.
    pub fn register_safe_types(&self, builder: &mut RegistryBuilder) {
        for module in self.modules.values() {
            for (type_identifier, attributes) in &module.safe_types {
                builder.register(type_identifier, attributes.clone());
            }
        }
    }

    /// JSON snapshot for the generated program: module -> entry table.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.modules).expect("bridge table serializes")
    }
}

fn standard_bridges() -> Vec<BridgeModule> {
    vec![
        BridgeModule {
            name: "math".to_string(),
            load_policy: vec![],
            entries: vec![
                BridgeEntry::pure("abs", ArgSpec::exactly(1)),
                BridgeEntry::pure("floor", ArgSpec::exactly(1)),
                BridgeEntry::pure("ceil", ArgSpec::exactly(1)),
                BridgeEntry::pure("sqrt", ArgSpec::exactly(1)),
                BridgeEntry::pure("pow", ArgSpec::exactly(2)),
                BridgeEntry::pure("min", ArgSpec::at_least(1)),
                BridgeEntry::pure("max", ArgSpec::at_least(1)),
            ],
            safe_types: vec![],
        },
        BridgeModule {
            name: "json".to_string(),
            load_policy: vec![],
            entries: vec![
                BridgeEntry::pure("parse", ArgSpec::exactly(1)),
                BridgeEntry::pure("stringify", ArgSpec::between(1, 2)),
            ],
            safe_types: vec![],
        },
        BridgeModule {
            name: "string".to_string(),
            load_policy: vec![],
            entries: vec![
                BridgeEntry::pure("from_chars", ArgSpec::exactly(1)),
                BridgeEntry::pure("repeat", ArgSpec::exactly(2)),
                BridgeEntry::pure("pad_left", ArgSpec::between(2, 3)),
                BridgeEntry::pure("pad_right", ArgSpec::between(2, 3)),
            ],
            safe_types: vec![],
        },
        BridgeModule {
            name: "file".to_string(),
            load_policy: vec!["file".to_string()],
            entries: vec![
                BridgeEntry::gated("read", "file", "read", ArgSpec::exactly(1)),
                BridgeEntry::gated("write", "file", "write", ArgSpec::exactly(2)),
                BridgeEntry::gated("append", "file", "write", ArgSpec::exactly(2)),
                BridgeEntry::gated("exists", "file", "read", ArgSpec::exactly(1)),
                BridgeEntry::gated("list_dir", "file", "read", ArgSpec::exactly(1)),
            ],
            safe_types: vec![(
                "file_stat".to_string(),
                vec![
                    SafeAttribute::property("size", "size in bytes"),
                    SafeAttribute::property("modified", "last modification time"),
                ],
            )],
        },
        BridgeModule {
            name: "network".to_string(),
            load_policy: vec!["network".to_string()],
            entries: vec![
                BridgeEntry::gated("get", "network", "get", ArgSpec::between(1, 2)),
                BridgeEntry::gated("post", "network", "post", ArgSpec::between(2, 3)),
            ],
            safe_types: vec![(
                "http_response".to_string(),
                vec![
                    SafeAttribute::property("status", "HTTP status code"),
                    SafeAttribute::property("body", "response body text"),
                    SafeAttribute::method("header", "single response header"),
                ],
            )],
        },
        BridgeModule {
            name: "env".to_string(),
            load_policy: vec!["env".to_string()],
            entries: vec![BridgeEntry::gated("get", "env", "get", ArgSpec::between(1, 2))],
            safe_types: vec![],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SafeAttributeRegistry;

    #[test]
    fn test_standard_modules_present() {
        let registry = BridgeRegistry::standard();
        for name in ["math", "json", "string", "file", "network", "env"] {
            assert!(registry.lookup(name).is_some(), "missing bridge {}", name);
        }
        assert!(registry.lookup("os").is_none());
    }

    #[test]
    fn test_gated_entries_carry_capability() {
        let registry = BridgeRegistry::standard();
        let file = registry.lookup("file").unwrap();
        assert_eq!(file.load_policy, vec!["file"]);
        let read = file.entry("read").unwrap();
        assert_eq!(read.capability_type.as_deref(), Some("file"));
        assert_eq!(read.operation, "read");
        assert_eq!(read.resource_arg, Some(0));

        let math = registry.lookup("math").unwrap();
        assert!(math.entry("sqrt").unwrap().capability_type.is_none());
    }

    #[test]
    fn test_arg_specs() {
        assert!(ArgSpec::exactly(1).accepts(1));
        assert!(!ArgSpec::exactly(1).accepts(2));
        assert!(ArgSpec::at_least(1).accepts(7));
        assert!(!ArgSpec::at_least(1).accepts(0));
        assert!(ArgSpec::between(1, 2).accepts(2));
        assert!(!ArgSpec::between(1, 2).accepts(3));
    }

    #[test]
    fn test_safe_types_merge_into_registry() {
        let bridges = BridgeRegistry::standard();
        let registry = SafeAttributeRegistry::standard().extended(|builder| {
            bridges.register_safe_types(builder);
        });
        assert!(registry.lookup("http_response", "status").is_some());
        assert!(registry.lookup("file_stat", "size").is_some());
        assert!(!registry.is_safe("http_response", "__class__"));
    }

    #[test]
    fn test_snapshot_shape() {
        let snapshot = BridgeRegistry::standard().snapshot_json();
        assert_eq!(snapshot["file"]["load_policy"][0], "file");
        assert_eq!(snapshot["network"]["entries"][0]["name"], "get");
    }
}
