//! Source map from generated Python lines back to ML source spans.
//!
//! The code generator records one mapping per emitted statement line;
//! `transpile` writes the map next to the generated program so runtime
//! errors can be translated back to the original location.

use crate::ast::Span;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// 1-indexed line in the generated program.
    pub generated_line: usize,
    /// 1-indexed line in the ML source.
    pub source_line: usize,
    /// 1-indexed column in the ML source.
    pub source_column: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMap {
    version: u32,
    pub source_file: String,
    #[serde(rename = "mappings")]
    mappings_vec: Vec<Mapping>,
    #[serde(skip)]
    lookup_index: HashMap<usize, usize>,
}

impl SourceMap {
    pub fn new(source_file: impl Into<String>) -> Self {
        SourceMap {
            version: 1,
            source_file: source_file.into(),
            mappings_vec: Vec::new(),
            lookup_index: HashMap::new(),
        }
    }

    pub fn add_mapping(&mut self, generated_line: usize, span: Span) {
        let mapping = Mapping {
            generated_line,
            source_line: span.line,
            source_column: span.column,
        };
        self.lookup_index
            .insert(generated_line, self.mappings_vec.len());
        self.mappings_vec.push(mapping);
    }

    /// Exact lookup for a generated line.
    pub fn lookup(&self, generated_line: usize) -> Option<&Mapping> {
        self.lookup_index
            .get(&generated_line)
            .map(|&index| &self.mappings_vec[index])
    }

    /// Nearest mapping at or before the generated line; what error
    /// translation wants when the failing line itself carries no mapping.
    pub fn lookup_nearest(&self, generated_line: usize) -> Option<&Mapping> {
        self.mappings_vec
            .iter()
            .filter(|m| m.generated_line <= generated_line)
            .max_by_key(|m| m.generated_line)
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings_vec
    }

    pub fn is_empty(&self) -> bool {
        self.mappings_vec.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.lookup_index.clear();
        for (index, mapping) in self.mappings_vec.iter().enumerate() {
            self.lookup_index.insert(mapping.generated_line, index);
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let mut map: SourceMap = serde_json::from_str(text)?;
        map.rebuild_index();
        Ok(map)
    }
}
