//! Declared ⊆ granted validation.
//!
//! Every capability a program declares must be covered by a token the
//! runtime holds for the requesting principal. Coverage is per declaration:
//! one granted token must match the declared type, cover every declared
//! resource pattern, allow every declared operation, and be no stricter in
//! any constraint dimension the declaration sets. Unprovable glob coverage
//! counts as not covered.

use crate::ast::CapabilityDecl;
use crate::capability::pattern::ResourcePattern;
use crate::capability::token::{CapabilityToken, Constraints};
use crate::error::CapabilityError;
use std::sync::Arc;
use tracing::debug;

/// Validate a single declaration against the granted set.
pub fn validate_declaration(
    declared: &CapabilityDecl,
    granted: &[Arc<CapabilityToken>],
) -> Result<(), CapabilityError> {
    check_declaration_shape(declared)?;

    let declared_type = declared.capability_type();
    let declared_patterns: Vec<ResourcePattern> = declared
        .resource_patterns
        .iter()
        .map(|p| ResourcePattern::parse(p))
        .collect::<Result<_, _>>()?;
    // Declarations carry no explicit constraints; the grammar cannot express
    // them. An empty constraint set never makes a grant look too strict.
    let declared_constraints = Constraints::default();

    let candidates: Vec<&Arc<CapabilityToken>> = granted
        .iter()
        .filter(|token| token.capability_type() == declared_type)
        .collect();
    if candidates.is_empty() {
        return Err(CapabilityError::DeclarationNotCovered {
            declared: declared.name.clone(),
            reason: format!("no granted capability of type `{}`", declared_type),
        });
    }

    let mut last_reason = String::new();
    for token in &candidates {
        match token_covers(token, &declared_patterns, declared, &declared_constraints) {
            Ok(()) => {
                debug!(
                    declaration = %declared.name,
                    token = %token.id(),
                    "declaration covered by granted token"
                );
                return Ok(());
            }
            Err(reason) => last_reason = reason,
        }
    }

    Err(CapabilityError::DeclarationNotCovered {
        declared: declared.name.clone(),
        reason: last_reason,
    })
}

/// Validate every declaration of a program.
pub fn validate_all(
    declarations: &[&CapabilityDecl],
    granted: &[Arc<CapabilityToken>],
) -> Result<(), CapabilityError> {
    for declaration in declarations {
        validate_declaration(declaration, granted)?;
    }
    Ok(())
}

/// Structural checks independent of any policy.
pub fn check_declaration_shape(declared: &CapabilityDecl) -> Result<(), CapabilityError> {
    if declared.resource_patterns.is_empty() {
        return Err(CapabilityError::InvalidDeclaration {
            name: declared.name.clone(),
            reason: "declares no resource patterns".to_string(),
        });
    }
    if declared.operations.is_empty() {
        return Err(CapabilityError::InvalidDeclaration {
            name: declared.name.clone(),
            reason: "declares no operations".to_string(),
        });
    }
    for pattern in &declared.resource_patterns {
        ResourcePattern::parse(pattern)?;
    }
    Ok(())
}

fn token_covers(
    token: &CapabilityToken,
    declared_patterns: &[ResourcePattern],
    declared: &CapabilityDecl,
    declared_constraints: &Constraints,
) -> Result<(), String> {
    if !token.checksum_valid() {
        return Err("granted token failed its checksum".to_string());
    }
    if token.is_expired() {
        return Err("granted token has expired".to_string());
    }

    for declared_pattern in declared_patterns {
        let covered = token
            .resource_patterns()
            .iter()
            .any(|granted_pattern| granted_pattern.covers(declared_pattern));
        if !covered {
            return Err(format!(
                "declared resource `{}` is not covered by any granted pattern",
                declared_pattern
            ));
        }
    }

    for operation in &declared.operations {
        if !token.operations().contains(operation) {
            return Err(format!("operation `{}` is not granted", operation));
        }
    }

    if !token.constraints().no_stricter_than(declared_constraints) {
        return Err("granted constraints are stricter than declared".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn decl(name: &str, patterns: &[&str], ops: &[&str]) -> CapabilityDecl {
        CapabilityDecl {
            name: name.to_string(),
            resource_patterns: patterns.iter().map(|s| s.to_string()).collect(),
            operations: ops.iter().map(|s| s.to_string()).collect(),
            span: Span::new(0, 0, 1, 1),
        }
    }

    fn grant(capability_type: &str, patterns: &[&str], ops: &[&str]) -> Arc<CapabilityToken> {
        Arc::new(
            CapabilityToken::create(capability_type, patterns, ops, Constraints::default())
                .unwrap(),
        )
    }

    #[test]
    fn test_exact_grant_accepts() {
        let declared = decl("FileRead", &["data/*.csv"], &["read"]);
        let granted = vec![grant("file", &["data/*.csv"], &["read"])];
        assert!(validate_declaration(&declared, &granted).is_ok());
    }

    #[test]
    fn test_wider_grant_accepts() {
        let declared = decl("FileRead", &["data/*.csv"], &["read"]);
        let granted = vec![grant("file", &["data/**"], &["read", "write"])];
        assert!(validate_declaration(&declared, &granted).is_ok());
    }

    #[test]
    fn test_narrower_grant_rejects() {
        // Granted only the literal file, declared the glob.
        let declared = decl("FileRead", &["data/*.csv"], &["read"]);
        let granted = vec![grant("file", &["data/a.csv"], &["read"])];
        let err = validate_declaration(&declared, &granted).unwrap_err();
        assert!(matches!(err, CapabilityError::DeclarationNotCovered { .. }));
    }

    #[test]
    fn test_missing_operation_rejects() {
        let declared = decl("FileWrite", &["data/*"], &["read", "write"]);
        let granted = vec![grant("file", &["data/**"], &["read"])];
        assert!(validate_declaration(&declared, &granted).is_err());
    }

    #[test]
    fn test_wrong_type_rejects() {
        let declared = decl("NetworkAccess", &["api.example.com/*"], &["get"]);
        let granted = vec![grant("file", &["**"], &["get"])];
        let err = validate_declaration(&declared, &granted).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("network"), "{}", text);
    }

    #[test]
    fn test_second_candidate_can_cover() {
        let declared = decl("FileRead", &["data/*.csv"], &["read"]);
        let granted = vec![
            grant("file", &["logs/**"], &["read"]),
            grant("file", &["data/**"], &["read"]),
        ];
        assert!(validate_declaration(&declared, &granted).is_ok());
    }

    #[test]
    fn test_malformed_declaration_rejects() {
        let declared = decl("FileRead", &[], &["read"]);
        assert!(matches!(
            validate_declaration(&declared, &[]),
            Err(CapabilityError::InvalidDeclaration { .. })
        ));

        let declared = decl("FileRead", &["data/*"], &[]);
        assert!(matches!(
            validate_declaration(&declared, &[]),
            Err(CapabilityError::InvalidDeclaration { .. })
        ));
    }

    #[test]
    fn test_validate_all_short_circuits() {
        let a = decl("FileRead", &["data/*.csv"], &["read"]);
        let b = decl("NetworkAccess", &["api/*"], &["get"]);
        let granted = vec![grant("file", &["data/**"], &["read"])];
        let err = validate_all(&[&a, &b], &granted).unwrap_err();
        assert!(err.to_string().contains("NetworkAccess"));
    }
}
