//! Process-wide capability manager.
//!
//! The manager owns named root contexts and tracks a per-thread current
//! context. Scoped acquisition (`CapabilityManager::enter`) pushes a child
//! context and returns an RAII guard, so every unwind path releases the
//! context again. Manager-level mutations are serialized by a single lock
//! with acquire ordering manager -> context -> token.

use crate::capability::context::CapabilityContext;
use crate::capability::token::CapabilityToken;
use crate::error::CapabilityError;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

static MANAGER: Lazy<CapabilityManager> = Lazy::new(CapabilityManager::new);

thread_local! {
    static CURRENT: RefCell<Vec<Arc<CapabilityContext>>> = const { RefCell::new(Vec::new()) };
}

pub struct CapabilityManager {
    roots: Mutex<HashMap<String, Arc<CapabilityContext>>>,
}

impl CapabilityManager {
    fn new() -> Self {
        CapabilityManager {
            roots: Mutex::new(HashMap::new()),
        }
    }

    /// The process singleton.
    pub fn global() -> &'static CapabilityManager {
        &MANAGER
    }

    /// Create and register a named root context holding `tokens`. Replaces
    /// any previous root of the same name.
    pub fn create_root(
        &self,
        name: impl Into<String>,
        tokens: Vec<Arc<CapabilityToken>>,
    ) -> Arc<CapabilityContext> {
        let name = name.into();
        let context = CapabilityContext::root(name.clone(), tokens);
        self.roots
            .lock()
            .expect("manager lock")
            .insert(name, Arc::clone(&context));
        context
    }

    pub fn get_root(&self, name: &str) -> Option<Arc<CapabilityContext>> {
        self.roots.lock().expect("manager lock").get(name).cloned()
    }

    /// The calling thread's current context, if inside a scope.
    pub fn current_context(&self) -> Option<Arc<CapabilityContext>> {
        CURRENT.with(|stack| stack.borrow().last().cloned())
    }

    /// Scoped acquisition: enter a child context of the calling thread's
    /// current context (or a fresh root when there is none) holding `tokens`.
    /// The returned guard pops the context when dropped, on any exit path.
    pub fn enter(
        &self,
        name: impl Into<String>,
        tokens: Vec<Arc<CapabilityToken>>,
    ) -> ContextGuard {
        let name = name.into();
        let context = match self.current_context() {
            Some(parent) => CapabilityContext::child(&parent, name.clone(), tokens),
            None => CapabilityContext::root(name.clone(), tokens),
        };
        debug!(context = %name, "entering capability context");
        CURRENT.with(|stack| stack.borrow_mut().push(Arc::clone(&context)));
        ContextGuard { context }
    }

    /// Convenience used by emitted code and bridges: does the current
    /// context (or an ancestor) hold a valid token of this type?
    pub fn has_capability(&self, capability_type: &str) -> bool {
        match self.current_context() {
            Some(context) => context.has_capability(capability_type).unwrap_or(false),
            None => false,
        }
    }

    /// Resolve a token of the given type from the current context.
    pub fn get_capability(
        &self,
        capability_type: &str,
    ) -> Result<Arc<CapabilityToken>, CapabilityError> {
        match self.current_context() {
            Some(context) => context.get_capability(capability_type),
            None => Err(CapabilityError::NotFound(capability_type.to_string())),
        }
    }

    /// Full gate for one external operation: resolve the token, check the
    /// resource and operation, and consume one use.
    pub fn check_access(
        &self,
        capability_type: &str,
        resource: &str,
        operation: &str,
    ) -> Result<(), CapabilityError> {
        let token = self.get_capability(capability_type)?;
        if !token.can_access(resource, operation) {
            return Err(CapabilityError::Denied {
                capability_type: capability_type.to_string(),
                resource: resource.to_string(),
                operation: operation.to_string(),
                reason: denial_reason(&token, resource, operation),
            });
        }
        token.use_once()?;
        Ok(())
    }

    /// Sweep expired tokens out of every context tree this manager created.
    /// Returns the number of tokens removed.
    pub fn sweep_expired(&self) -> usize {
        let roots: Vec<Arc<CapabilityContext>> = self
            .roots
            .lock()
            .expect("manager lock")
            .values()
            .cloned()
            .collect();
        let removed: usize = roots.iter().map(|root| root.sweep_expired()).sum();
        if removed > 0 {
            debug!(removed, "swept expired capability tokens");
        }
        removed
    }

    /// Remove a named root. Used by tests and by sandbox teardown.
    pub fn remove_root(&self, name: &str) -> bool {
        self.roots.lock().expect("manager lock").remove(name).is_some()
    }
}

fn denial_reason(token: &CapabilityToken, resource: &str, operation: &str) -> String {
    if !token.checksum_valid() {
        "token checksum mismatch".to_string()
    } else if token.is_expired() {
        "token has expired".to_string()
    } else if !token.operations().contains(operation) {
        format!("operation `{}` is not allowed", operation)
    } else if !token
        .resource_patterns()
        .iter()
        .any(|p| p.matches(resource))
    {
        format!("no resource pattern matches `{}`", resource)
    } else {
        "usage budget exhausted".to_string()
    }
}

/// RAII guard returned by `CapabilityManager::enter`.
pub struct ContextGuard {
    context: Arc<CapabilityContext>,
}

impl ContextGuard {
    pub fn context(&self) -> &Arc<CapabilityContext> {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            // Pop our context; tolerate a disordered stack rather than
            // panicking during unwinding.
            if let Some(position) = stack
                .iter()
                .rposition(|ctx| Arc::ptr_eq(ctx, &self.context))
            {
                stack.remove(position);
            }
        });
        debug!(context = %self.context.name(), "left capability context");
    }
}
