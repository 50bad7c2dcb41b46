//! Capability contexts.
//!
//! Contexts form a tree: a child holds its own tokens and inherits the rest
//! by walking toward the root. The child->parent edge is a `Weak` reference
//! used only for lookup, so there is no cyclic strong ownership. A context is
//! owned by the thread that created it; using it from another thread is an
//! error. Parent pointers are immutable once set, which keeps the ancestor
//! walk lock-free; only the token list takes a short lock (it is mutated by
//! the manager's expiry sweep).

use crate::capability::token::CapabilityToken;
use crate::error::CapabilityError;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

pub struct CapabilityContext {
    name: String,
    parent: Option<Weak<CapabilityContext>>,
    /// Insertion-ordered `type -> token` map.
    tokens: Mutex<Vec<(String, Arc<CapabilityToken>)>>,
    children: Mutex<Vec<Weak<CapabilityContext>>>,
    owner_thread: ThreadId,
}

impl CapabilityContext {
    /// Create a root context holding `tokens`.
    pub fn root(name: impl Into<String>, tokens: Vec<Arc<CapabilityToken>>) -> Arc<Self> {
        Arc::new(CapabilityContext {
            name: name.into(),
            parent: None,
            tokens: Mutex::new(index_tokens(tokens)),
            children: Mutex::new(Vec::new()),
            owner_thread: thread::current().id(),
        })
    }

    /// Create a child of `parent`. May be called from any thread; the child
    /// is owned by the calling thread.
    pub fn child(
        parent: &Arc<CapabilityContext>,
        name: impl Into<String>,
        tokens: Vec<Arc<CapabilityToken>>,
    ) -> Arc<Self> {
        let child = Arc::new(CapabilityContext {
            name: name.into(),
            parent: Some(Arc::downgrade(parent)),
            tokens: Mutex::new(index_tokens(tokens)),
            children: Mutex::new(Vec::new()),
            owner_thread: thread::current().id(),
        });
        parent
            .children
            .lock()
            .expect("context children lock")
            .push(Arc::downgrade(&child));
        child
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<CapabilityContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.owner_thread
    }

    fn ensure_owned_by_current(&self) -> Result<(), CapabilityError> {
        if self.owner_thread == thread::current().id() {
            Ok(())
        } else {
            Err(CapabilityError::WrongThread {
                context: self.name.clone(),
            })
        }
    }

    /// Token of `capability_type` held directly by this context.
    fn own_token(&self, capability_type: &str) -> Option<Arc<CapabilityToken>> {
        self.tokens
            .lock()
            .expect("context token lock")
            .iter()
            .find(|(ty, _)| ty == capability_type)
            .map(|(_, token)| Arc::clone(token))
    }

    /// Walks the parent chain; true if any ancestor holds a currently valid
    /// token of the given type.
    pub fn has_capability(&self, capability_type: &str) -> Result<bool, CapabilityError> {
        self.ensure_owned_by_current()?;
        Ok(self.lookup(capability_type).is_some())
    }

    /// First token of the given type found walking toward the root.
    pub fn get_capability(
        &self,
        capability_type: &str,
    ) -> Result<Arc<CapabilityToken>, CapabilityError> {
        self.ensure_owned_by_current()?;
        self.lookup(capability_type)
            .ok_or_else(|| CapabilityError::NotFound(capability_type.to_string()))
    }

    fn lookup(&self, capability_type: &str) -> Option<Arc<CapabilityToken>> {
        if let Some(token) = self.own_token(capability_type) {
            if token.is_valid() {
                return Some(token);
            }
        }
        let mut ancestor = self.parent();
        while let Some(ctx) = ancestor {
            if let Some(token) = ctx.own_token(capability_type) {
                if token.is_valid() {
                    return Some(token);
                }
            }
            ancestor = ctx.parent();
        }
        None
    }

    /// All tokens held directly by this context, in insertion order.
    pub fn own_tokens(&self) -> Vec<Arc<CapabilityToken>> {
        self.tokens
            .lock()
            .expect("context token lock")
            .iter()
            .map(|(_, token)| Arc::clone(token))
            .collect()
    }

    /// Drop expired tokens from this context and every live descendant.
    /// Returns the number of tokens removed.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = {
            let mut tokens = self.tokens.lock().expect("context token lock");
            let before = tokens.len();
            tokens.retain(|(_, token)| !token.is_expired());
            before - tokens.len()
        };

        let mut children = self.children.lock().expect("context children lock");
        children.retain(|weak| weak.upgrade().is_some());
        let live: Vec<Arc<CapabilityContext>> =
            children.iter().filter_map(Weak::upgrade).collect();
        drop(children);

        for child in live {
            removed += child.sweep_expired();
        }
        removed
    }
}

fn index_tokens(tokens: Vec<Arc<CapabilityToken>>) -> Vec<(String, Arc<CapabilityToken>)> {
    tokens
        .into_iter()
        .map(|token| (token.capability_type().to_string(), token))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::token::Constraints;
    use chrono::Duration;

    fn token(capability_type: &str) -> Arc<CapabilityToken> {
        Arc::new(
            CapabilityToken::create(capability_type, &["**"], &["read"], Constraints::default())
                .unwrap(),
        )
    }

    #[test]
    fn test_child_inherits_by_walking() {
        let root = CapabilityContext::root("root", vec![token("file")]);
        let child = CapabilityContext::child(&root, "child", vec![token("network")]);

        assert!(child.has_capability("network").unwrap());
        assert!(child.has_capability("file").unwrap());
        assert!(!root.has_capability("network").unwrap());
    }

    #[test]
    fn test_child_shadows_parent() {
        let parent_token = token("file");
        let child_token = token("file");
        let root = CapabilityContext::root("root", vec![Arc::clone(&parent_token)]);
        let child = CapabilityContext::child(&root, "child", vec![Arc::clone(&child_token)]);

        let found = child.get_capability("file").unwrap();
        assert_eq!(found.id(), child_token.id());
    }

    #[test]
    fn test_missing_capability() {
        let root = CapabilityContext::root("root", vec![]);
        assert!(!root.has_capability("file").unwrap());
        assert!(matches!(
            root.get_capability("file"),
            Err(CapabilityError::NotFound(_))
        ));
    }

    #[test]
    fn test_expired_token_is_invisible() {
        let expired = Arc::new(
            CapabilityToken::create(
                "file",
                &["**"],
                &["read"],
                Constraints::default().with_ttl(Duration::milliseconds(-1)),
            )
            .unwrap(),
        );
        let root = CapabilityContext::root("root", vec![expired]);
        assert!(!root.has_capability("file").unwrap());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let expired = Arc::new(
            CapabilityToken::create(
                "file",
                &["**"],
                &["read"],
                Constraints::default().with_ttl(Duration::milliseconds(-1)),
            )
            .unwrap(),
        );
        let root = CapabilityContext::root("root", vec![expired, token("network")]);
        let child = CapabilityContext::child(&root, "child", vec![]);
        assert_eq!(root.sweep_expired(), 1);
        assert_eq!(root.own_tokens().len(), 1);
        assert_eq!(child.sweep_expired(), 0);
    }

    #[test]
    fn test_cross_thread_use_is_forbidden() {
        let root = CapabilityContext::root("root", vec![token("file")]);
        let root_for_thread = Arc::clone(&root);
        let result = thread::spawn(move || root_for_thread.has_capability("file"))
            .join()
            .unwrap();
        assert!(matches!(result, Err(CapabilityError::WrongThread { .. })));
    }

    #[test]
    fn test_no_strong_parent_cycle() {
        let root = CapabilityContext::root("root", vec![]);
        let child = CapabilityContext::child(&root, "child", vec![]);
        drop(root);
        // Parent is gone; the walk just stops.
        assert!(!child.has_capability("file").unwrap());
        assert!(child.parent().is_none());
    }
}
