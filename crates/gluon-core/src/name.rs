// NameManager — Deterministic automatic names
//
// Unnamed entities (blocks, symbols) get names of the form "<hint><n>",
// where n counts per hint inside the active manager:
//
//   get(None, "dense") → "dense0"
//   get(None, "dense") → "dense1"
//   get(None, "conv")  → "conv0"
//   get(Some("out"), "dense") → "out"     (counter untouched)
//
// Managers form a thread-local stack that always holds a root manager.
// `enter()` pushes and returns a guard; dropping the guard pops back,
// including during early returns and unwinding. A `Prefix` manager
// prepends a fixed string to whatever it returns, explicit names too.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{Error, Result};

/// Produces names from hints with per-hint counters.
#[derive(Debug, Default)]
pub struct NameManager {
    counter: RefCell<HashMap<String, usize>>,
    prefix: Option<String>,
}

thread_local! {
    static STACK: RefCell<Vec<Rc<NameManager>>> = RefCell::new(vec![Rc::new(NameManager::new())]);
}

impl NameManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager that prefixes every name it returns.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        NameManager {
            counter: RefCell::default(),
            prefix: Some(prefix.into()),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// The innermost active manager on this thread.
    pub fn current() -> Rc<NameManager> {
        STACK.with(|s| {
            let stack = s.borrow();
            match stack.last() {
                Some(top) => Rc::clone(top),
                None => Rc::new(NameManager::new()),
            }
        })
    }

    /// `explicit` unchanged if given, else `"{hint}{n}"` with the per-hint
    /// counter incremented. A prefix manager prepends its prefix either way.
    pub fn get(&self, explicit: Option<&str>, hint: &str) -> String {
        let name = match explicit {
            Some(name) => name.to_string(),
            None => {
                let mut counter = self.counter.borrow_mut();
                let n = counter.entry(hint.to_string()).or_insert(0);
                let name = format!("{hint}{n}");
                *n += 1;
                name
            }
        };
        match &self.prefix {
            Some(p) => format!("{p}{name}"),
            None => name,
        }
    }

    /// The number the next unnamed `hint` would receive.
    pub fn next_count_for(&self, hint: &str) -> usize {
        self.counter.borrow().get(hint).copied().unwrap_or(0)
    }

    /// Make this manager current until the returned scope ends.
    pub fn enter(self: &Rc<Self>) -> NameScope {
        let depth = STACK.with(|s| {
            let mut stack = s.borrow_mut();
            let depth = stack.len();
            stack.push(Rc::clone(self));
            depth
        });
        NameScope {
            manager: Rc::clone(self),
            depth,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this manager current.
    pub fn with<R>(self: &Rc<Self>, f: impl FnOnce() -> R) -> R {
        let _scope = self.enter();
        f()
    }

    /// Pop this manager off the stack.
    ///
    /// Fails with `ScopeImbalance` unless this manager is the innermost
    /// entered one. The root manager can never be exited.
    pub fn exit(self: &Rc<Self>) -> Result<()> {
        STACK.with(|s| {
            let mut stack = s.borrow_mut();
            let on_top = stack.len() > 1 && stack.last().is_some_and(|top| Rc::ptr_eq(top, self));
            if !on_top {
                return Err(Error::ScopeImbalance(
                    "exit() called on a name manager that is not the current entered scope".into(),
                ));
            }
            stack.pop();
            Ok(())
        })
    }
}

/// Active naming scope. Restores the enclosing manager when dropped.
#[must_use = "the name manager is exited as soon as the scope is dropped"]
pub struct NameScope {
    manager: Rc<NameManager>,
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl NameScope {
    pub fn manager(&self) -> &Rc<NameManager> {
        &self.manager
    }

    /// End the scope now, reporting imbalance instead of silently repairing it.
    pub fn exit(self) -> Result<()> {
        let result = self.manager.exit();
        // Drop still truncates to `depth`, covering scopes leaked above us.
        drop(self);
        result
    }
}

impl Drop for NameScope {
    fn drop(&mut self) {
        STACK.with(|s| {
            let mut stack = s.borrow_mut();
            if stack.len() > self.depth {
                stack.truncate(self.depth);
            }
        });
    }
}
