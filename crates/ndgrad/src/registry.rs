//! Bookkeeping of created values for leak detection.
//!
//! Payloads may own native state that has to be released explicitly. A
//! [`Registry`] collects the values created by the graphs it is attached to,
//! so shutdown or test code can check that every one of them was closed.
//! Registries are grouped in a [`Registries`] context that is created and
//! passed down by the caller.

use crate::error::AutogradError;
use log::{info, warn};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::rc::Rc;

/// Anything a registry can track.
pub trait Resource {
    /// Whether the resource was released.
    fn is_closed(&self) -> bool;

    /// Release the resource. Closing twice has no further effect.
    fn close(&self);

    /// Label used in status reports.
    fn describe(&self) -> String;
}

/// Snapshot of one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    /// Registry name.
    pub name: String,
    /// Number of registered resources.
    pub registered: usize,
    /// Number of registered resources still open.
    pub open: usize,
}

/// Named collection of registered resources.
pub struct Registry {
    name: String,
    entries: RefCell<Vec<Rc<dyn Resource>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Track `resource`.
    pub fn register(&self, resource: Rc<dyn Resource>) {
        self.entries.borrow_mut().push(resource);
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Whether every tracked resource is closed.
    pub fn all_closed(&self) -> bool {
        self.entries.borrow().iter().all(|entry| entry.is_closed())
    }

    /// Close every tracked resource that is still open.
    pub fn close(&self) {
        for entry in self.entries.borrow().iter() {
            if !entry.is_closed() {
                entry.close();
            }
        }
    }

    /// Forget every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::UnclosedValues`] and keeps the entries if any
    /// of them is still open.
    pub fn clear(&self) -> Result<(), AutogradError> {
        let open = self.open_count();
        if open > 0 {
            warn!("registry `{}` refused to clear: {open} values still open", self.name);
            return Err(AutogradError::UnclosedValues {
                registry: self.name.clone(),
                open,
            });
        }
        self.drain();
        Ok(())
    }

    /// Stop tracking the resources at the given addresses without closing
    /// them. Used for values a graph released itself.
    pub(crate) fn forget(&self, released: &HashSet<*const ()>) {
        self.entries
            .borrow_mut()
            .retain(|entry| !released.contains(&(Rc::as_ptr(entry) as *const ())));
    }

    // Newest first: a resource may hold on to older ones.
    fn drain(&self) {
        let mut entries = self.entries.borrow_mut();
        while entries.pop().is_some() {}
    }

    /// Current counts. With `print`, the counts and the open entries are
    /// logged at info level.
    pub fn status(&self, print: bool) -> RegistryStatus {
        let status = RegistryStatus {
            name: self.name.clone(),
            registered: self.len(),
            open: self.open_count(),
        };
        if print {
            info!(
                "registry `{}`: {} registered, {} open",
                status.name, status.registered, status.open
            );
            for entry in self.entries.borrow().iter().filter(|e| !e.is_closed()) {
                info!("  open: {}", entry.describe());
            }
        }
        status
    }

    fn open_count(&self) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|entry| !entry.is_closed())
            .count()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.drain();
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("registered", &self.len())
            .field("open", &self.open_count())
            .finish()
    }
}

/// Set of registries sharing one lifecycle.
#[derive(Debug, Default)]
pub struct Registries {
    registries: RefCell<Vec<Rc<Registry>>>,
}

impl Registries {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry and add it to the set.
    pub fn create(&self, name: impl Into<String>) -> Rc<Registry> {
        let registry = Rc::new(Registry::new(name));
        self.registries.borrow_mut().push(Rc::clone(&registry));
        registry
    }

    /// Number of registries.
    pub fn len(&self) -> usize {
        self.registries.borrow().len()
    }

    /// Whether no registry was created.
    pub fn is_empty(&self) -> bool {
        self.registries.borrow().is_empty()
    }

    /// Whether every value of every registry is closed.
    pub fn all_closed(&self) -> bool {
        self.registries.borrow().iter().all(|r| r.all_closed())
    }

    /// Close every value of every registry.
    pub fn close(&self) {
        for registry in self.registries.borrow().iter() {
            registry.close();
        }
    }

    /// Clear every registry.
    ///
    /// Stops at the first registry holding open values.
    pub fn clear(&self) -> Result<(), AutogradError> {
        for registry in self.registries.borrow().iter() {
            registry.clear()?;
        }
        Ok(())
    }

    /// Status of every registry.
    pub fn status(&self, print: bool) -> Vec<RegistryStatus> {
        self.registries
            .borrow()
            .iter()
            .map(|r| r.status(print))
            .collect()
    }
}
