use crate::diff::Transition;
use crate::field_value::FieldType;

/// A single change-tracked field.
///
/// Holds the remote baseline and the local value. The field is dirty
/// exactly when the two differ by content.
#[derive(Debug, Clone)]
pub struct DiffValue<T> {
    remote: T,
    local: T,
    dirty: bool,
}

impl<T: FieldType> DiffValue<T> {
    pub fn new(remote: T) -> Self {
        Self {
            local: remote.clone(),
            remote,
            dirty: false,
        }
    }

    pub fn get(&self) -> &T {
        &self.local
    }

    pub fn remote(&self) -> &T {
        &self.remote
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The outstanding delta entry, if any.
    pub fn delta(&self) -> Option<&T> {
        self.dirty.then_some(&self.local)
    }

    pub fn set(&mut self, value: T) -> Transition {
        if self.local.same(&value) {
            return Transition::Unchanged;
        }
        let was_dirty = self.dirty;
        self.local = value;
        self.dirty = !self.local.same(&self.remote);
        Transition::between(was_dirty, self.dirty)
    }

    /// Advance the baseline to a value the server accepted.
    ///
    /// The local value is left alone, so a write made while the value was in
    /// flight stays dirty unless it happens to equal what was committed.
    pub fn commit(&mut self, committed: &T) -> Transition {
        let was_dirty = self.dirty;
        self.remote = committed.clone();
        self.dirty = !self.local.same(&self.remote);
        match Transition::between(was_dirty, self.dirty) {
            Transition::Updated => Transition::Unchanged,
            other => other,
        }
    }
}
