//! Change notification and the `Diffable` contract shared by every
//! generated record.

use std::fmt::Debug;

use crate::error::CoreError;
use crate::ids::RecordId;
use crate::message::RecordMessage;

/// Receives dirty-field count changes from a local view.
///
/// `fields` is the number of dirty fields after the change. `fields_delta`
/// is how that count moved: `1` when a field became dirty, `-1` when one
/// became clean, `0` when an already-dirty field took another value.
pub trait DeltaListener {
    fn on_delta_change(&mut self, fields: usize, fields_delta: i32);
}

impl<F: FnMut(usize, i32)> DeltaListener for F {
    fn on_delta_change(&mut self, fields: usize, fields_delta: i32) {
        self(fields, fields_delta)
    }
}

/// Listener that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl DeltaListener for Detached {
    fn on_delta_change(&mut self, _fields: usize, _fields_delta: i32) {}
}

/// Counts notifications without reacting to them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeRecorder {
    notifications: usize,
    fields: usize,
}

impl ChangeRecorder {
    pub fn notifications(&self) -> usize {
        self.notifications
    }

    pub fn changed(&self) -> bool {
        self.notifications > 0
    }

    /// Field count carried by the most recent notification.
    pub fn fields(&self) -> usize {
        self.fields
    }
}

impl DeltaListener for ChangeRecorder {
    fn on_delta_change(&mut self, fields: usize, _fields_delta: i32) {
        self.notifications += 1;
        self.fields = fields;
    }
}

/// Folds a nested set's aggregate into its parent record.
///
/// The whole set counts as one field of the parent: it becomes dirty when
/// the set's count leaves zero and clean when it returns to zero.
pub struct NestedListener<'a> {
    parent_fields: &'a mut usize,
    outer: &'a mut dyn DeltaListener,
}

impl<'a> NestedListener<'a> {
    pub fn new(parent_fields: &'a mut usize, outer: &'a mut dyn DeltaListener) -> Self {
        Self {
            parent_fields,
            outer,
        }
    }
}

impl DeltaListener for NestedListener<'_> {
    fn on_delta_change(&mut self, fields: usize, fields_delta: i32) {
        if fields == 0 && fields_delta < 0 {
            *self.parent_fields -= 1;
            self.outer.on_delta_change(*self.parent_fields, -1);
        } else if fields_delta > 0 && fields as i32 == fields_delta {
            *self.parent_fields += 1;
            self.outer.on_delta_change(*self.parent_fields, 1);
        } else {
            self.outer.on_delta_change(*self.parent_fields, 0);
        }
    }
}

/// How a write moved a field relative to its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable happened.
    Unchanged,
    /// Clean to dirty.
    Entered,
    /// Dirty before and after, with a new value.
    Updated,
    /// Dirty to clean.
    Left,
}

impl Transition {
    pub fn between(was_dirty: bool, is_dirty: bool) -> Self {
        match (was_dirty, is_dirty) {
            (false, false) => Transition::Unchanged,
            (false, true) => Transition::Entered,
            (true, false) => Transition::Left,
            (true, true) => Transition::Updated,
        }
    }

    pub fn fields_delta(self) -> i32 {
        match self {
            Transition::Entered => 1,
            Transition::Left => -1,
            Transition::Unchanged | Transition::Updated => 0,
        }
    }
}

/// Apply a field transition to a record's counter and notify.
pub fn notify(fields: &mut usize, transition: Transition, listener: &mut dyn DeltaListener) {
    match transition {
        Transition::Unchanged => {}
        Transition::Entered => {
            *fields += 1;
            listener.on_delta_change(*fields, 1);
        }
        Transition::Updated => listener.on_delta_change(*fields, 0),
        Transition::Left => {
            *fields -= 1;
            listener.on_delta_change(*fields, -1);
        }
    }
}

/// A record whose local edits are tracked against a remote baseline.
///
/// Implementations are generated by [`diffable_record!`](crate::diffable_record).
pub trait Diffable: Clone + Debug + Send + 'static {
    /// Sparse snapshot of the outstanding changes.
    type Delta: Clone + Debug + Default + PartialEq + Send + 'static;

    /// Live editing view bound to a listener.
    type Local<'a>
    where
        Self: 'a;

    /// Build a clean record whose remote and local state both equal `message`.
    fn from_message(message: &RecordMessage) -> Result<Self, CoreError>;

    fn id(&self) -> RecordId;

    /// Number of dirty fields; a nested set counts as one.
    fn fields(&self) -> usize;

    fn is_dirty(&self) -> bool {
        self.fields() > 0
    }

    /// Open a local view that reports every change to `listener`.
    fn local<'a>(&'a mut self, listener: &'a mut dyn DeltaListener) -> Self::Local<'a>;

    fn delta(&self) -> Self::Delta;

    /// Patch carrying the outstanding delta.
    fn serialize(&self) -> RecordMessage;

    /// Fail if `commit` names a nested element this record does not hold.
    fn check_commit(&self, commit: &Self::Delta) -> Result<(), CoreError>;

    /// Advance the remote baseline by a delta the server accepted.
    ///
    /// Either the whole delta is applied or, on error, none of it.
    fn commit(&mut self, commit: &Self::Delta) -> Result<(), CoreError>;

    /// Note that the current delta is about to leave for the server.
    fn mark_sent(&mut self);

    /// Forget bookkeeping from a send attempt that failed.
    fn rollback(&mut self, attempted: &Self::Delta);

    fn remote_message(&self) -> RecordMessage;

    fn local_message(&self) -> RecordMessage;

    /// Patch and commit snapshot for the outstanding delta, or `None` when
    /// there is nothing to send.
    fn synchronize(&mut self) -> Option<(RecordMessage, Self::Delta)> {
        if self.fields() == 0 {
            return None;
        }
        let attempt = (self.serialize(), self.delta());
        self.mark_sent();
        Some(attempt)
    }
}
