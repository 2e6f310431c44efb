//! Diffable sets of nested records.
//!
//! A set tracks its members' presence alongside their own deltas. In an
//! ordered set presence is the element's position; in an unordered set it
//! is a `deleted` flag. A freshly added element has no remote presence, so
//! it is dirty until the server confirms it.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ops::Deref;

use crate::diff::{ChangeRecorder, DeltaListener, Diffable, NestedListener};
use crate::error::CoreError;
use crate::ids::RecordId;
use crate::message::RecordMessage;
use crate::value::DiffValue;

/// Position of an element that is not in an ordered set.
pub const ABSENT_POSITION: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    /// Keyed by id; removal is a `deleted` flag.
    Unordered,
    /// Keyed by id and sorted by position; removal is [`ABSENT_POSITION`].
    Ordered,
}

/// Outstanding change of one element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementDelta<D> {
    pub record: D,
    pub position: Option<i64>,
    pub deleted: Option<bool>,
}

pub type SetDelta<D> = BTreeMap<RecordId, ElementDelta<D>>;

#[derive(Debug, Clone)]
struct Entry<R> {
    kind: SetKind,
    record: R,
    position: DiffValue<i64>,
    deleted: DiffValue<bool>,
    // The element's creation has left for the server at least once.
    sent: bool,
}

impl<R: Diffable> Entry<R> {
    fn loaded(kind: SetKind, record: R, position: i64) -> Self {
        Self {
            kind,
            record,
            position: DiffValue::new(position),
            deleted: DiffValue::new(false),
            sent: false,
        }
    }

    fn placeholder(kind: SetKind, record: R, position: i64) -> Self {
        let mut entry = Self {
            kind,
            record,
            position: DiffValue::new(ABSENT_POSITION),
            deleted: DiffValue::new(true),
            sent: false,
        };
        match kind {
            SetKind::Ordered => {
                entry.deleted = DiffValue::new(false);
                entry.position.set(position);
            }
            SetKind::Unordered => {
                entry.position = DiffValue::new(0);
                entry.deleted.set(false);
            }
        }
        entry
    }

    fn is_present(&self) -> bool {
        match self.kind {
            SetKind::Ordered => *self.position.get() != ABSENT_POSITION,
            SetKind::Unordered => !*self.deleted.get(),
        }
    }

    fn is_remote_present(&self) -> bool {
        match self.kind {
            SetKind::Ordered => *self.position.remote() != ABSENT_POSITION,
            SetKind::Unordered => !*self.deleted.remote(),
        }
    }

    fn presence_dirty(&self) -> bool {
        self.position.is_dirty() || self.deleted.is_dirty()
    }

    // A removed element only carries its removal; its own edits are moot.
    fn fields(&self) -> usize {
        let presence = usize::from(self.presence_dirty());
        if self.is_present() {
            self.record.fields() + presence
        } else {
            presence
        }
    }

    fn is_dirty(&self) -> bool {
        self.fields() > 0
    }

    fn is_dead(&self) -> bool {
        !self.is_present() && !self.is_remote_present() && !self.is_dirty()
    }

    fn mark_absent(&mut self) {
        match self.kind {
            SetKind::Ordered => {
                self.position.set(ABSENT_POSITION);
            }
            SetKind::Unordered => {
                self.deleted.set(true);
            }
        }
    }

    fn reinstate(&mut self, next_position: &mut i64) {
        match self.kind {
            SetKind::Ordered => {
                let position = if self.is_remote_present() {
                    *self.position.remote()
                } else {
                    allocate(next_position)
                };
                self.position.set(position);
            }
            SetKind::Unordered => {
                self.deleted.set(false);
            }
        }
    }

    fn delta(&self) -> Option<ElementDelta<R::Delta>> {
        if !self.is_dirty() {
            return None;
        }
        Some(ElementDelta {
            record: if self.is_present() {
                self.record.delta()
            } else {
                R::Delta::default()
            },
            position: self.position.delta().copied(),
            deleted: self.deleted.delta().copied(),
        })
    }

    fn serialize(&self) -> Option<RecordMessage> {
        if !self.is_dirty() {
            return None;
        }
        let mut message = if self.is_present() {
            self.record.serialize()
        } else {
            RecordMessage::new(self.record.id())
        };
        if self.position.is_dirty() {
            message.position = Some(*self.position.remote());
            message.swap_position = Some(*self.position.get());
        }
        message.deleted = self.deleted.delta().copied();
        Some(message)
    }
}

fn allocate(next_position: &mut i64) -> i64 {
    let position = *next_position;
    *next_position += 1;
    position
}

/// A keyed collection of diffable records.
///
/// `fields` counts the elements with an outstanding delta. A parent record
/// sees the whole set as a single field through [`NestedListener`].
#[derive(Debug, Clone)]
pub struct DiffableSet<R> {
    kind: SetKind,
    entries: BTreeMap<RecordId, Entry<R>>,
    fields: usize,
    next_position: i64,
}

impl<R: Diffable> DiffableSet<R> {
    pub fn new(kind: SetKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            fields: 0,
            next_position: 0,
        }
    }

    /// Clean set from the children of a loaded record.
    pub fn from_messages(kind: SetKind, messages: &[RecordMessage]) -> Result<Self, CoreError> {
        let mut set = Self::new(kind);
        for message in messages {
            if message.deleted == Some(true) {
                continue;
            }
            let position = match kind {
                SetKind::Unordered => 0,
                SetKind::Ordered => match message.position {
                    Some(position) if position >= 0 => position,
                    _ => {
                        return Err(CoreError::InvalidData(format!(
                            "ordered element {} has no position",
                            message.id
                        )));
                    }
                },
            };
            if kind == SetKind::Ordered
                && set.entries.values().any(|e| *e.position.get() == position)
            {
                return Err(CoreError::InvalidData(format!(
                    "two elements share position {position}"
                )));
            }
            let record = R::from_message(message)?;
            let id = record.id();
            if set
                .entries
                .insert(id, Entry::loaded(kind, record, position))
                .is_some()
            {
                return Err(CoreError::DuplicateElement(id));
            }
            set.next_position = set.next_position.max(position + 1);
        }
        Ok(set)
    }

    pub fn kind(&self) -> SetKind {
        self.kind
    }

    pub fn fields(&self) -> usize {
        self.fields
    }

    pub fn is_dirty(&self) -> bool {
        self.fields > 0
    }

    /// Number of locally present elements.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.is_present()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.entries.get(&id).is_some_and(Entry::is_present)
    }

    pub fn get(&self, id: RecordId) -> Option<&R> {
        self.entries
            .get(&id)
            .filter(|e| e.is_present())
            .map(|e| &e.record)
    }

    /// Local position of a present element of an ordered set.
    pub fn position(&self, id: RecordId) -> Option<i64> {
        match self.kind {
            SetKind::Unordered => None,
            SetKind::Ordered => self
                .entries
                .get(&id)
                .filter(|e| e.is_present())
                .map(|e| *e.position.get()),
        }
    }

    /// Ids of the present elements, by position for an ordered set.
    pub fn ids(&self) -> Vec<RecordId> {
        let mut present: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_present())
            .map(|(id, e)| (*e.position.get(), *id))
            .collect();
        if self.kind == SetKind::Ordered {
            present.sort_unstable();
        }
        present.into_iter().map(|(_, id)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> + '_ {
        self.ids()
            .into_iter()
            .filter_map(move |id| self.entries.get(&id).map(|e| &e.record))
    }

    /// Introduce an element.
    ///
    /// The returned handle edits the new element; one aggregate
    /// notification fires when it is dropped. Adding an id whose removal is
    /// still pending reinstates that element and keeps its record.
    pub fn add<'s>(
        &'s mut self,
        remote: R,
        listener: &'s mut dyn DeltaListener,
    ) -> Result<ElementMut<'s, R>, CoreError> {
        let id = remote.id();
        let kind = self.kind;
        let (entry, was_dirty) = match self.entries.entry(id) {
            btree_map::Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                if entry.is_present() {
                    return Err(CoreError::DuplicateElement(id));
                }
                let was_dirty = entry.is_dirty();
                entry.reinstate(&mut self.next_position);
                (entry, was_dirty)
            }
            btree_map::Entry::Vacant(slot) => {
                let position = match kind {
                    SetKind::Ordered => allocate(&mut self.next_position),
                    SetKind::Unordered => 0,
                };
                (slot.insert(Entry::placeholder(kind, remote, position)), false)
            }
        };
        Ok(ElementMut {
            entry,
            set_fields: &mut self.fields,
            listener,
            was_dirty,
            recorder: ChangeRecorder::default(),
            announce: true,
        })
    }

    /// Edit a present element.
    pub fn update<'s>(
        &'s mut self,
        id: RecordId,
        listener: &'s mut dyn DeltaListener,
    ) -> Result<ElementMut<'s, R>, CoreError> {
        let entry = self
            .entries
            .get_mut(&id)
            .filter(|e| e.is_present())
            .ok_or(CoreError::UnknownElement(id))?;
        let was_dirty = entry.is_dirty();
        Ok(ElementMut {
            entry,
            set_fields: &mut self.fields,
            listener,
            was_dirty,
            recorder: ChangeRecorder::default(),
            announce: false,
        })
    }

    /// Remove a present element.
    ///
    /// An element that never left for the server disappears without a
    /// trace; any other element gets a removal delta.
    pub fn remove(
        &mut self,
        id: RecordId,
        listener: &mut dyn DeltaListener,
    ) -> Result<(), CoreError> {
        let entry = self
            .entries
            .get_mut(&id)
            .filter(|e| e.is_present())
            .ok_or(CoreError::UnknownElement(id))?;
        let was_dirty = entry.is_dirty();
        let is_dirty = if !entry.is_remote_present() && !entry.sent {
            self.entries.remove(&id);
            false
        } else {
            entry.mark_absent();
            entry.is_dirty()
        };
        let before = self.fields;
        self.adjust(was_dirty, is_dirty);
        self.announce(before, listener);
        Ok(())
    }

    /// Exchange the positions of two elements of an ordered set as one
    /// change.
    pub fn swap(
        &mut self,
        a: RecordId,
        b: RecordId,
        listener: &mut dyn DeltaListener,
    ) -> Result<(), CoreError> {
        if self.kind != SetKind::Ordered {
            return Err(CoreError::InvalidOperation(
                "swap on an unordered set".into(),
            ));
        }
        let position_a = self.position(a).ok_or(CoreError::UnknownElement(a))?;
        let position_b = self.position(b).ok_or(CoreError::UnknownElement(b))?;
        if a == b {
            return Ok(());
        }
        let before = self.fields;
        for (id, position) in [(a, position_b), (b, position_a)] {
            if let Some(entry) = self.entries.get_mut(&id) {
                let was_dirty = entry.is_dirty();
                entry.position.set(position);
                let is_dirty = entry.is_dirty();
                self.adjust(was_dirty, is_dirty);
            }
        }
        self.announce(before, listener);
        Ok(())
    }

    pub fn delta(&self) -> SetDelta<R::Delta> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.delta().map(|d| (*id, d)))
            .collect()
    }

    /// Emit the patch of every changed element.
    pub fn serialize(&self, mut adder: impl FnMut(RecordMessage)) {
        for entry in self.entries.values() {
            if let Some(message) = entry.serialize() {
                adder(message);
            }
        }
    }

    /// Fail if `delta` names an element this set does not hold.
    pub fn check_commit(&self, delta: &SetDelta<R::Delta>) -> Result<(), CoreError> {
        for (id, element) in delta {
            let entry = self.entries.get(id).ok_or(CoreError::UnknownElement(*id))?;
            entry.record.check_commit(&element.record)?;
        }
        Ok(())
    }

    /// Advance the remote baseline of every element in `delta`.
    ///
    /// Nothing is applied when any element is unknown. Fires at most one
    /// notification.
    pub fn commit(
        &mut self,
        delta: &SetDelta<R::Delta>,
        listener: &mut dyn DeltaListener,
    ) -> Result<(), CoreError> {
        self.check_commit(delta)?;
        let before = self.fields;
        for (id, element) in delta {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            if let Some(position) = &element.position {
                entry.position.commit(position);
            }
            if let Some(deleted) = &element.deleted {
                entry.deleted.commit(deleted);
            }
            entry.record.commit(&element.record)?;
            if entry.is_dead() {
                self.entries.remove(id);
            }
        }
        self.recount();
        if self.fields != before {
            listener.on_delta_change(self.fields, self.fields as i32 - before as i32);
        }
        Ok(())
    }

    pub fn mark_sent(&mut self) {
        for entry in self.entries.values_mut().filter(|e| e.is_dirty()) {
            entry.sent = true;
            entry.record.mark_sent();
        }
    }

    /// Undo the bookkeeping of a failed send of `attempted`.
    ///
    /// Elements the server never confirmed count as unsent again, so one
    /// removed meanwhile can be dropped outright.
    pub fn rollback(&mut self, attempted: &SetDelta<R::Delta>) {
        for (id, element) in attempted {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            entry.record.rollback(&element.record);
            if !entry.is_remote_present() {
                entry.sent = false;
            }
            if entry.is_dead() {
                self.entries.remove(id);
            }
        }
        self.recount();
    }

    /// Full messages of the remotely present elements.
    pub fn remote_messages(&self) -> Vec<RecordMessage> {
        let mut present: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.is_remote_present())
            .map(|e| (*e.position.remote(), e))
            .collect();
        present.sort_by_key(|(position, e)| (*position, e.record.id()));
        present
            .into_iter()
            .map(|(position, e)| {
                let mut message = e.record.remote_message();
                if self.kind == SetKind::Ordered {
                    message.position = Some(position);
                }
                message
            })
            .collect()
    }

    /// Full messages of the locally present elements.
    pub fn local_messages(&self) -> Vec<RecordMessage> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.entries.get(&id))
            .map(|e| {
                let mut message = e.record.local_message();
                if self.kind == SetKind::Ordered {
                    message.position = Some(*e.position.get());
                }
                message
            })
            .collect()
    }

    fn recount(&mut self) {
        self.fields = self.entries.values().filter(|e| e.is_dirty()).count();
    }

    fn adjust(&mut self, was_dirty: bool, is_dirty: bool) {
        match (was_dirty, is_dirty) {
            (false, true) => self.fields += 1,
            (true, false) => self.fields -= 1,
            _ => {}
        }
    }

    fn announce(&self, before: usize, listener: &mut dyn DeltaListener) {
        listener.on_delta_change(self.fields, self.fields as i32 - before as i32);
    }
}

/// Editing handle for one element of a set.
///
/// Changes made through [`local`](Self::local) are folded into the set's
/// aggregate and reported once, when the handle is dropped.
pub struct ElementMut<'a, R: Diffable> {
    entry: &'a mut Entry<R>,
    set_fields: &'a mut usize,
    listener: &'a mut dyn DeltaListener,
    was_dirty: bool,
    recorder: ChangeRecorder,
    announce: bool,
}

impl<R: Diffable> ElementMut<'_, R> {
    pub fn id(&self) -> RecordId {
        self.entry.record.id()
    }

    pub fn get(&self) -> &R {
        &self.entry.record
    }

    pub fn local(&mut self) -> R::Local<'_> {
        self.entry.record.local(&mut self.recorder)
    }
}

impl<R: Diffable> Drop for ElementMut<'_, R> {
    fn drop(&mut self) {
        let before = *self.set_fields;
        match (self.was_dirty, self.entry.is_dirty()) {
            (false, true) => *self.set_fields += 1,
            (true, false) => *self.set_fields -= 1,
            _ => {}
        }
        if self.announce || self.recorder.changed() || before != *self.set_fields {
            self.listener
                .on_delta_change(*self.set_fields, *self.set_fields as i32 - before as i32);
        }
    }
}

/// A set's local view, reporting into its parent record.
pub struct SetLocal<'a, R> {
    set: &'a mut DiffableSet<R>,
    listener: NestedListener<'a>,
}

impl<'a, R: Diffable> SetLocal<'a, R> {
    pub fn new(set: &'a mut DiffableSet<R>, listener: NestedListener<'a>) -> Self {
        Self { set, listener }
    }

    pub fn add(&mut self, remote: R) -> Result<ElementMut<'_, R>, CoreError> {
        self.set.add(remote, &mut self.listener)
    }

    pub fn update(&mut self, id: RecordId) -> Result<ElementMut<'_, R>, CoreError> {
        self.set.update(id, &mut self.listener)
    }

    pub fn remove(&mut self, id: RecordId) -> Result<(), CoreError> {
        self.set.remove(id, &mut self.listener)
    }

    pub fn swap(&mut self, a: RecordId, b: RecordId) -> Result<(), CoreError> {
        self.set.swap(a, b, &mut self.listener)
    }
}

impl<R> Deref for SetLocal<'_, R> {
    type Target = DiffableSet<R>;

    fn deref(&self) -> &DiffableSet<R> {
        self.set
    }
}
