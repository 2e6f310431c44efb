//! Generator for diffable record types.

/// Declare a diffable record.
///
/// ```ignore
/// diffable_record! {
///     pub struct Attachment {
///         delta: AttachmentDelta,
///         local: AttachmentLocal,
///         fields {
///             filename: String => set_filename,
///             contents: Vec<u8> => set_contents,
///         }
///         sets {}
///     }
/// }
/// ```
///
/// This expands to the record itself, a `…Delta` struct with one optional
/// entry per field and per set, a `…Local` view with a setter per field and
/// an accessor per set, and the [`Diffable`](crate::diff::Diffable)
/// implementation. Field and set names double as wire keys.
#[macro_export]
macro_rules! diffable_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            delta: $delta:ident,
            local: $local:ident,
            fields {
                $($field:ident : $fty:ty => $setter:ident),* $(,)?
            }
            sets {
                $($set:ident : $child:ty = $kind:ident),* $(,)?
            }
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            id: $crate::ids::RecordId,
            fields: usize,
            $($field: $crate::value::DiffValue<$fty>,)*
            $($set: $crate::set::DiffableSet<$child>,)*
        }

        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $delta {
            $(pub $field: ::std::option::Option<$fty>,)*
            $(pub $set: ::std::option::Option<
                $crate::set::SetDelta<<$child as $crate::diff::Diffable>::Delta>,
            >,)*
        }

        $vis struct $local<'a> {
            record: &'a mut $name,
            listener: &'a mut dyn $crate::diff::DeltaListener,
        }

        impl $name {
            /// A clean record holding default values.
            pub fn new(id: $crate::ids::RecordId) -> Self {
                Self {
                    id,
                    fields: 0,
                    $($field: $crate::value::DiffValue::new(<$fty as ::std::default::Default>::default()),)*
                    $($set: $crate::set::DiffableSet::new($crate::set::SetKind::$kind),)*
                }
            }

            $(
                pub fn $field(&self) -> &$fty {
                    self.$field.get()
                }
            )*

            $(
                pub fn $set(&self) -> &$crate::set::DiffableSet<$child> {
                    &self.$set
                }
            )*

            fn recount(&mut self) {
                self.fields = 0
                    $(+ usize::from(self.$field.is_dirty()))*
                    $(+ usize::from(self.$set.is_dirty()))*;
            }
        }

        impl<'a> $local<'a> {
            $(
                pub fn $setter(&mut self, value: impl ::std::convert::Into<$fty>) {
                    let transition = self.record.$field.set(value.into());
                    $crate::diff::notify(&mut self.record.fields, transition, &mut *self.listener);
                }
            )*

            $(
                pub fn $set(&mut self) -> $crate::set::SetLocal<'_, $child> {
                    let record = &mut *self.record;
                    $crate::set::SetLocal::new(
                        &mut record.$set,
                        $crate::diff::NestedListener::new(&mut record.fields, &mut *self.listener),
                    )
                }
            )*
        }

        impl ::std::ops::Deref for $local<'_> {
            type Target = $name;

            fn deref(&self) -> &$name {
                self.record
            }
        }

        impl $crate::diff::Diffable for $name {
            type Delta = $delta;
            type Local<'a> = $local<'a>
            where
                Self: 'a;

            fn from_message(
                message: &$crate::message::RecordMessage,
            ) -> ::std::result::Result<Self, $crate::error::CoreError> {
                ::std::result::Result::Ok(Self {
                    id: message.id,
                    fields: 0,
                    $($field: $crate::value::DiffValue::new(
                        message.decode_field::<$fty>(stringify!($field))?,
                    ),)*
                    $($set: $crate::set::DiffableSet::from_messages(
                        $crate::set::SetKind::$kind,
                        message.children(stringify!($set)),
                    )?,)*
                })
            }

            fn id(&self) -> $crate::ids::RecordId {
                self.id
            }

            fn fields(&self) -> usize {
                self.fields
            }

            fn local<'a>(
                &'a mut self,
                listener: &'a mut dyn $crate::diff::DeltaListener,
            ) -> $local<'a> {
                $local {
                    record: self,
                    listener,
                }
            }

            fn delta(&self) -> $delta {
                $delta {
                    $($field: self.$field.delta().cloned(),)*
                    $($set: {
                        let delta = self.$set.delta();
                        (!delta.is_empty()).then_some(delta)
                    },)*
                }
            }

            fn serialize(&self) -> $crate::message::RecordMessage {
                let mut message = $crate::message::RecordMessage::new(self.id);
                $(
                    if let ::std::option::Option::Some(value) = self.$field.delta() {
                        message.set_field(
                            stringify!($field),
                            $crate::field_value::FieldType::to_value(value),
                        );
                    }
                )*
                $(
                    self.$set.serialize(|child| message.push_child(stringify!($set), child));
                )*
                message
            }

            fn check_commit(
                &self,
                commit: &$delta,
            ) -> ::std::result::Result<(), $crate::error::CoreError> {
                $(
                    if let ::std::option::Option::Some(delta) = &commit.$set {
                        self.$set.check_commit(delta)?;
                    }
                )*
                let _ = commit;
                ::std::result::Result::Ok(())
            }

            fn commit(
                &mut self,
                commit: &$delta,
            ) -> ::std::result::Result<(), $crate::error::CoreError> {
                $crate::diff::Diffable::check_commit(self, commit)?;
                $(
                    if let ::std::option::Option::Some(delta) = &commit.$set {
                        self.$set.commit(delta, &mut $crate::diff::Detached)?;
                    }
                )*
                $(
                    if let ::std::option::Option::Some(value) = &commit.$field {
                        self.$field.commit(value);
                    }
                )*
                self.recount();
                ::std::result::Result::Ok(())
            }

            fn mark_sent(&mut self) {
                $(self.$set.mark_sent();)*
            }

            fn rollback(&mut self, attempted: &$delta) {
                $(
                    if let ::std::option::Option::Some(delta) = &attempted.$set {
                        self.$set.rollback(delta);
                    }
                )*
                let _ = attempted;
                self.recount();
            }

            fn remote_message(&self) -> $crate::message::RecordMessage {
                let mut message = $crate::message::RecordMessage::new(self.id);
                $(
                    message.set_field(
                        stringify!($field),
                        $crate::field_value::FieldType::to_value(self.$field.remote()),
                    );
                )*
                $(
                    for child in self.$set.remote_messages() {
                        message.push_child(stringify!($set), child);
                    }
                )*
                message
            }

            fn local_message(&self) -> $crate::message::RecordMessage {
                let mut message = $crate::message::RecordMessage::new(self.id);
                $(
                    message.set_field(
                        stringify!($field),
                        $crate::field_value::FieldType::to_value(self.$field.get()),
                    );
                )*
                $(
                    for child in self.$set.local_messages() {
                        message.push_child(stringify!($set), child);
                    }
                )*
                message
            }
        }
    };
}
