//! Exam entities.
//!
//! Times are milliseconds since the Unix epoch; durations are milliseconds.

use crate::diffable_record;

/// One minute in milliseconds.
pub const MINUTE: i64 = 60 * 1000;

diffable_record! {
    /// A task: statement, expected answer shape and attachments.
    pub struct Task {
        delta: TaskDelta,
        local: TaskLocal,
        fields {
            task_type: i64 => set_task_type,
            tag: String => set_tag,
            statement: String => set_statement,
            answer_rows: i64 => set_answer_rows,
            answer_cols: i64 => set_answer_cols,
            answer: Vec<u8> => set_answer,
        }
        sets {
            attachments: Attachment = Unordered,
        }
    }
}

diffable_record! {
    /// A file attached to a task.
    pub struct Attachment {
        delta: AttachmentDelta,
        local: AttachmentLocal,
        fields {
            filename: String => set_filename,
            mime_type: String => set_mime_type,
            shown_to_user: bool => set_shown_to_user,
            contents: Vec<u8> => set_contents,
        }
        sets {}
    }
}

diffable_record! {
    /// An exam variant ("kim"): a schedule, an ordered task list and
    /// per-group access windows.
    pub struct Kim {
        delta: KimDelta,
        local: KimLocal,
        fields {
            name: String => set_name,
            is_exam: bool => set_is_exam,
            start_time: i64 => set_start_time,
            end_time: i64 => set_end_time,
            duration: i64 => set_duration,
            is_virtual: bool => set_is_virtual,
        }
        sets {
            tasks: TaskEntry = Ordered,
            access: GroupAccess = Unordered,
        }
    }
}

diffable_record! {
    /// A task placed in a variant.
    pub struct TaskEntry {
        delta: TaskEntryDelta,
        local: TaskEntryLocal,
        fields {
            task_type: i64 => set_task_type,
            tag: String => set_tag,
        }
        sets {}
    }
}

diffable_record! {
    /// When a group of participants may open a variant.
    pub struct GroupAccess {
        delta: GroupAccessDelta,
        local: GroupAccessLocal,
        fields {
            group_id: i64 => set_group_id,
            start_time: i64 => set_start_time,
            end_time: i64 => set_end_time,
        }
        sets {}
    }
}

/// Timing settings of a variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Schedule {
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub is_virtual: bool,
}

/// Which schedule input the user just changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEdit {
    StartTime,
    EndTime,
    Duration,
    IsVirtual,
}

impl Schedule {
    /// Make the schedule consistent after `edit`.
    ///
    /// The interval never runs backwards and is cut to whole minutes. The
    /// duration is whole minutes, never negative and never longer than the
    /// interval; a non-virtual variant lasts exactly the interval. Editing
    /// the duration moves the end time, any other edit moves the duration.
    pub fn normalize(self, edit: ScheduleEdit) -> Schedule {
        let mut start_time = self.start_time;
        let mut end_time = self.end_time;
        if end_time < start_time {
            if edit == ScheduleEdit::EndTime {
                start_time = end_time;
            } else {
                end_time = start_time;
            }
        }

        let mut interval = end_time.saturating_sub(start_time);
        let spare = interval % MINUTE;
        if spare != 0 {
            interval -= spare;
            end_time = end_time.saturating_sub(spare);
        }

        let mut duration = self.duration.max(0);
        duration -= duration % MINUTE;

        if interval < duration || (!self.is_virtual && duration < interval) {
            if edit == ScheduleEdit::Duration {
                end_time = end_time.saturating_add(duration - interval);
            } else {
                duration = interval;
            }
        }

        Schedule {
            start_time,
            end_time,
            duration,
            is_virtual: self.is_virtual,
        }
    }
}

impl Kim {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            start_time: *self.start_time(),
            end_time: *self.end_time(),
            duration: *self.duration(),
            is_virtual: *self.is_virtual(),
        }
    }
}

impl KimLocal<'_> {
    /// Write all four schedule fields.
    ///
    /// Each field notifies on its own; wrap the call in an atomic change to
    /// save them together.
    pub fn set_schedule(&mut self, schedule: Schedule) {
        self.set_start_time(schedule.start_time);
        self.set_end_time(schedule.end_time);
        self.set_is_virtual(schedule.is_virtual);
        self.set_duration(schedule.duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{ChangeRecorder, Diffable};
    use crate::error::CoreError;
    use crate::ids::RecordId;
    use crate::message::RecordMessage;

    const HOUR: i64 = 60 * MINUTE;

    fn variant() -> RecordMessage {
        RecordMessage::new(RecordId::new(1))
            .with_field("name", "A")
            .with_field("duration", 60i64)
            .with_child(
                "tasks",
                RecordMessage::new(RecordId::new(10))
                    .with_field("task_type", 3i64)
                    .with_position(0),
            )
            .with_child(
                "access",
                RecordMessage::new(RecordId::new(20)).with_field("group_id", 7i64),
            )
    }

    #[test]
    fn equality_is_against_the_current_remote() -> Result<(), CoreError> {
        let mut kim = Kim::from_message(&variant())?;
        let mut recorder = ChangeRecorder::default();
        kim.local(&mut recorder).set_duration(90);
        let (patch, delta) = kim
            .synchronize()
            .ok_or_else(|| CoreError::InvalidOperation("nothing to send".into()))?;
        assert_eq!(patch.decode_field::<i64>("duration")?, 90);
        assert_eq!(patch.fields.len(), 1);

        kim.commit(&delta)?;
        assert_eq!(kim.fields(), 0);

        kim.local(&mut recorder).set_duration(60);
        assert_eq!(kim.fields(), 1);
        assert_eq!(kim.delta().duration, Some(60));
        Ok(())
    }

    #[test]
    fn nested_set_counts_as_one_field() -> Result<(), CoreError> {
        let mut kim = Kim::from_message(&variant())?;
        let mut recorder = ChangeRecorder::default();
        {
            let mut local = kim.local(&mut recorder);
            local.set_name("B");
            let mut tasks = local.tasks();
            tasks.add(TaskEntry::new(RecordId::new(11)))?.local().set_task_type(4);
            tasks.add(TaskEntry::new(RecordId::new(12)))?.local().set_task_type(5);
        }
        assert_eq!(kim.fields(), 2);
        assert_eq!(recorder.fields(), 2);
        assert_eq!(kim.tasks().fields(), 2);

        let patch = kim.serialize();
        assert_eq!(patch.children("tasks").len(), 2);
        assert!(patch.children("access").is_empty());
        Ok(())
    }

    #[test]
    fn commit_while_editing_keeps_new_changes() -> Result<(), CoreError> {
        let mut kim = Kim::from_message(&variant())?;
        let mut recorder = ChangeRecorder::default();
        kim.local(&mut recorder).set_name("B");
        let (_, in_flight) = kim
            .synchronize()
            .ok_or_else(|| CoreError::InvalidOperation("nothing to send".into()))?;

        {
            let mut local = kim.local(&mut recorder);
            local.set_name("C");
            local.access().update(RecordId::new(20))?.local().set_start_time(HOUR);
        }
        kim.commit(&in_flight)?;
        assert_eq!(kim.remote_message().decode_field::<String>("name")?, "B");
        assert_eq!(kim.fields(), 2);
        assert_eq!(kim.delta().name.as_deref(), Some("C"));
        Ok(())
    }

    #[test]
    fn remote_message_reloads_to_the_same_record() -> Result<(), CoreError> {
        let kim = Kim::from_message(&variant())?;
        let again = Kim::from_message(&kim.remote_message())?;
        assert_eq!(again.local_message(), kim.local_message());
        assert_eq!(again.tasks().position(RecordId::new(10)), Some(0));
        Ok(())
    }

    #[test]
    fn bytes_with_equal_contents_are_clean() -> Result<(), CoreError> {
        let message = RecordMessage::new(RecordId::new(2)).with_field("answer", vec![1u8, 2, 3]);
        let mut task = Task::from_message(&message)?;
        let mut recorder = ChangeRecorder::default();
        task.local(&mut recorder).set_answer(vec![1u8, 2, 3]);
        assert!(!recorder.changed());
        assert_eq!(task.fields(), 0);
        Ok(())
    }

    #[test]
    fn mistyped_field_is_rejected() {
        let message = RecordMessage::new(RecordId::new(1)).with_field("is_exam", "yes");
        assert!(matches!(
            Kim::from_message(&message),
            Err(CoreError::FieldType { .. })
        ));
    }

    #[test]
    fn end_before_start_follows_the_edited_input() {
        let schedule = Schedule {
            start_time: 10 * HOUR,
            end_time: 9 * HOUR,
            duration: 0,
            is_virtual: false,
        };
        let edited_end = schedule.normalize(ScheduleEdit::EndTime);
        assert_eq!(edited_end.start_time, 9 * HOUR);
        assert_eq!(edited_end.end_time, 9 * HOUR);

        let edited_start = schedule.normalize(ScheduleEdit::StartTime);
        assert_eq!(edited_start.start_time, 10 * HOUR);
        assert_eq!(edited_start.end_time, 10 * HOUR);
    }

    #[test]
    fn interval_is_cut_to_whole_minutes() {
        let schedule = Schedule {
            start_time: 0,
            end_time: HOUR + 59_999,
            duration: HOUR,
            is_virtual: false,
        }
        .normalize(ScheduleEdit::EndTime);
        assert_eq!(schedule.end_time, HOUR);
        assert_eq!(schedule.duration, HOUR);
    }

    #[test]
    fn non_virtual_duration_matches_interval() {
        let schedule = Schedule {
            start_time: 0,
            end_time: 2 * HOUR,
            duration: HOUR,
            is_virtual: false,
        };
        assert_eq!(schedule.normalize(ScheduleEdit::StartTime).duration, 2 * HOUR);
        // Editing the duration moves the end instead.
        let moved = schedule.normalize(ScheduleEdit::Duration);
        assert_eq!(moved.end_time, HOUR);
        assert_eq!(moved.duration, HOUR);
    }

    #[test]
    fn virtual_duration_is_clamped_to_interval() {
        let schedule = Schedule {
            start_time: 0,
            end_time: 2 * HOUR,
            duration: HOUR,
            is_virtual: true,
        };
        assert_eq!(schedule.normalize(ScheduleEdit::IsVirtual), schedule);

        let too_long = Schedule {
            duration: 3 * HOUR,
            ..schedule
        };
        assert_eq!(too_long.normalize(ScheduleEdit::StartTime).duration, 2 * HOUR);
        assert_eq!(too_long.normalize(ScheduleEdit::Duration).end_time, 3 * HOUR);
    }

    #[test]
    fn extreme_times_saturate() {
        let wide = Schedule {
            start_time: i64::MIN,
            end_time: i64::MAX,
            duration: i64::MAX,
            is_virtual: true,
        };
        for edit in [ScheduleEdit::StartTime, ScheduleEdit::Duration] {
            let normalized = wide.normalize(edit);
            assert!(normalized.end_time >= normalized.start_time);
            assert!(normalized.duration >= 0);
            assert_eq!(normalized.duration % MINUTE, 0);
        }

        let late = Schedule {
            start_time: i64::MAX - MINUTE / 2,
            end_time: i64::MAX - MINUTE / 2,
            duration: i64::MAX,
            is_virtual: true,
        };
        assert_eq!(late.normalize(ScheduleEdit::Duration).end_time, i64::MAX);
    }

    #[test]
    fn set_schedule_writes_all_fields() -> Result<(), CoreError> {
        let mut kim = Kim::from_message(&variant())?;
        let mut recorder = ChangeRecorder::default();
        let schedule = Schedule {
            start_time: HOUR,
            end_time: 3 * HOUR,
            duration: 2 * HOUR,
            is_virtual: false,
        };
        kim.local(&mut recorder).set_schedule(schedule);
        assert_eq!(kim.schedule(), schedule);
        assert_eq!(kim.fields(), 3);
        Ok(())
    }
}
