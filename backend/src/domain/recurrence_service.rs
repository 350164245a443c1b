//! Recurring lesson series.
//!
//! A series is materialized up front: every occurrence is generated as a
//! plain lesson row sharing a `series_id`, at the same wall-clock time in
//! the teacher's zone. Edits and deletes of an occurrence must carry an
//! apply scope; when none was chosen the service reports a decision as
//! required instead of guessing.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{Datelike, Duration, NaiveDate};
use chrono_tz::Tz;
use log::info;

use shared::{ApplyScope, DeleteOutcome, Lesson, LessonStatus, SaveOutcome};

use crate::domain::clock;
use crate::domain::commands::lessons::{
    CreateLessonCommand, CreateRecurringCommand, DeleteLessonCommand, SaveLessonCommand,
};
use crate::domain::range_cache::{RangeCache, RemoveFilter};
use crate::storage::traits::LessonStorage;

/// Service for creating, editing and deleting lessons and their series.
#[derive(Clone)]
pub struct RecurrenceService {
    lessons: Arc<dyn LessonStorage>,
    range_cache: RangeCache,
    zone: Tz,
}

impl RecurrenceService {
    pub fn new(lessons: Arc<dyn LessonStorage>, range_cache: RangeCache, zone: Tz) -> Self {
        Self {
            lessons,
            range_cache,
            zone,
        }
    }

    /// Create a standalone lesson.
    pub async fn create_lesson(&self, cmd: CreateLessonCommand) -> Result<Lesson> {
        if cmd.duration_minutes == 0 {
            return Err(anyhow!("Lesson duration must be positive"));
        }
        if cmd.participants.is_empty() {
            return Err(anyhow!("A lesson needs at least one participant"));
        }

        let lesson = Lesson {
            id: Lesson::generate_id(),
            teacher_id: cmd.teacher_id,
            series_id: None,
            start_at: cmd.start_at,
            duration_minutes: cmd.duration_minutes,
            status: LessonStatus::Scheduled,
            participants: cmd.participants,
            meeting_link: cmd.meeting_link,
            color: cmd.color,
            is_recurring: false,
            weekdays: Vec::new(),
            until: None,
        };

        self.lessons.store_lesson(&lesson).await?;
        self.range_cache.sync_across_ranges(std::slice::from_ref(&lesson));
        info!("Created lesson {} at {}", lesson.id, lesson.start_at);
        Ok(lesson)
    }

    /// Create a recurring series: one lesson per matching weekday between
    /// the start date and `until` (inclusive, both in the teacher's zone),
    /// all at the start's wall-clock time.
    pub async fn create_recurring(&self, cmd: CreateRecurringCommand) -> Result<Vec<Lesson>> {
        if cmd.duration_minutes == 0 {
            return Err(anyhow!("Lesson duration must be positive"));
        }
        if cmd.participants.is_empty() {
            return Err(anyhow!("A lesson needs at least one participant"));
        }
        validate_weekdays(&cmd.weekdays)?;

        let (start_date, start_time) = clock::to_local(cmd.start_at, self.zone);
        if cmd.until < start_date {
            return Err(anyhow!(
                "Series end date {} is before its start date {}",
                cmd.until,
                start_date
            ));
        }

        let series_id = Lesson::generate_series_id();
        let mut occurrences = Vec::new();
        let mut date = start_date;
        while date <= cmd.until {
            if cmd.weekdays.contains(&(date.weekday().num_days_from_sunday() as u8)) {
                occurrences.push(Lesson {
                    id: Lesson::generate_id(),
                    teacher_id: cmd.teacher_id.clone(),
                    series_id: Some(series_id.clone()),
                    start_at: clock::to_instant(date, start_time, self.zone)?,
                    duration_minutes: cmd.duration_minutes,
                    status: LessonStatus::Scheduled,
                    participants: cmd.participants.clone(),
                    meeting_link: cmd.meeting_link.clone(),
                    color: cmd.color.clone(),
                    is_recurring: true,
                    weekdays: cmd.weekdays.clone(),
                    until: Some(cmd.until),
                });
            }
            date += Duration::days(1);
        }

        if occurrences.is_empty() {
            return Err(anyhow!(
                "Pattern produces no occurrences between {} and {}",
                start_date,
                cmd.until
            ));
        }

        self.lessons.store_lessons(&occurrences).await?;
        self.range_cache.sync_across_ranges(&occurrences);
        info!(
            "Created series {} with {} occurrences until {}",
            series_id,
            occurrences.len(),
            cmd.until
        );
        Ok(occurrences)
    }

    /// Save edits to a lesson.
    ///
    /// A standalone lesson is updated in place. For a series occurrence the
    /// scope decides: `Single` detaches the occurrence from its series and
    /// updates it alone; `Series` drops the scheduled tail of the series
    /// from this occurrence on and regenerates it from the edited fields;
    /// `Ask` changes nothing and reports that a decision is needed.
    pub async fn save_lesson(&self, cmd: SaveLessonCommand) -> Result<SaveOutcome> {
        let stored = self
            .lessons
            .get_lesson(&cmd.lesson_id)
            .await?
            .ok_or_else(|| anyhow!("Lesson not found: {}", cmd.lesson_id))?;

        let series_id = match &stored.series_id {
            Some(series_id) => series_id.clone(),
            None => {
                let updated = self.apply_fields(stored, &cmd);
                self.lessons.update_lesson(&updated).await?;
                self.range_cache.sync_across_ranges(std::slice::from_ref(&updated));
                return Ok(SaveOutcome::Saved(vec![updated]));
            }
        };

        match cmd.scope {
            ApplyScope::Ask => Ok(SaveOutcome::DecisionRequired {
                lesson_id: stored.id,
                series_id,
            }),
            ApplyScope::Single => {
                let mut updated = self.apply_fields(stored, &cmd);
                updated.series_id = None;
                updated.is_recurring = false;
                updated.weekdays = Vec::new();
                updated.until = None;
                self.lessons.update_lesson(&updated).await?;
                self.range_cache.sync_across_ranges(std::slice::from_ref(&updated));
                info!("Detached lesson {} from series {}", updated.id, series_id);
                Ok(SaveOutcome::Saved(vec![updated]))
            }
            ApplyScope::Series => {
                let until = cmd
                    .until
                    .or(stored.until)
                    .ok_or_else(|| anyhow!("Series {} has no end date", series_id))?;
                let weekdays = if cmd.weekdays.is_empty() {
                    stored.weekdays.clone()
                } else {
                    cmd.weekdays.clone()
                };
                validate_weekdays(&weekdays)?;

                // Replace the scheduled tail from this occurrence on;
                // earlier occurrences and completed or canceled ones stay
                let deleted = self
                    .lessons
                    .delete_series_from(&series_id, stored.start_at)
                    .await?;
                let regenerated = self
                    .create_recurring_tail(&stored, &cmd, &series_id, weekdays, until)
                    .await?;

                self.range_cache.remove_across_ranges(&RemoveFilter {
                    ids: deleted,
                    series_id: Some(series_id.clone()),
                    start_from: Some(stored.start_at),
                });
                self.range_cache.sync_across_ranges(&regenerated);
                info!(
                    "Rebuilt series {} from {} with {} occurrences",
                    series_id,
                    stored.start_at,
                    regenerated.len()
                );
                Ok(SaveOutcome::Saved(regenerated))
            }
        }
    }

    /// Delete a lesson.
    ///
    /// `Series` scope removes the scheduled tail of the series from this
    /// occurrence on; completed and canceled occurrences survive as
    /// history. `Ask` on a series occurrence changes nothing.
    pub async fn delete_lesson(&self, cmd: DeleteLessonCommand) -> Result<DeleteOutcome> {
        let stored = self
            .lessons
            .get_lesson(&cmd.lesson_id)
            .await?
            .ok_or_else(|| anyhow!("Lesson not found: {}", cmd.lesson_id))?;

        let series_id = match &stored.series_id {
            Some(series_id) => series_id.clone(),
            None => {
                self.lessons.delete_lesson(&stored.id).await?;
                self.range_cache.remove_across_ranges(&RemoveFilter {
                    ids: vec![stored.id.clone()],
                    ..Default::default()
                });
                return Ok(DeleteOutcome::Deleted(vec![stored.id]));
            }
        };

        match cmd.scope {
            ApplyScope::Ask => Ok(DeleteOutcome::DecisionRequired {
                lesson_id: stored.id,
                series_id,
            }),
            ApplyScope::Single => {
                self.lessons.delete_lesson(&stored.id).await?;
                self.range_cache.remove_across_ranges(&RemoveFilter {
                    ids: vec![stored.id.clone()],
                    ..Default::default()
                });
                Ok(DeleteOutcome::Deleted(vec![stored.id]))
            }
            ApplyScope::Series => {
                let deleted = self
                    .lessons
                    .delete_series_from(&series_id, stored.start_at)
                    .await?;
                self.range_cache.remove_across_ranges(&RemoveFilter {
                    ids: deleted.clone(),
                    series_id: Some(series_id.clone()),
                    start_from: Some(stored.start_at),
                });
                info!(
                    "Deleted {} occurrences of series {} from {}",
                    deleted.len(),
                    series_id,
                    stored.start_at
                );
                Ok(DeleteOutcome::Deleted(deleted))
            }
        }
    }

    /// Copy editable fields from the command onto a stored lesson.
    fn apply_fields(&self, mut lesson: Lesson, cmd: &SaveLessonCommand) -> Lesson {
        lesson.start_at = cmd.start_at;
        lesson.duration_minutes = cmd.duration_minutes;
        lesson.participants = cmd.participants.clone();
        lesson.meeting_link = cmd.meeting_link.clone();
        lesson.color = cmd.color.clone();
        lesson
    }

    /// Regenerate the series tail under its existing id.
    async fn create_recurring_tail(
        &self,
        stored: &Lesson,
        cmd: &SaveLessonCommand,
        series_id: &str,
        weekdays: Vec<u8>,
        until: NaiveDate,
    ) -> Result<Vec<Lesson>> {
        if cmd.duration_minutes == 0 {
            return Err(anyhow!("Lesson duration must be positive"));
        }
        let (start_date, start_time) = clock::to_local(cmd.start_at, self.zone);
        if until < start_date {
            return Err(anyhow!(
                "Series end date {} is before its start date {}",
                until,
                start_date
            ));
        }

        let mut occurrences = Vec::new();
        let mut date = start_date;
        while date <= until {
            if weekdays.contains(&(date.weekday().num_days_from_sunday() as u8)) {
                occurrences.push(Lesson {
                    id: Lesson::generate_id(),
                    teacher_id: stored.teacher_id.clone(),
                    series_id: Some(series_id.to_string()),
                    start_at: clock::to_instant(date, start_time, self.zone)?,
                    duration_minutes: cmd.duration_minutes,
                    status: LessonStatus::Scheduled,
                    participants: cmd.participants.clone(),
                    meeting_link: cmd.meeting_link.clone(),
                    color: cmd.color.clone(),
                    is_recurring: true,
                    weekdays: weekdays.clone(),
                    until: Some(until),
                });
            }
            date += Duration::days(1);
        }

        self.lessons.store_lessons(&occurrences).await?;
        Ok(occurrences)
    }
}

fn validate_weekdays(weekdays: &[u8]) -> Result<()> {
    if weekdays.is_empty() {
        return Err(anyhow!("A recurring series needs at least one weekday"));
    }
    if let Some(bad) = weekdays.iter().find(|d| !Lesson::is_valid_weekday(**d)) {
        return Err(anyhow!("Invalid weekday number: {}", bad));
    }
    Ok(())
}
