//! Indexing schedule
//!
//! A `Schedule` pairs the expected document total with the number of
//! documents reported done. Iterating it yields batch numbers `1..=batches`.
//! Once every job has settled, `completed()` checks that the two agree; a
//! difference means batches were lost or counted twice.

use std::fmt;
use std::time::Instant;

use crate::batching::batch_count;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Created,
    Iterating,
    Exhausted,
    Completed,
    Mismatched,
}

impl ScheduleState {
    fn as_str(self) -> &'static str {
        match self {
            ScheduleState::Created => "created",
            ScheduleState::Iterating => "iterating",
            ScheduleState::Exhausted => "exhausted",
            ScheduleState::Completed => "completed",
            ScheduleState::Mismatched => "mismatched",
        }
    }
}

#[derive(Debug)]
pub struct Schedule {
    total: usize,
    batch_size: usize,
    batches: usize,
    batch: usize,
    finished: usize,
    state: ScheduleState,
    started: Instant,
}

impl Schedule {
    pub fn new(total: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            total,
            batch_size,
            batches: batch_count(total, batch_size),
            batch: 0,
            finished: 0,
            state: ScheduleState::Created,
            started: Instant::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Number of the batch most recently handed out.
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn add_finished(&mut self, count: usize) {
        self.finished += count;
    }

    pub fn percentage(&self) -> f64 {
        if self.batches == 0 {
            100.0
        } else {
            self.batch as f64 / self.batches as f64 * 100.0
        }
    }

    /// Progress label for a job, e.g. `"edges #2/4 50.0%"`.
    pub fn suffix(&self, name: &str) -> String {
        format!("{} #{}/{} {:.1}%", name, self.batch, self.batches, self.percentage())
    }

    /// Terminal check once every job has settled.
    ///
    /// The returned mismatch error has an empty `context`; callers fill in
    /// whatever identifies the data being indexed.
    pub fn completed(&mut self) -> Result<()> {
        if self.finished != self.total {
            self.state = ScheduleState::Mismatched;
            return Err(PipelineError::SchedulerMismatch {
                total: self.total,
                finished: self.finished,
                context: String::new(),
            });
        }
        self.state = ScheduleState::Completed;
        Ok(())
    }
}

impl Iterator for Schedule {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.batch < self.batches {
            self.batch += 1;
            self.state = if self.batch == self.batches {
                ScheduleState::Exhausted
            } else {
                ScheduleState::Iterating
            };
            return Some(self.batch);
        }
        if self.state == ScheduleState::Created {
            self.state = ScheduleState::Exhausted;
        }
        None
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Schedule {} batch {}/{} ({:.1}%) finished {}/{} elapsed {:.1}s>",
            self.state.as_str(),
            self.batch,
            self.batches,
            self.percentage(),
            self.finished,
            self.total,
            self.started.elapsed().as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterates_batch_numbers() {
        let schedule = Schedule::new(100, 30);
        assert_eq!(schedule.batches(), 4);
        let numbers: Vec<usize> = schedule.collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_state_transitions() {
        let mut schedule = Schedule::new(50, 20);
        assert_eq!(schedule.state(), ScheduleState::Created);
        schedule.next();
        assert_eq!(schedule.state(), ScheduleState::Iterating);
        schedule.next();
        schedule.next();
        assert_eq!(schedule.state(), ScheduleState::Exhausted);
        assert!(schedule.next().is_none());

        schedule.add_finished(50);
        schedule.completed().unwrap();
        assert_eq!(schedule.state(), ScheduleState::Completed);
    }

    #[test]
    fn test_mismatch_reports_counts() {
        let mut schedule = Schedule::new(100, 30);
        for _ in schedule.by_ref() {}
        schedule.add_finished(90);

        match schedule.completed() {
            Err(PipelineError::SchedulerMismatch { total, finished, .. }) => {
                assert_eq!(total, 100);
                assert_eq!(finished, 90);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(schedule.state(), ScheduleState::Mismatched);
    }

    #[test]
    fn test_empty_schedule() {
        let mut schedule = Schedule::new(0, 10);
        assert!(schedule.next().is_none());
        assert_eq!(schedule.state(), ScheduleState::Exhausted);
        schedule.completed().unwrap();
    }

    #[test]
    fn test_suffix_and_display() {
        let mut schedule = Schedule::new(40, 10);
        schedule.next();
        schedule.next();
        assert_eq!(schedule.suffix("edges"), "edges #2/4 50.0%");
        let text = schedule.to_string();
        assert!(text.starts_with("<Schedule iterating batch 2/4"));
        assert!(text.contains("finished 0/40"));
    }
}
