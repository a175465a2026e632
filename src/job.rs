//! Print jobs and their observable history
//!
//! A job moves strictly forward through
//! `RECEIVED -> CAPTURING -> ENCODING -> DISPATCHING -> DONE`, and may drop
//! to `FAILED` from any non-terminal state. Jobs are never retried.
//!
//! The HTTP caller is acknowledged before any of this happens, so the
//! [`JobLog`] is the only place a failure becomes visible after the fact.

use crate::capture::BoundingBox;
use crate::config::PrinterTarget;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Received,
    Capturing,
    Encoding,
    Dispatching,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Received => 0,
            JobState::Capturing => 1,
            JobState::Encoding => 2,
            JobState::Dispatching => 3,
            JobState::Done | JobState::Failed => 4,
        }
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_advance_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Failed => true,
            JobState::Done => self == JobState::Dispatching,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

/// One accepted print request travelling through the pipeline
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: String,
    pub raw_document: String,
    /// Capture PNG; the device buffer lands next to it with a `.bin` suffix
    pub artifact_path: PathBuf,
    pub target: PrinterTarget,
    pub bounding_box: Option<BoundingBox>,
    pub device_buffer: Option<Vec<u8>>,
    pub received_at: DateTime<Utc>,
}

impl PrintJob {
    pub fn new(raw_document: String, artifact_path: PathBuf, target: PrinterTarget) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            raw_document,
            artifact_path,
            target,
            bounding_box: None,
            device_buffer: None,
            received_at: Utc::now(),
        }
    }
}

/// Polling view of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub queue: String,
    pub artifact: String,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded history of recent jobs, oldest evicted first
pub struct JobLog {
    records: DashMap<String, JobRecord>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl JobLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record_received(&self, job: &PrintJob) {
        let record = JobRecord {
            id: job.id.clone(),
            state: JobState::Received,
            queue: job.target.queue_name.clone(),
            artifact: job.artifact_path.display().to_string(),
            received_at: job.received_at,
            updated_at: job.received_at,
            bounding_box: None,
            buffer_bytes: None,
            failed_stage: None,
            error: None,
        };
        self.records.insert(job.id.clone(), record);

        let evicted: Vec<String> = match self.order.lock() {
            Ok(mut order) => {
                order.push_back(job.id.clone());
                let excess = order.len().saturating_sub(self.capacity);
                order.drain(..excess).collect()
            }
            Err(_) => Vec::new(),
        };
        for id in evicted {
            self.records.remove(&id);
        }
    }

    /// Move a job to `state`; illegal transitions are ignored and reported
    pub fn advance(&self, id: &str, state: JobState) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) if record.state.can_advance_to(state) => {
                record.state = state;
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn set_bounding_box(&self, id: &str, bbox: BoundingBox) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.bounding_box = Some(bbox);
        }
    }

    pub fn set_buffer_len(&self, id: &str, len: usize) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.buffer_bytes = Some(len);
        }
    }

    pub fn fail(&self, id: &str, stage: &str, error: impl ToString) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) if record.state.can_advance_to(JobState::Failed) => {
                record.state = JobState::Failed;
                record.updated_at = Utc::now();
                record.failed_stage = Some(stage.to_string());
                record.error = Some(error.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.records.get(id).map(|record| record.clone())
    }

    /// Up to `limit` records, newest first
    pub fn recent(&self, limit: usize) -> Vec<JobRecord> {
        let ids: Vec<String> = match self.order.lock() {
            Ok(order) => order.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PrintJob {
        PrintJob::new(
            "<div id=\"content\">Hello</div>".to_string(),
            PathBuf::from("./temp/1.png"),
            PrinterTarget::default(),
        )
    }

    #[test]
    fn test_states_only_move_forward() {
        use JobState::*;
        assert!(Received.can_advance_to(Capturing));
        assert!(Capturing.can_advance_to(Encoding));
        assert!(Encoding.can_advance_to(Dispatching));
        assert!(Dispatching.can_advance_to(Done));
        assert!(!Received.can_advance_to(Encoding));
        assert!(!Capturing.can_advance_to(Done));
        assert!(!Encoding.can_advance_to(Capturing));
        assert!(Capturing.can_advance_to(Failed));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Capturing));
    }

    #[test]
    fn test_log_tracks_lifecycle() {
        let log = JobLog::new(8);
        let job = job();
        log.record_received(&job);
        assert_eq!(log.get(&job.id).unwrap().state, JobState::Received);

        assert!(log.advance(&job.id, JobState::Capturing));
        assert!(log.fail(&job.id, "capture", "content element missing"));
        let record = log.get(&job.id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failed_stage.as_deref(), Some("capture"));
        assert_eq!(record.error.as_deref(), Some("content element missing"));

        // terminal
        assert!(!log.advance(&job.id, JobState::Encoding));
        assert!(!log.fail(&job.id, "encode", "late"));
    }

    #[test]
    fn test_log_evicts_oldest() {
        let log = JobLog::new(2);
        let jobs: Vec<PrintJob> = (0..3).map(|_| job()).collect();
        for job in &jobs {
            log.record_received(job);
        }
        assert_eq!(log.len(), 2);
        assert!(log.get(&jobs[0].id).is_none());

        let recent = log.recent(10);
        assert_eq!(recent[0].id, jobs[2].id);
        assert_eq!(recent[1].id, jobs[1].id);
    }

    #[test]
    fn test_record_serializes_state_names() {
        let log = JobLog::new(1);
        let job = job();
        log.record_received(&job);
        let json = serde_json::to_value(log.get(&job.id).unwrap()).unwrap();
        assert_eq!(json["state"], "RECEIVED");
        assert_eq!(json["queue"], "thermal");
        assert!(json.get("error").is_none());
    }
}
