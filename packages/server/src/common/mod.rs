// Common types and utilities shared across the application

pub mod job_id;

pub use job_id::{extract_timestamp, is_valid, JobId, JobIdError, JobIdGenerator, JOB_ID_LENGTH};
