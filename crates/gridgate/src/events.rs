//! Outward-facing sinks: user-log lifecycle events and durable job-record
//! updates. Both are trait seams so the surrounding scheduler can plug in
//! its own implementations; sink failures are logged and never fatal.

use std::fmt::{Display, Formatter};

use crate::common::ids::JobId;
use crate::descriptor::{AttrUpdate, JobDescriptor};

/// One user-visible lifecycle event. The submit/execute/evict/terminate/
/// hold/abort events fire at most once per job lifetime; the resource and
/// status events fire on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEvent {
    Submitted,
    Executing,
    Evicted,
    Terminated,
    Held,
    Aborted,
    ResourceUp,
    ResourceDown,
    StatusUnknown,
    StatusKnown,
}

impl Display for JobEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobEvent::Submitted => "submitted",
            JobEvent::Executing => "executing",
            JobEvent::Evicted => "evicted",
            JobEvent::Terminated => "terminated",
            JobEvent::Held => "held",
            JobEvent::Aborted => "aborted",
            JobEvent::ResourceUp => "resource up",
            JobEvent::ResourceDown => "resource down",
            JobEvent::StatusUnknown => "remote status unknown",
            JobEvent::StatusKnown => "remote status known",
        };
        f.write_str(name)
    }
}

/// Receives user-log events, one call per lifecycle event, with the job
/// descriptor as context.
pub trait EventSink {
    fn log_event(&self, job: JobId, event: JobEvent, descriptor: &JobDescriptor)
    -> anyhow::Result<()>;
}

/// Default sink that forwards events to the process log.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn log_event(
        &self,
        job: JobId,
        event: JobEvent,
        _descriptor: &JobDescriptor,
    ) -> anyhow::Result<()> {
        log::info!("Job {job} event: {event}");
        Ok(())
    }
}

/// Asynchronous persistence of job records.
///
/// `request_update` must return immediately; the implementation commits the
/// given attributes in the background and acknowledges by sending an
/// `UpdateCommitted` message back into the engine, which clears the
/// descriptor's dirty bits. Calls with `immediate = false` may be coalesced.
pub trait UpdateSink {
    fn request_update(&self, job: JobId, dirty: Vec<AttrUpdate>, immediate: bool);

    /// The job has reached its terminal transition; remove its record.
    fn request_delete(&self, job: JobId);
}
