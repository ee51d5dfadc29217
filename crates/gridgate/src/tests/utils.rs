use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use derive_builder::Builder;
use log::LevelFilter;

use crate::common::ids::JobId;
use crate::descriptor::{
    ATTR_CLUSTER_ID, ATTR_CREDENTIAL_FILE, ATTR_JOB_STATUS, ATTR_PROC_ID, ATTR_REMOTE_ENDPOINT,
    ATTR_REMOTE_JOB_ID, AttrUpdate, JobDescriptor,
};
use crate::events::{EventSink, JobEvent, UpdateSink};
use crate::helper::{
    BoxFuture, HelperResult, LeaseRenewal, NotifyReceiver, NotifyTarget, RemoteHelper,
    RemoteStatus,
};
use crate::job::JobStatus;

pub fn init_test_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .try_init();
}

/// Builds job descriptors as they arrive from the persistence layer:
/// identity, status and destination attributes present and committed.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct JobSpec {
    #[builder(default = "1")]
    cluster: u32,
    #[builder(default = "0")]
    proc: u32,
    #[builder(default = "JobStatus::Idle")]
    status: JobStatus,
    #[builder(default = "\"batch.example.com\".to_string()")]
    endpoint: String,
    #[builder(default)]
    remote_id: Option<String>,
    #[builder(default)]
    credential_file: Option<String>,
}

impl JobSpec {
    pub fn into_descriptor(self) -> JobDescriptor {
        let mut descriptor = JobDescriptor::new();
        descriptor.set(ATTR_CLUSTER_ID, self.cluster as i64);
        descriptor.set(ATTR_PROC_ID, self.proc as i64);
        descriptor.set(ATTR_JOB_STATUS, self.status.to_attr());
        descriptor.set(ATTR_REMOTE_ENDPOINT, self.endpoint.as_str());
        if let Some(remote_id) = &self.remote_id {
            descriptor.set(ATTR_REMOTE_JOB_ID, remote_id.as_str());
        }
        if let Some(path) = &self.credential_file {
            descriptor.set(ATTR_CREDENTIAL_FILE, path.as_str());
        }
        let committed: Vec<String> = descriptor.dirty_attrs().map(str::to_string).collect();
        descriptor.clear_dirty(committed.iter().map(String::as_str));
        descriptor
    }
}

/// Lets spawned local tasks run, then collects everything they queued.
pub async fn drain_notifications(rx: &mut NotifyReceiver) -> Vec<NotifyTarget> {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
    let mut targets = Vec::new();
    while let Ok(target) = rx.try_recv() {
        targets.push(target);
    }
    targets
}

#[derive(Default)]
pub struct ScriptedState {
    submit: VecDeque<HelperResult<String>>,
    status: VecDeque<HelperResult<RemoteStatus>>,
    cancel: VecDeque<HelperResult<()>>,
    ping: VecDeque<HelperResult<()>>,
    leases: VecDeque<HelperResult<Vec<(String, bool)>>>,
    pub submitted_jobs: Vec<JobId>,
    pub canceled_jobs: Vec<String>,
    pub ping_count: usize,
    pub lease_batches: Vec<Vec<LeaseRenewal>>,
}

/// Helper double with scripted responses. Operations without a scripted
/// response resolve to a benign default (submit succeeds with a generated
/// id, status reports queued, ping succeeds, every lease is accepted).
#[derive(Default, Clone)]
pub struct ScriptedHelper {
    state: Rc<RefCell<ScriptedState>>,
}

impl ScriptedHelper {
    pub fn client(&self) -> Rc<dyn RemoteHelper> {
        Rc::new(self.clone())
    }

    pub fn push_submit(&self, result: HelperResult<String>) {
        self.state.borrow_mut().submit.push_back(result);
    }

    pub fn push_status(&self, result: HelperResult<RemoteStatus>) {
        self.state.borrow_mut().status.push_back(result);
    }

    pub fn push_cancel(&self, result: HelperResult<()>) {
        self.state.borrow_mut().cancel.push_back(result);
    }

    pub fn push_ping(&self, result: HelperResult<()>) {
        self.state.borrow_mut().ping.push_back(result);
    }

    pub fn push_leases(&self, result: HelperResult<Vec<(String, bool)>>) {
        self.state.borrow_mut().leases.push_back(result);
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&ScriptedState) -> R) -> R {
        f(&self.state.borrow())
    }
}

impl RemoteHelper for ScriptedHelper {
    fn submit_job(&self, job: JobId, _descriptor: JobDescriptor) -> BoxFuture<HelperResult<String>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.borrow_mut();
            state.submitted_jobs.push(job);
            state
                .submit
                .pop_front()
                .unwrap_or_else(|| Ok(format!("remote-{job}")))
        })
    }

    fn query_status(&self, _remote_id: String) -> BoxFuture<HelperResult<RemoteStatus>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.borrow_mut();
            state.status.pop_front().unwrap_or(Ok(RemoteStatus::Queued))
        })
    }

    fn cancel_job(&self, remote_id: String) -> BoxFuture<HelperResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.borrow_mut();
            state.canceled_jobs.push(remote_id);
            state.cancel.pop_front().unwrap_or(Ok(()))
        })
    }

    fn ping(&self) -> BoxFuture<HelperResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.borrow_mut();
            state.ping_count += 1;
            state.ping.pop_front().unwrap_or(Ok(()))
        })
    }

    fn renew_leases(
        &self,
        leases: Vec<LeaseRenewal>,
    ) -> BoxFuture<HelperResult<Vec<(String, bool)>>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.borrow_mut();
            let default = leases
                .iter()
                .map(|lease| (lease.remote_id.clone(), true))
                .collect();
            state.lease_batches.push(leases);
            state.leases.pop_front().unwrap_or(Ok(default))
        })
    }
}

/// Event sink that records every event.
#[derive(Default, Clone)]
pub struct RecordingEventSink {
    pub events: Rc<RefCell<Vec<(JobId, JobEvent)>>>,
}

impl RecordingEventSink {
    pub fn events_for(&self, job: JobId) -> Vec<JobEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|(id, _)| *id == job)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn log_event(
        &self,
        job: JobId,
        event: JobEvent,
        _descriptor: &JobDescriptor,
    ) -> anyhow::Result<()> {
        self.events.borrow_mut().push((job, event));
        Ok(())
    }
}

/// Update sink that records requests; commits are acknowledged by the test
/// itself (or by the engine wrapper in engine tests).
#[derive(Default, Clone)]
pub struct RecordingUpdateSink {
    pub updates: Rc<RefCell<Vec<(JobId, Vec<AttrUpdate>, bool)>>>,
    pub deletes: Rc<RefCell<Vec<JobId>>>,
}

impl RecordingUpdateSink {
    pub fn update_count(&self, job: JobId) -> usize {
        self.updates
            .borrow()
            .iter()
            .filter(|(id, _, _)| *id == job)
            .count()
    }

    pub fn take_requests(&self) -> Vec<(JobId, Vec<AttrUpdate>, bool)> {
        std::mem::take(&mut *self.updates.borrow_mut())
    }
}

impl UpdateSink for RecordingUpdateSink {
    fn request_update(&self, job: JobId, dirty: Vec<AttrUpdate>, immediate: bool) {
        self.updates.borrow_mut().push((job, dirty, immediate));
    }

    fn request_delete(&self, job: JobId) {
        self.deletes.borrow_mut().push(job);
    }
}
