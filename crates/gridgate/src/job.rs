//! The per-job lifecycle driver.
//!
//! A job's externally-visible state ([`JobStatus`]) moves through
//! idle/running/held/removed/completed; the driver's own position in the
//! remote-submission lifecycle is the [`RemoteState`] machine. Evaluation
//! is re-entrant and built entirely from non-blocking calls: an action
//! either consults local state and transitions, or issues one remote command
//! and suspends until the command completes (or a poll interval elapses).

use std::time::{Duration, Instant, SystemTime};

use crate::common::ids::{CredentialId, JobId, TimerId, WatchToken};
use crate::config::EngineConfig;
use crate::credential::CredentialStore;
use crate::descriptor::{
    ATTR_HOLD_REASON, ATTR_HOLD_REASON_CODE, ATTR_JOB_STATUS, ATTR_LEASE_DURATION,
    ATTR_LEASE_RECEIVED_EXPIRATION, ATTR_LEASE_RENEWAL_FAILED, ATTR_LEASE_SENT_EXPIRATION,
    ATTR_REMOTE_JOB_ID, ATTR_REMOTE_JOB_STATUS, ATTR_REMOTE_WALL_CLOCK, ATTR_SUBMIT_ATTEMPTS,
    AttrValue, JobDescriptor,
};
use crate::engine::registry::JobRegistry;
use crate::engine::timer::TimerService;
use crate::engine::{EngineSenders, TimerTarget};
use crate::events::{EventSink, JobEvent, UpdateSink};
use crate::helper::{CommandStatus, HelperError, RemoteStatus};
use crate::resource::Resource;
use crate::Map;

/// Hold-reason code recorded next to the reason string: the hold was
/// decided by the remote-job engine (as opposed to the user or a policy).
const HOLD_CODE_REMOTE_ENGINE: i64 = 1;

/// Hard cap on transitions within one evaluation pass. The loop always
/// terminates when a pass makes no transition; hitting this cap means a
/// state cycle without external progress, which is a defect.
const MAX_TRANSITIONS_PER_EVALUATION: usize = 64;

/// Externally-visible lifecycle state, shared with the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Running,
    Removed,
    Completed,
    Held,
}

impl JobStatus {
    pub fn from_attr(value: i64) -> Option<JobStatus> {
        match value {
            1 => Some(JobStatus::Idle),
            2 => Some(JobStatus::Running),
            3 => Some(JobStatus::Removed),
            4 => Some(JobStatus::Completed),
            5 => Some(JobStatus::Held),
            _ => None,
        }
    }

    pub fn to_attr(self) -> i64 {
        match self {
            JobStatus::Idle => 1,
            JobStatus::Running => 2,
            JobStatus::Removed => 3,
            JobStatus::Completed => 4,
            JobStatus::Held => 5,
        }
    }
}

/// The driver's position in the remote-submission lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Dispatch: decide between fresh submission and recovery.
    Start,
    /// Nothing exists remotely yet.
    Unsubmitted,
    /// Submission attempt in progress (admission, rate limit, remote call).
    Submit,
    /// Remote id assigned; waiting for it to be durably recorded.
    SubmitCommit,
    /// The job lives at the remote endpoint.
    Submitted,
    /// Status query in flight.
    Poll,
    /// Process restart with a known remote id: reconcile, never re-submit.
    Recover,
    /// Remote execution finished; waiting for the final record commit.
    DoneSave,
    /// Final local bookkeeping before deletion.
    DoneCommit,
    /// Best-effort remote cancellation on removal or hold.
    Cancel,
    /// Credential near expiration; parked until it is refreshed.
    CredentialWait,
    /// Failure path: record a hold reason and leave the engine.
    Hold,
    /// Terminal: the engine unregisters the job after this evaluation.
    Delete,
}

impl std::fmt::Display for RemoteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemoteState::Start => "START",
            RemoteState::Unsubmitted => "UNSUBMITTED",
            RemoteState::Submit => "SUBMIT",
            RemoteState::SubmitCommit => "SUBMIT_COMMIT",
            RemoteState::Submitted => "SUBMITTED",
            RemoteState::Poll => "POLL",
            RemoteState::Recover => "RECOVER",
            RemoteState::DoneSave => "DONE_SAVE",
            RemoteState::DoneCommit => "DONE_COMMIT",
            RemoteState::Cancel => "CANCEL",
            RemoteState::CredentialWait => "CREDENTIAL_WAIT",
            RemoteState::Hold => "HOLD",
            RemoteState::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// What the engine should do with the job object after a terminal
/// evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the job from the engine and from the persistence layer.
    DeleteRecord,
    /// Remove the job from the engine only (held jobs keep their record).
    KeepRecord,
}

/// Outcome of one state action.
enum Step {
    /// No transition; the evaluation loop ends here.
    Stay,
    Goto(RemoteState),
}

/// Everything a job evaluation may touch outside the job itself.
pub struct EvalCtx<'a> {
    pub resource: &'a mut Resource,
    pub credentials: &'a mut CredentialStore,
    pub registry: &'a mut JobRegistry,
    pub timers: &'a mut TimerService<TimerTarget>,
    pub config: &'a EngineConfig,
    pub senders: &'a EngineSenders,
    pub updates: &'a dyn UpdateSink,
    pub events: &'a dyn EventSink,
}

#[derive(Debug, Default)]
struct EventFlags {
    submitted: bool,
    executing: bool,
    evicted: bool,
    terminated: bool,
    held: bool,
    aborted: bool,
}

impl EventFlags {
    fn flag(&mut self, event: JobEvent) -> Option<&mut bool> {
        match event {
            JobEvent::Submitted => Some(&mut self.submitted),
            JobEvent::Executing => Some(&mut self.executing),
            JobEvent::Evicted => Some(&mut self.evicted),
            JobEvent::Terminated => Some(&mut self.terminated),
            JobEvent::Held => Some(&mut self.held),
            JobEvent::Aborted => Some(&mut self.aborted),
            _ => None,
        }
    }
}

pub struct Job {
    id: JobId,
    descriptor: JobDescriptor,
    status: JobStatus,
    remote_state: RemoteState,
    entered_state_at: Instant,
    remote_id: Option<String>,
    resource: crate::ResourceId,
    credential: Option<(CredentialId, WatchToken)>,
    evaluate_timer: TimerId,

    remote_status: Option<RemoteStatus>,
    pending_remote_status: Option<RemoteStatus>,
    status_unknown_count: usize,

    error_string: Option<String>,
    pre_hold_reason: Option<String>,
    deletion: Option<Disposition>,

    submit_attempts: usize,
    last_submit_attempt: Option<Instant>,
    connect_failures: usize,
    last_poll: Option<Instant>,
    /// Per-state scratch: the current state already did its one-time
    /// bookkeeping (command issue timestamp, update request). Cleared on
    /// every transition.
    command_issued: bool,
    update_pending: bool,

    lease_sent: Option<SystemTime>,
    lease_received: Option<SystemTime>,
    last_lease_renewal_failed: bool,

    run_started_at: Option<SystemTime>,
    events_logged: EventFlags,
}

impl Job {
    pub fn new(
        descriptor: JobDescriptor,
        resource: crate::ResourceId,
        credential: Option<(CredentialId, WatchToken)>,
        evaluate_timer: TimerId,
    ) -> Self {
        let id = descriptor
            .job_id()
            .expect("job descriptor without an identity");
        let status = descriptor
            .get_int(ATTR_JOB_STATUS)
            .and_then(JobStatus::from_attr)
            .unwrap_or(JobStatus::Idle);
        let remote_id = descriptor
            .get_string(ATTR_REMOTE_JOB_ID)
            .map(str::to_string);
        let lease_sent = descriptor.get_time(ATTR_LEASE_SENT_EXPIRATION);
        let lease_received = descriptor.get_time(ATTR_LEASE_RECEIVED_EXPIRATION);
        let last_lease_renewal_failed = descriptor
            .get_bool(ATTR_LEASE_RENEWAL_FAILED)
            .unwrap_or(false);
        let submit_attempts = descriptor
            .get_int(ATTR_SUBMIT_ATTEMPTS)
            .unwrap_or(0)
            .max(0) as usize;

        Self {
            id,
            descriptor,
            status,
            remote_state: RemoteState::Start,
            entered_state_at: Instant::now(),
            remote_id,
            resource,
            credential,
            evaluate_timer,
            remote_status: None,
            pending_remote_status: None,
            status_unknown_count: 0,
            error_string: None,
            pre_hold_reason: None,
            deletion: None,
            submit_attempts,
            last_submit_attempt: None,
            connect_failures: 0,
            last_poll: None,
            command_issued: false,
            update_pending: false,
            lease_sent,
            lease_received,
            last_lease_renewal_failed,
            run_started_at: None,
            events_logged: EventFlags::default(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn remote_state(&self) -> RemoteState {
        self.remote_state
    }

    /// How long the driver has been in its current state.
    pub fn time_in_state(&self) -> Duration {
        self.entered_state_at.elapsed()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn resource(&self) -> crate::ResourceId {
        self.resource
    }

    pub fn credential(&self) -> Option<(CredentialId, WatchToken)> {
        self.credential
    }

    pub fn take_credential(&mut self) -> Option<(CredentialId, WatchToken)> {
        self.credential.take()
    }

    pub fn evaluate_timer(&self) -> TimerId {
        self.evaluate_timer
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn hold_reason(&self) -> Option<&str> {
        self.descriptor.get_string(ATTR_HOLD_REASON)
    }

    /// Marks the job as doomed before its first evaluation (credential
    /// failure at construction). The first evaluation drives the hold path.
    pub fn pre_hold(&mut self, reason: String) {
        self.pre_hold_reason = Some(reason);
        self.remote_state = RemoteState::Hold;
    }

    /// Out-of-band remote status, routed through the remote-id registry.
    /// Applied at the start of the next evaluation.
    pub fn note_remote_status(&mut self, status: RemoteStatus) {
        self.pending_remote_status = Some(status);
    }

    /// The endpoint's up/down status changed (or was learned).
    pub fn resource_status_changed(&mut self, up: bool, events: &dyn EventSink) {
        let event = if up {
            JobEvent::ResourceUp
        } else {
            JobEvent::ResourceDown
        };
        self.log_event(event, events);
    }

    /// The persistence layer committed the given attributes. Anything
    /// dirtied since the request stays dirty and is re-requested by the
    /// next flush.
    pub fn update_committed(&mut self, attrs: &[String]) {
        self.descriptor
            .clear_dirty(attrs.iter().map(String::as_str));
        self.update_pending = false;
    }

    /// Applies a descriptor refresh from the persistence layer (user
    /// removal, hold, schedd-side edits).
    pub fn refresh_from(&mut self, attrs: &Map<String, AttrValue>) {
        self.descriptor.refresh_from(attrs);
        if let Some(status) = self
            .descriptor
            .get_int(ATTR_JOB_STATUS)
            .and_then(JobStatus::from_attr)
            && status != self.status
        {
            log::debug!("Job {}: status changed to {status:?} externally", self.id);
            self.status = status;
        }
    }

    /// Runs the state machine until a full pass produces no transition.
    /// Returns the disposition once the terminal state is reached.
    pub fn evaluate_state(&mut self, ctx: &mut EvalCtx) -> Option<Disposition> {
        if let Some(status) = self.pending_remote_status.take() {
            self.record_remote_status(status, ctx.events);
        }

        let mut transitions = 0;
        loop {
            let state = self.remote_state;
            let step = match state {
                RemoteState::Start => self.do_start(),
                RemoteState::Unsubmitted => self.do_unsubmitted(ctx),
                RemoteState::Submit => self.do_submit(ctx),
                RemoteState::SubmitCommit => self.do_submit_commit(ctx),
                RemoteState::Submitted => self.do_submitted(ctx),
                RemoteState::Poll => self.do_poll(ctx),
                RemoteState::Recover => self.do_recover(ctx),
                RemoteState::DoneSave => self.do_done_save(ctx),
                RemoteState::DoneCommit => self.do_done_commit(ctx),
                RemoteState::Cancel => self.do_cancel(ctx),
                RemoteState::CredentialWait => self.do_credential_wait(ctx),
                RemoteState::Hold => self.do_hold(ctx),
                RemoteState::Delete => Step::Stay,
            };
            match step {
                Step::Stay => break,
                Step::Goto(next) => {
                    self.transition(next, ctx);
                    transitions += 1;
                    assert!(
                        transitions <= MAX_TRANSITIONS_PER_EVALUATION,
                        "job {}: state machine cycles without external progress",
                        self.id
                    );
                }
            }
        }

        self.flush_updates(ctx.updates, false);

        if self.remote_state == RemoteState::Delete {
            Some(
                self.deletion
                    .expect("terminal state without a disposition"),
            )
        } else {
            None
        }
    }

    fn transition(&mut self, next: RemoteState, ctx: &mut EvalCtx) {
        log::debug!(
            "Job {}: state change {} -> {next}",
            self.id,
            self.remote_state
        );
        self.remote_state = next;
        self.entered_state_at = Instant::now();
        self.command_issued = false;
        self.connect_failures = 0;
        ctx.resource.channel_mut().discard_job_commands(self.id);
    }

    fn do_start(&mut self) -> Step {
        if self.remote_id.is_some() {
            Step::Goto(RemoteState::Recover)
        } else if self.status == JobStatus::Completed {
            Step::Goto(RemoteState::DoneSave)
        } else {
            Step::Goto(RemoteState::Unsubmitted)
        }
    }

    fn do_unsubmitted(&mut self, ctx: &mut EvalCtx) -> Step {
        match self.status {
            JobStatus::Removed => {
                self.log_event_once(JobEvent::Aborted, ctx.events);
                self.deletion = Some(Disposition::DeleteRecord);
                Step::Goto(RemoteState::Delete)
            }
            JobStatus::Held => {
                self.deletion = Some(Disposition::KeepRecord);
                Step::Goto(RemoteState::Delete)
            }
            JobStatus::Completed => Step::Goto(RemoteState::DoneSave),
            JobStatus::Idle | JobStatus::Running => Step::Goto(RemoteState::Submit),
        }
    }

    fn do_submit(&mut self, ctx: &mut EvalCtx) -> Step {
        // Once a submit command is in flight its result must be consumed,
        // even if the job was removed or held meanwhile; abandoning it
        // could orphan a job at the remote end.
        if !self.command_issued {
            if matches!(self.status, JobStatus::Removed | JobStatus::Held) {
                ctx.resource.cancel_submit(self.id, ctx.senders);
                return Step::Goto(RemoteState::Unsubmitted);
            }
            if let Some((credential, _)) = self.credential
                && ctx.credentials.get(credential).near_expired()
            {
                ctx.resource.cancel_submit(self.id, ctx.senders);
                return Step::Goto(RemoteState::CredentialWait);
            }
            if self.submit_attempts >= ctx.config.max_submit_attempts {
                let detail = self
                    .error_string
                    .clone()
                    .unwrap_or_else(|| "no further detail".to_string());
                self.pre_hold_reason.get_or_insert(format!(
                    "Too many failed submit attempts ({detail})"
                ));
                ctx.resource.cancel_submit(self.id, ctx.senders);
                return Step::Goto(RemoteState::Hold);
            }

            // Rate limit: minimum spacing between attempts, growing with
            // the number of consecutive failures.
            if let Some(last) = self.last_submit_attempt {
                let delay = ctx.config.submit_attempt_delay(self.submit_attempts);
                let elapsed = last.elapsed();
                if elapsed < delay {
                    ctx.timers.reset(self.evaluate_timer, delay - elapsed);
                    return Step::Stay;
                }
            }

            if !ctx.resource.request_submit(self.id, ctx.senders) {
                // Parked in an admission queue; promotion re-evaluates us.
                return Step::Stay;
            }

            self.command_issued = true;
            self.last_submit_attempt = Some(Instant::now());
            self.submit_attempts += 1;
            self.descriptor
                .set(ATTR_SUBMIT_ATTEMPTS, self.submit_attempts as i64);
        }

        match ctx
            .resource
            .channel_mut()
            .submit_job(self.id, self.descriptor.clone())
        {
            CommandStatus::NotSubmitted => {
                // Nothing was started; undo the attempt bookkeeping.
                self.command_issued = false;
                self.submit_attempts -= 1;
                self.descriptor
                    .set(ATTR_SUBMIT_ATTEMPTS, self.submit_attempts as i64);
                ctx.resource.cancel_submit(self.id, ctx.senders);
                ctx.timers
                    .reset(self.evaluate_timer, ctx.config.poll_interval());
                Step::Stay
            }
            CommandStatus::Pending => Step::Stay,
            CommandStatus::Completed(Ok(remote_id)) => {
                log::info!("Job {} submitted as {remote_id}", self.id);
                self.submit_attempts = 0;
                self.descriptor.set(ATTR_SUBMIT_ATTEMPTS, 0i64);
                self.set_remote_job_id(Some(remote_id), ctx.registry);
                self.log_event_once(JobEvent::Submitted, ctx.events);
                Step::Goto(RemoteState::SubmitCommit)
            }
            CommandStatus::Completed(Err(HelperError::Connection(message))) => {
                log::warn!("Job {}: submit failed to connect: {message}", self.id);
                self.error_string = Some(message);
                self.connect_failures += 1;
                if self.connect_failures >= ctx.config.connect_failure_limit {
                    ctx.resource.request_ping(self.id);
                    ctx.senders.wake_resource(self.resource);
                }
                ctx.resource.cancel_submit(self.id, ctx.senders);
                self.command_issued = false;
                ctx.timers.reset(
                    self.evaluate_timer,
                    ctx.config.submit_attempt_delay(self.submit_attempts),
                );
                Step::Stay
            }
            CommandStatus::Completed(Err(HelperError::Remote(message))) => {
                log::warn!("Job {}: submit rejected: {message}", self.id);
                self.pre_hold_reason = Some(message);
                ctx.resource.cancel_submit(self.id, ctx.senders);
                Step::Goto(RemoteState::Hold)
            }
        }
    }

    fn do_submit_commit(&mut self, ctx: &mut EvalCtx) -> Step {
        if matches!(self.status, JobStatus::Removed | JobStatus::Held) {
            return Step::Goto(RemoteState::Cancel);
        }
        // The remote id must be durable before anything else happens to the
        // job; a crash here must recover into RECOVER, not into a second
        // submission.
        if self.descriptor.is_dirty() {
            self.flush_updates(ctx.updates, true);
            Step::Stay
        } else {
            Step::Goto(RemoteState::Submitted)
        }
    }

    fn do_submitted(&mut self, ctx: &mut EvalCtx) -> Step {
        ctx.resource.submit_complete(self.id, ctx.senders);

        if matches!(self.status, JobStatus::Removed | JobStatus::Held) {
            return Step::Goto(RemoteState::Cancel);
        }
        match self.remote_status {
            Some(RemoteStatus::Completed) => return Step::Goto(RemoteState::DoneSave),
            Some(RemoteStatus::Failed) => {
                self.pre_hold_reason
                    .get_or_insert_with(|| "Job failed at the remote endpoint".to_string());
                return Step::Goto(RemoteState::Hold);
            }
            _ => {}
        }
        if let Some((credential, _)) = self.credential
            && ctx.credentials.get(credential).near_expired()
        {
            return Step::Goto(RemoteState::CredentialWait);
        }
        if ctx.resource.is_down() {
            // Wait for the resource-up notification.
            return Step::Stay;
        }

        let poll_due = match self.last_poll {
            None => true,
            Some(last) => last.elapsed() >= ctx.config.poll_interval(),
        };
        if poll_due {
            Step::Goto(RemoteState::Poll)
        } else {
            let remaining = ctx.config.poll_interval()
                - self.last_poll.map(|l| l.elapsed()).unwrap_or(Duration::ZERO);
            ctx.timers.reset(self.evaluate_timer, remaining);
            Step::Stay
        }
    }

    fn do_poll(&mut self, ctx: &mut EvalCtx) -> Step {
        self.poll_remote_status(ctx, RemoteState::Submitted)
    }

    fn do_recover(&mut self, ctx: &mut EvalCtx) -> Step {
        self.poll_remote_status(ctx, RemoteState::Submitted)
    }

    /// Issues a status query and reconciles the response. Used both for
    /// periodic polling and for restart recovery; a job with a known remote
    /// id is never re-submitted.
    fn poll_remote_status(&mut self, ctx: &mut EvalCtx, back: RemoteState) -> Step {
        let remote_id = self
            .remote_id
            .clone()
            .expect("status query without a remote id");

        if !self.command_issued {
            self.command_issued = true;
            self.last_poll = Some(Instant::now());
        }

        match ctx.resource.channel_mut().query_status(self.id, remote_id) {
            CommandStatus::NotSubmitted => {
                ctx.timers
                    .reset(self.evaluate_timer, ctx.config.poll_interval());
                Step::Stay
            }
            CommandStatus::Pending => Step::Stay,
            CommandStatus::Completed(Ok(status)) => {
                self.record_remote_status(status, ctx.events);
                if status == RemoteStatus::Unknown {
                    if self.status_unknown_count >= ctx.config.status_unknown_limit {
                        self.pre_hold_reason.get_or_insert_with(|| {
                            "Job is no longer known to the remote endpoint".to_string()
                        });
                        return Step::Goto(RemoteState::Hold);
                    }
                    ctx.timers
                        .reset(self.evaluate_timer, ctx.config.poll_interval());
                }
                Step::Goto(back)
            }
            CommandStatus::Completed(Err(HelperError::Connection(message))) => {
                log::warn!("Job {}: status query failed to connect: {message}", self.id);
                self.error_string = Some(message);
                self.connect_failures += 1;
                if self.connect_failures >= ctx.config.connect_failure_limit {
                    ctx.resource.request_ping(self.id);
                    ctx.senders.wake_resource(self.resource);
                } else {
                    ctx.timers
                        .reset(self.evaluate_timer, ctx.config.poll_interval());
                }
                self.command_issued = false;
                Step::Stay
            }
            CommandStatus::Completed(Err(HelperError::Remote(message))) => {
                log::warn!("Job {}: status query rejected: {message}", self.id);
                self.pre_hold_reason = Some(message);
                Step::Goto(RemoteState::Hold)
            }
        }
    }

    fn do_done_save(&mut self, ctx: &mut EvalCtx) -> Step {
        if self.status != JobStatus::Completed {
            self.set_job_status(JobStatus::Completed);
            self.log_event_once(JobEvent::Terminated, ctx.events);
        }
        if self.descriptor.is_dirty() {
            self.flush_updates(ctx.updates, true);
            Step::Stay
        } else {
            Step::Goto(RemoteState::DoneCommit)
        }
    }

    fn do_done_commit(&mut self, ctx: &mut EvalCtx) -> Step {
        self.set_remote_job_id(None, ctx.registry);
        self.deletion = Some(Disposition::DeleteRecord);
        Step::Goto(RemoteState::Delete)
    }

    fn do_cancel(&mut self, ctx: &mut EvalCtx) -> Step {
        let Some(remote_id) = self.remote_id.clone() else {
            return self.route_after_cancel(ctx);
        };

        match ctx.resource.channel_mut().cancel_job(self.id, remote_id) {
            CommandStatus::NotSubmitted => {
                ctx.timers
                    .reset(self.evaluate_timer, ctx.config.poll_interval());
                Step::Stay
            }
            CommandStatus::Pending => Step::Stay,
            CommandStatus::Completed(Ok(())) => {
                self.set_remote_job_id(None, ctx.registry);
                self.route_after_cancel(ctx)
            }
            CommandStatus::Completed(Err(HelperError::Connection(message))) => {
                log::warn!("Job {}: cancel failed to connect: {message}", self.id);
                self.connect_failures += 1;
                if self.connect_failures >= ctx.config.connect_failure_limit {
                    ctx.resource.request_ping(self.id);
                    ctx.senders.wake_resource(self.resource);
                } else {
                    ctx.timers
                        .reset(self.evaluate_timer, ctx.config.poll_interval());
                }
                Step::Stay
            }
            CommandStatus::Completed(Err(HelperError::Remote(message))) => {
                // Cancellation is best effort; the remote record may simply
                // be gone already.
                log::warn!("Job {}: cancel rejected: {message}", self.id);
                self.set_remote_job_id(None, ctx.registry);
                self.route_after_cancel(ctx)
            }
        }
    }

    fn route_after_cancel(&mut self, ctx: &mut EvalCtx) -> Step {
        match self.status {
            JobStatus::Removed => {
                self.log_event_once(JobEvent::Aborted, ctx.events);
                self.deletion = Some(Disposition::DeleteRecord);
                Step::Goto(RemoteState::Delete)
            }
            JobStatus::Held => {
                self.deletion = Some(Disposition::KeepRecord);
                Step::Goto(RemoteState::Delete)
            }
            // Hold released (or edited back to idle) mid-cancellation: the
            // remote side is clean now, so submit again.
            _ => Step::Goto(RemoteState::Unsubmitted),
        }
    }

    fn do_credential_wait(&mut self, ctx: &mut EvalCtx) -> Step {
        if matches!(self.status, JobStatus::Removed | JobStatus::Held) {
            return if self.remote_id.is_some() {
                Step::Goto(RemoteState::Cancel)
            } else {
                Step::Goto(RemoteState::Unsubmitted)
            };
        }
        let Some((credential, _)) = self.credential else {
            return Step::Goto(RemoteState::Start);
        };
        if ctx.credentials.get(credential).near_expired() {
            // The credential watcher re-evaluates us when the file grows.
            Step::Stay
        } else {
            Step::Goto(RemoteState::Start)
        }
    }

    fn do_hold(&mut self, ctx: &mut EvalCtx) -> Step {
        if self.status != JobStatus::Held {
            let reason = self
                .pre_hold_reason
                .take()
                .or_else(|| self.error_string.clone())
                .unwrap_or_else(|| "Unspecified remote-job error".to_string());
            log::info!("Job {} held: {reason}", self.id);
            self.set_job_status(JobStatus::Held);
            self.descriptor.set(ATTR_HOLD_REASON, reason);
            self.descriptor
                .set(ATTR_HOLD_REASON_CODE, HOLD_CODE_REMOTE_ENGINE);
            self.log_event_once(JobEvent::Held, ctx.events);
        }
        if self.descriptor.is_dirty() {
            self.flush_updates(ctx.updates, true);
            Step::Stay
        } else {
            self.deletion = Some(Disposition::KeepRecord);
            Step::Goto(RemoteState::Delete)
        }
    }

    /// Records a remote status report: mirrors it into the descriptor,
    /// derives the externally-visible status transitions and fires the
    /// matching user-log events.
    fn record_remote_status(&mut self, status: RemoteStatus, events: &dyn EventSink) {
        if status == RemoteStatus::Unknown {
            self.status_unknown_count += 1;
            if self.remote_status.is_some_and(|s| s != RemoteStatus::Unknown) {
                self.log_event(JobEvent::StatusUnknown, events);
            }
        } else {
            if self.remote_status == Some(RemoteStatus::Unknown) {
                self.log_event(JobEvent::StatusKnown, events);
            }
            self.status_unknown_count = 0;
        }

        if self.remote_status == Some(status) {
            return;
        }
        log::debug!("Job {}: remote status is now {status}", self.id);
        self.descriptor
            .set(ATTR_REMOTE_JOB_STATUS, status.to_string());

        match status {
            RemoteStatus::Running => {
                if self.status == JobStatus::Idle {
                    self.set_job_status(JobStatus::Running);
                    self.log_event_once(JobEvent::Executing, events);
                }
            }
            RemoteStatus::Queued => {
                if self.status == JobStatus::Running {
                    self.set_job_status(JobStatus::Idle);
                    self.log_event_once(JobEvent::Evicted, events);
                }
            }
            RemoteStatus::Completed
            | RemoteStatus::Failed
            | RemoteStatus::Unknown => {}
        }
        self.remote_status = Some(status);
    }

    fn set_job_status(&mut self, status: JobStatus) {
        if self.status == status {
            return;
        }
        if self.status == JobStatus::Running {
            self.accumulate_wall_clock();
        }
        if status == JobStatus::Running {
            self.run_started_at = Some(SystemTime::now());
        }
        self.status = status;
        self.descriptor.set(ATTR_JOB_STATUS, status.to_attr());
    }

    fn accumulate_wall_clock(&mut self) {
        if let Some(started) = self.run_started_at.take() {
            let elapsed = SystemTime::now()
                .duration_since(started)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64();
            let total = self.descriptor.get_float(ATTR_REMOTE_WALL_CLOCK).unwrap_or(0.0);
            self.descriptor
                .set(ATTR_REMOTE_WALL_CLOCK, total + elapsed);
        }
    }

    fn set_remote_job_id(&mut self, remote_id: Option<String>, registry: &mut JobRegistry) {
        if self.remote_id == remote_id {
            return;
        }
        if let Some(old) = self.remote_id.take() {
            registry.unbind_remote_id(&old);
        }
        match &remote_id {
            Some(id) => {
                registry.bind_remote_id(id.clone(), self.id);
                self.descriptor.set(ATTR_REMOTE_JOB_ID, id.as_str());
            }
            None => self.descriptor.clear_attr(ATTR_REMOTE_JOB_ID),
        }
        self.remote_id = remote_id;
    }

    fn log_event_once(&mut self, event: JobEvent, events: &dyn EventSink) {
        let Some(flag) = self.events_logged.flag(event) else {
            self.log_event(event, events);
            return;
        };
        if *flag {
            return;
        }
        *flag = true;
        if let Err(e) = events.log_event(self.id, event, &self.descriptor) {
            log::warn!("Job {}: failed to log {event} event: {e}", self.id);
        }
    }

    fn log_event(&self, event: JobEvent, events: &dyn EventSink) {
        if let Err(e) = events.log_event(self.id, event, &self.descriptor) {
            log::warn!("Job {}: failed to log {event} event: {e}", self.id);
        }
    }

    fn flush_updates(&mut self, updates: &dyn UpdateSink, immediate: bool) {
        if self.descriptor.is_dirty() && !self.update_pending {
            updates.request_update(self.id, self.descriptor.dirty_snapshot(), immediate);
            self.update_pending = true;
        }
    }

    // Lease bookkeeping, driven by the owning resource's batching pass.

    fn lease_duration(&self, config: &EngineConfig) -> Option<Duration> {
        self.descriptor
            .get_int(ATTR_LEASE_DURATION)
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .or_else(|| config.lease_duration())
    }

    /// Decides whether this job's outbound lease needs renewal now and, if
    /// so, to which expiration.
    fn lease_renewal_target(
        &self,
        now: SystemTime,
        config: &EngineConfig,
    ) -> Option<SystemTime> {
        self.remote_id.as_ref()?;
        let duration = self.lease_duration(config)?;

        if self.last_lease_renewal_failed {
            // Retry at the expiration already promised.
            return self.lease_sent;
        }

        let candidate = now + duration;
        let reference = match (self.lease_sent, self.lease_received) {
            (None, _) => return Some(candidate),
            (Some(_), Some(received)) => received,
            (Some(sent), None) => sent,
        };
        let remaining = reference.duration_since(now).unwrap_or(Duration::ZERO);
        if remaining <= duration / 3 {
            // Never promise an earlier expiration than we already did.
            let floor = self.lease_sent.unwrap_or(candidate);
            Some(candidate.max(floor))
        } else {
            None
        }
    }

    /// Stamps the sent-lease attribute and requests its durable commit.
    /// The wire call happens only after that commit is acknowledged.
    pub fn stage_lease_renewal(
        &mut self,
        now: SystemTime,
        config: &EngineConfig,
        updates: &dyn UpdateSink,
    ) -> Option<(String, SystemTime)> {
        let target = self.lease_renewal_target(now, config)?;
        let remote_id = self.remote_id.clone()?;
        self.lease_sent = Some(target);
        self.descriptor
            .set_time(ATTR_LEASE_SENT_EXPIRATION, target);
        self.flush_updates(updates, true);
        Some((remote_id, target))
    }

    pub fn has_uncommitted_lease(&self) -> bool {
        self.descriptor
            .dirty_attrs()
            .any(|attr| attr == ATTR_LEASE_SENT_EXPIRATION)
    }

    /// Per-job bookkeeping after the batched wire call. The failure flag
    /// changes only when it actually flips, and each flip is persisted.
    pub fn lease_renewal_result(
        &mut self,
        accepted: bool,
        target: SystemTime,
        updates: &dyn UpdateSink,
    ) {
        if accepted {
            self.lease_received = Some(target);
            self.descriptor
                .set_time(ATTR_LEASE_RECEIVED_EXPIRATION, target);
            if self.last_lease_renewal_failed {
                self.last_lease_renewal_failed = false;
                self.descriptor.set(ATTR_LEASE_RENEWAL_FAILED, false);
            }
        } else if !self.last_lease_renewal_failed {
            self.last_lease_renewal_failed = true;
            self.descriptor.set(ATTR_LEASE_RENEWAL_FAILED, true);
        }
        self.flush_updates(updates, false);
    }

    #[cfg(test)]
    pub fn lease_state(&self) -> (Option<SystemTime>, Option<SystemTime>, bool) {
        (
            self.lease_sent,
            self.lease_received,
            self.last_lease_renewal_failed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rpc::{make_rpc_queue, RpcReceiver};
    use crate::config::ResourceLimits;
    use crate::credential::JsonCredentialSource;
    use crate::engine::EngineMessage;
    use crate::helper::{make_notify_queue, HelperChannel, NotifyReceiver};
    use crate::resource::ResourceName;
    use crate::tests::utils::{
        drain_notifications, init_test_logging, JobSpecBuilder, RecordingEventSink,
        RecordingUpdateSink, ScriptedHelper,
    };
    use crate::ResourceId;

    const RESOURCE: ResourceId = ResourceId::new(1);

    fn base_descriptor(cluster: u32, proc: u32) -> JobDescriptor {
        JobSpecBuilder::default()
            .cluster(cluster)
            .proc(proc)
            .build()
            .unwrap()
            .into_descriptor()
    }

    struct Fixture {
        resource: Resource,
        credentials: CredentialStore,
        registry: JobRegistry,
        timers: TimerService<TimerTarget>,
        config: EngineConfig,
        senders: EngineSenders,
        rpc_rx: RpcReceiver<EngineMessage>,
        notify_rx: NotifyReceiver,
        helper: ScriptedHelper,
        events: RecordingEventSink,
        updates: RecordingUpdateSink,
        job: Job,
    }

    impl Fixture {
        fn new(descriptor: JobDescriptor) -> Self {
            Self::with_config(descriptor, test_config())
        }

        fn with_config(descriptor: JobDescriptor, config: EngineConfig) -> Self {
            init_test_logging();
            let helper = ScriptedHelper::default();
            let events = RecordingEventSink::default();
            let updates = RecordingUpdateSink::default();
            let (notify_tx, notify_rx) = make_notify_queue();
            let channel = HelperChannel::new(helper.client(), RESOURCE, notify_tx, 8);
            let mut resource = Resource::new(
                RESOURCE,
                ResourceName::new("batch.example.com".to_string(), String::new()),
                channel,
                ResourceLimits::default(),
            );
            let (rpc_tx, rpc_rx) = make_rpc_queue();
            let senders = EngineSenders::new(rpc_tx);

            let credentials = CredentialStore::new(
                Box::new(JsonCredentialSource),
                std::env::temp_dir().join("gridgate-driver-tests"),
                config.min_credential_lifetime(),
                config.credential_check_interval(),
            );

            let mut timers = TimerService::new();
            let mut registry = JobRegistry::new();
            let id = descriptor.job_id().unwrap();
            let evaluate_timer = timers.register(
                Duration::ZERO,
                Some(config.poll_interval()),
                TimerTarget::EvaluateJob(id),
            );
            let job = Job::new(descriptor, RESOURCE, None, evaluate_timer);
            registry.insert_job(id);
            if let Some(remote) = job.remote_id() {
                registry.bind_remote_id(remote.to_string(), id);
            }
            resource.register_job(id, &senders);

            Self {
                resource,
                credentials,
                registry,
                timers,
                config,
                senders,
                rpc_rx,
                notify_rx,
                helper,
                events,
                updates,
                job,
            }
        }

        fn evaluate(&mut self) -> Option<Disposition> {
            let mut ctx = EvalCtx {
                resource: &mut self.resource,
                credentials: &mut self.credentials,
                registry: &mut self.registry,
                timers: &mut self.timers,
                config: &self.config,
                senders: &self.senders,
                updates: &self.updates,
                events: &self.events,
            };
            self.job.evaluate_state(&mut ctx)
        }

        async fn settle(&mut self) {
            drain_notifications(&mut self.notify_rx).await;
        }

        /// Acknowledges every recorded update request, like the engine does
        /// when the persistence layer commits.
        fn ack_updates(&mut self) {
            for (_, dirty, _) in self.updates.take_requests() {
                let names: Vec<String> = dirty.into_iter().map(|(name, _)| name).collect();
                self.job.update_committed(&names);
            }
        }

        /// Drives evaluate/settle/ack rounds until the predicate holds.
        async fn drive_until(&mut self, what: &str, predicate: impl Fn(&Job) -> bool) {
            for _ in 0..16 {
                if predicate(&self.job) {
                    return;
                }
                self.evaluate();
                self.settle().await;
                self.ack_updates();
            }
            panic!(
                "job never reached {what}, stuck in {}",
                self.job.remote_state()
            );
        }

        fn engine_messages(&mut self) -> Vec<EngineMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rpc_rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn test_config() -> EngineConfig {
        toml::from_str(
            r#"
            poll_interval_secs = 0
            submit_delays_secs = [0]
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn removal_mid_flight_cancels_remotely_before_deletion() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let mut f = Fixture::new(base_descriptor(1, 0));
                f.drive_until("a remote id", |job| job.remote_id().is_some())
                    .await;
                let remote_id = f.job.remote_id().unwrap().to_string();

                // The user removes the job while it lives remotely.
                let mut change = Map::default();
                change.insert(
                    ATTR_JOB_STATUS.to_string(),
                    AttrValue::Int(JobStatus::Removed.to_attr()),
                );
                f.job.refresh_from(&change);

                let mut disposition = f.evaluate();
                for _ in 0..8 {
                    if disposition.is_some() {
                        break;
                    }
                    f.settle().await;
                    f.ack_updates();
                    disposition = f.evaluate();
                }

                assert_eq!(disposition, Some(Disposition::DeleteRecord));
                assert_eq!(
                    f.helper.with_state(|s| s.canceled_jobs.clone()),
                    vec![remote_id]
                );
                let id = f.job.id();
                let events = f.events.events_for(id);
                assert!(events.contains(&JobEvent::Aborted));
                // Cleanup cleared the remote binding.
                assert!(f.job.remote_id().is_none());

                // The engine-side unregistration leaves no slot behind.
                f.resource.unregister_job(id, &f.senders);
                assert_eq!(f.resource.queue_lengths(), (0, 0, 0, 0));
            })
            .await;
    }

    #[tokio::test]
    async fn pending_submission_rejected_with_reason_ends_held() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let mut f = Fixture::new(base_descriptor(2, 0));
                f.helper
                    .push_submit(Err(HelperError::Remote("quota exceeded".to_string())));

                // Three evaluations while the command is pending: no state
                // change, no extra submissions.
                assert!(f.evaluate().is_none());
                assert!(f.evaluate().is_none());
                assert!(f.evaluate().is_none());
                assert_eq!(f.job.remote_state(), RemoteState::Submit);
                assert_eq!(f.resource.queue_lengths(), (1, 0, 1, 0));
                assert_eq!(f.helper.with_state(|s| s.submitted_jobs.len()), 1);

                f.settle().await;
                assert!(f.evaluate().is_none());
                assert_eq!(f.job.status(), JobStatus::Held);
                assert!(f.job.hold_reason().unwrap().contains("quota exceeded"));
                // The admission slot was released by the failure path.
                assert_eq!(f.resource.queue_lengths(), (0, 0, 0, 0));

                f.ack_updates();
                assert_eq!(f.evaluate(), Some(Disposition::KeepRecord));
                assert!(f.events.events_for(f.job.id()).contains(&JobEvent::Held));

                // Engine unregistration afterwards changes nothing: the
                // slot cannot be released twice.
                f.resource.unregister_job(f.job.id(), &f.senders);
                assert_eq!(f.resource.queue_lengths(), (0, 0, 0, 0));
            })
            .await;
    }

    #[tokio::test]
    async fn repeated_connection_failures_request_a_probe() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let mut f = Fixture::new(base_descriptor(3, 0));
                for _ in 0..3 {
                    f.helper
                        .push_submit(Err(HelperError::Connection("timed out".to_string())));
                }

                for _ in 0..3 {
                    f.evaluate();
                    f.settle().await;
                    f.evaluate();
                }

                assert_eq!(f.job.remote_state(), RemoteState::Submit);
                assert_eq!(f.job.status(), JobStatus::Idle);
                let woke_resource = f
                    .engine_messages()
                    .iter()
                    .any(|msg| matches!(msg, EngineMessage::WakeResource(_)));
                assert!(woke_resource, "no probe was requested");
            })
            .await;
    }

    #[tokio::test]
    async fn too_many_submit_attempts_end_in_hold() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let config: EngineConfig = toml::from_str(
                    r#"
                    poll_interval_secs = 0
                    submit_delays_secs = [0]
                    max_submit_attempts = 2
                    "#,
                )
                .unwrap();
                let mut f = Fixture::with_config(base_descriptor(4, 0), config);
                for _ in 0..2 {
                    f.helper
                        .push_submit(Err(HelperError::Connection("timed out".to_string())));
                }

                for _ in 0..2 {
                    f.evaluate();
                    f.settle().await;
                    f.evaluate();
                }
                // The next evaluation trips the attempt limit.
                f.evaluate();
                assert_eq!(f.job.status(), JobStatus::Held);
                let reason = f.job.hold_reason().unwrap();
                assert!(reason.contains("Too many failed submit attempts"));
                assert!(reason.contains("timed out"));

                f.ack_updates();
                assert_eq!(f.evaluate(), Some(Disposition::KeepRecord));
            })
            .await;
    }

    #[tokio::test]
    async fn near_expired_credential_parks_the_job_until_renewal() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let dir = tempfile::TempDir::new().unwrap();
                let expiration = SystemTime::now() + Duration::from_secs(60);
                let secs = expiration
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap()
                    .as_secs();
                let path = dir.path().join("credential");
                std::fs::write(
                    &path,
                    format!(r#"{{"subject": "alice", "expiration": {secs}}}"#),
                )
                .unwrap();

                let descriptor = JobSpecBuilder::default()
                    .cluster(5)
                    .credential_file(Some(path.to_string_lossy().into_owned()))
                    .build()
                    .unwrap()
                    .into_descriptor();

                let mut f = Fixture::new(descriptor);
                // Acquire the credential like the engine would; it expires
                // in 60s, which is inside the 180s minimum lifetime.
                let id = f.job.id();
                let acquired = f
                    .credentials
                    .acquire(&path, f.senders.evaluate_watcher(id))
                    .unwrap();
                f.job.credential = Some(acquired);

                f.evaluate();
                assert_eq!(f.job.remote_state(), RemoteState::CredentialWait);
                assert!(f.helper.with_state(|s| s.submitted_jobs.is_empty()));

                // The credential is renewed out-of-band.
                let renewed = SystemTime::now() + Duration::from_secs(7200);
                let secs = renewed
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap()
                    .as_secs();
                std::fs::write(
                    &path,
                    format!(r#"{{"subject": "alice", "expiration": {secs}}}"#),
                )
                .unwrap();
                f.credentials.check_credentials(SystemTime::now());
                let woken = f
                    .engine_messages()
                    .iter()
                    .any(|msg| matches!(msg, EngineMessage::Evaluate(evaluated) if *evaluated == id));
                assert!(woken, "credential renewal did not wake the job");

                f.evaluate();
                assert_eq!(f.job.remote_state(), RemoteState::Submit);
            })
            .await;
    }

    #[test]
    fn lease_policy_first_renewal_and_never_shrink() {
        let descriptor = JobSpecBuilder::default()
            .cluster(6)
            .remote_id(Some("batch/6".to_string()))
            .build()
            .unwrap()
            .into_descriptor();
        let config = EngineConfig::default();
        let updates = RecordingUpdateSink::default();
        let mut job = Job::new(descriptor, RESOURCE, None, TimerId::new(1));

        let now = SystemTime::now();
        // No lease sent yet: renew to now + duration, durably first.
        let (remote, target) = job.stage_lease_renewal(now, &config, &updates).unwrap();
        assert_eq!(remote, "batch/6");
        assert_eq!(target, now + Duration::from_secs(3600));
        assert!(job.has_uncommitted_lease());
        assert_eq!(updates.updates.borrow().len(), 1);
        assert!(updates.updates.borrow()[0].2, "lease staging must be immediate");

        // The remote grants the lease.
        job.update_committed(&[ATTR_LEASE_SENT_EXPIRATION.to_string()]);
        job.lease_renewal_result(true, target, &updates);
        let (sent, received, failed) = job.lease_state();
        assert_eq!(sent, Some(target));
        assert_eq!(received, Some(target));
        assert!(!failed);

        // Not yet in the last third: nothing to renew.
        let early = now + Duration::from_secs(1200);
        assert!(job.stage_lease_renewal(early, &config, &updates).is_none());

        // In the last third: renew, and never to an earlier expiration
        // than already promised.
        let late = now + Duration::from_secs(2500);
        let (_, second_target) = job.stage_lease_renewal(late, &config, &updates).unwrap();
        assert!(second_target >= target);
        assert_eq!(second_target, late + Duration::from_secs(3600));
    }

    #[test]
    fn lease_failure_flag_flips_once_and_retries_same_target() {
        let descriptor = JobSpecBuilder::default()
            .cluster(7)
            .remote_id(Some("batch/7".to_string()))
            .build()
            .unwrap()
            .into_descriptor();
        let config = EngineConfig::default();
        let updates = RecordingUpdateSink::default();
        let mut job = Job::new(descriptor, RESOURCE, None, TimerId::new(1));

        let now = SystemTime::now();
        let (_, target) = job.stage_lease_renewal(now, &config, &updates).unwrap();
        job.update_committed(&[ATTR_LEASE_SENT_EXPIRATION.to_string()]);
        updates.take_requests();

        // The renewal fails: the flag flips (one persistence request).
        job.lease_renewal_result(false, target, &updates);
        assert!(job.lease_state().2);
        assert_eq!(updates.updates.borrow().len(), 1);
        job.update_committed(&[ATTR_LEASE_RENEWAL_FAILED.to_string()]);

        // A failed renewal is retried at the very same target expiration.
        let much_later = now + Duration::from_secs(3000);
        let (_, retry_target) = job
            .stage_lease_renewal(much_later, &config, &updates)
            .unwrap();
        assert_eq!(retry_target, target);

        // Success flips the flag back exactly once.
        job.lease_renewal_result(true, retry_target, &updates);
        assert!(!job.lease_state().2);
    }
}
