//! One remote endpoint: admission control for concurrent submits and held
//! remote jobs, up/down health probing, and batched lease renewal for every
//! job bound to the endpoint.
//!
//! The four admission queues are mutated only by the resource's own methods,
//! called synchronously from job evaluations or the resource's own timer
//! context. Promotions never act on the promoted job directly; they schedule
//! its re-evaluation through the engine queue.

use std::time::{Instant, SystemTime};

use smallvec::SmallVec;

use crate::common::ids::{CredentialId, JobId, ResourceId, WatchToken};
use crate::config::{EngineConfig, ResourceLimits};
use crate::engine::EngineSenders;
use crate::events::UpdateSink;
use crate::helper::{CommandStatus, HelperChannel, LeaseRenewal};
use crate::job::Job;
use crate::{Map, Set};

/// Canonical identity of one endpoint: where it is plus who we are when
/// talking to it.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ResourceName {
    endpoint: String,
    identity: String,
}

impl ResourceName {
    pub fn new(endpoint: String, identity: String) -> Self {
        Self { endpoint, identity }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.identity.is_empty() {
            f.write_str(&self.endpoint)
        } else {
            write!(f, "{} ({})", self.endpoint, self.identity)
        }
    }
}

type JobQueue = SmallVec<[JobId; 4]>;

/// Lease-renewal batch progress. A new batch can only start from `Idle`;
/// a batch becoming due while another is mid-flight simply waits.
enum LeaseBatch {
    Idle {
        last_batch: Option<Instant>,
    },
    /// Lease attributes are staged; waiting for the persistence layer to
    /// commit them before anything goes on the wire.
    WaitingDurability {
        staged: Map<JobId, (String, SystemTime)>,
    },
    /// The wire call is in flight.
    WaitingWire {
        batch: Vec<(JobId, LeaseRenewal)>,
    },
}

pub struct Resource {
    id: ResourceId,
    name: ResourceName,
    channel: HelperChannel,
    limits: ResourceLimits,
    registered: Set<JobId>,

    submits_in_progress: JobQueue,
    submits_queued: JobQueue,
    submits_allowed: JobQueue,
    submits_wanted: JobQueue,

    down: bool,
    first_ping_done: bool,
    ping_in_flight: bool,
    last_ping: Option<Instant>,
    last_status_change: Option<SystemTime>,
    ping_requesters: Vec<JobId>,

    /// Endpoint-level credential: the master credential of this resource's
    /// identity, shared with every sibling job credential.
    master_credential: Option<(CredentialId, WatchToken)>,

    leases: LeaseBatch,
}

impl Resource {
    pub fn new(
        id: ResourceId,
        name: ResourceName,
        channel: HelperChannel,
        limits: ResourceLimits,
    ) -> Self {
        log::debug!("Creating resource {name}");
        Self {
            id,
            name,
            channel,
            limits,
            registered: Set::default(),
            submits_in_progress: SmallVec::new(),
            submits_queued: SmallVec::new(),
            submits_allowed: SmallVec::new(),
            submits_wanted: SmallVec::new(),
            down: false,
            first_ping_done: false,
            ping_in_flight: false,
            last_ping: None,
            last_status_change: None,
            ping_requesters: Vec::new(),
            master_credential: None,
            leases: LeaseBatch::Idle { last_batch: None },
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn channel_mut(&mut self) -> &mut HelperChannel {
        &mut self.channel
    }

    pub fn is_down(&self) -> bool {
        self.down
    }

    pub fn first_ping_done(&self) -> bool {
        self.first_ping_done
    }

    pub fn last_status_change(&self) -> Option<SystemTime> {
        self.last_status_change
    }

    pub fn has_registered_jobs(&self) -> bool {
        !self.registered.is_empty()
    }

    pub fn set_master_credential(&mut self, credential: Option<(CredentialId, WatchToken)>) {
        self.master_credential = credential;
    }

    pub fn take_master_credential(&mut self) -> Option<(CredentialId, WatchToken)> {
        self.master_credential.take()
    }

    /// Binds a job to this resource. Once the first probe has resolved, a
    /// late registrant immediately learns the current endpoint status.
    pub fn register_job(&mut self, job: JobId, senders: &EngineSenders) {
        if self.registered.insert(job) && self.first_ping_done {
            senders.notify_resource_state(job, !self.down);
        }
    }

    /// Unbinds a job, releasing whatever admission slots it still holds.
    pub fn unregister_job(&mut self, job: JobId, senders: &EngineSenders) {
        self.cancel_submit(job, senders);
        self.registered.remove(&job);
        self.ping_requesters.retain(|id| *id != job);
        if let LeaseBatch::WaitingDurability { staged } = &mut self.leases {
            staged.remove(&job);
        }
        self.channel.discard_job_commands(job);
    }

    /// Asks for permission to start a submit operation. `false` means the
    /// job is parked in an admission queue and will be re-evaluated when a
    /// slot frees up; `true` means go ahead (and the job now occupies a
    /// submit slot until `submit_complete` or `cancel_submit`).
    pub fn request_submit(&mut self, job: JobId, _senders: &EngineSenders) -> bool {
        if contains(&self.submits_in_progress, job) {
            return true;
        }
        if contains(&self.submits_queued, job) {
            return false;
        }

        // Gate one: how many remote jobs may exist at once.
        if !contains(&self.submits_allowed, job) {
            if self.submits_allowed.len() >= self.limits.job_limit {
                push_unique(&mut self.submits_wanted, job);
                self.check_invariants();
                return false;
            }
            remove(&mut self.submits_wanted, job);
            self.submits_allowed.push(job);
        }

        // Gate two: how many submit operations may be in flight at once.
        if self.submits_in_progress.len() >= self.limits.submit_limit {
            push_unique(&mut self.submits_queued, job);
            self.check_invariants();
            return false;
        }
        self.submits_in_progress.push(job);
        self.check_invariants();
        true
    }

    /// Gives up on submitting: releases the submit slot and the remote-job
    /// slot, promoting queued waiters.
    pub fn cancel_submit(&mut self, job: JobId, senders: &EngineSenders) {
        if remove(&mut self.submits_in_progress, job) {
            self.promote_queued(senders);
        }
        remove(&mut self.submits_queued, job);
        remove(&mut self.submits_wanted, job);
        if remove(&mut self.submits_allowed, job) {
            self.promote_wanted(senders);
        }
        self.check_invariants();
    }

    /// The submit operation finished (either way); the submit slot is freed
    /// but the job keeps counting against the remote-job limit.
    pub fn submit_complete(&mut self, job: JobId, senders: &EngineSenders) {
        if remove(&mut self.submits_in_progress, job) {
            self.promote_queued(senders);
        }
        remove(&mut self.submits_queued, job);
        self.check_invariants();
    }

    /// Applies new limits, promoting as many parked jobs as the new
    /// capacity admits in one pass.
    pub fn reconfig(&mut self, limits: ResourceLimits, senders: &EngineSenders) {
        self.limits = limits;
        while self.submits_allowed.len() < self.limits.job_limit
            && !self.submits_wanted.is_empty()
        {
            self.promote_wanted(senders);
        }
        while self.submits_in_progress.len() < self.limits.submit_limit
            && !self.submits_queued.is_empty()
        {
            self.promote_queued(senders);
        }
        self.check_invariants();
    }

    fn promote_wanted(&mut self, senders: &EngineSenders) {
        if self.submits_allowed.len() < self.limits.job_limit
            && !self.submits_wanted.is_empty()
        {
            let job = self.submits_wanted.remove(0);
            self.submits_allowed.push(job);
            log::debug!("Job {job} was granted a remote-job slot on {}", self.name);
            senders.evaluate(job);
        }
    }

    fn promote_queued(&mut self, senders: &EngineSenders) {
        if self.submits_in_progress.len() < self.limits.submit_limit
            && !self.submits_queued.is_empty()
        {
            let job = self.submits_queued.remove(0);
            self.submits_in_progress.push(job);
            log::debug!("Job {job} was granted a submit slot on {}", self.name);
            senders.evaluate(job);
        }
    }

    /// Queue consistency: a non-empty waiting queue must mean the gated
    /// queue is at (or, after a limit reduction, over) capacity. Anything
    /// else leaks slots, so it aborts loudly.
    fn check_invariants(&self) {
        assert!(
            self.submits_wanted.is_empty()
                || self.submits_allowed.len() >= self.limits.job_limit,
            "resource {}: jobs wait for a remote-job slot while capacity is free",
            self.name
        );
        assert!(
            self.submits_queued.is_empty()
                || self.submits_in_progress.len() >= self.limits.submit_limit,
            "resource {}: jobs wait for a submit slot while capacity is free",
            self.name
        );
    }

    /// A job asks to learn the endpoint status from a fresh probe.
    pub fn request_ping(&mut self, job: JobId) {
        if !self.ping_requesters.contains(&job) {
            self.ping_requesters.push(job);
        }
    }

    /// Probe step, driven by the probe timer and by command completion.
    pub fn probe(&mut self, now: Instant, config: &EngineConfig, senders: &EngineSenders) {
        if self.ping_in_flight {
            match self.channel.ping() {
                CommandStatus::Pending | CommandStatus::NotSubmitted => {}
                CommandStatus::Completed(result) => {
                    self.ping_in_flight = false;
                    self.ping_complete(result.is_ok(), senders);
                }
            }
            return;
        }

        if self.ping_requesters.is_empty() && self.first_ping_done && !self.down {
            return;
        }
        let spacing = if self.down {
            config.probe_interval()
        } else {
            config.probe_delay()
        };
        if let Some(last) = self.last_ping
            && now.duration_since(last) < spacing
        {
            return;
        }

        match self.channel.ping() {
            CommandStatus::Pending => {
                self.ping_in_flight = true;
                self.last_ping = Some(now);
            }
            CommandStatus::NotSubmitted => {}
            CommandStatus::Completed(result) => {
                self.last_ping = Some(now);
                self.ping_complete(result.is_ok(), senders);
            }
        }
    }

    fn ping_complete(&mut self, up: bool, senders: &EngineSenders) {
        let status_changed = !self.first_ping_done || self.down == up;
        self.first_ping_done = true;

        if status_changed {
            self.down = !up;
            self.last_status_change = Some(SystemTime::now());
            if up {
                log::info!("Resource {} is up", self.name);
            } else {
                log::warn!("Resource {} is down", self.name);
            }
            for job in &self.registered {
                senders.notify_resource_state(*job, up);
            }
            self.ping_requesters.clear();
        } else {
            for job in self.ping_requesters.drain(..) {
                senders.notify_resource_state(job, up);
            }
        }
    }

    /// Lease step, driven by the lease timer, by update-commit
    /// acknowledgements and by command completion.
    pub fn update_leases(
        &mut self,
        jobs: &mut Map<JobId, Job>,
        config: &EngineConfig,
        updates: &dyn UpdateSink,
        now: Instant,
    ) {
        match &mut self.leases {
            LeaseBatch::WaitingWire { batch } => {
                let renewals: Vec<LeaseRenewal> =
                    batch.iter().map(|(_, renewal)| renewal.clone()).collect();
                match self.channel.renew_leases(renewals) {
                    CommandStatus::Pending | CommandStatus::NotSubmitted => {}
                    CommandStatus::Completed(result) => {
                        let batch = std::mem::take(batch);
                        self.leases = LeaseBatch::Idle {
                            last_batch: Some(now),
                        };
                        self.apply_lease_results(batch, result, jobs, updates);
                    }
                }
            }
            LeaseBatch::WaitingDurability { .. } => {
                self.try_start_lease_wire(jobs);
            }
            LeaseBatch::Idle { last_batch } => {
                if let Some(last) = *last_batch
                    && now.duration_since(last) < config.lease_check_interval()
                {
                    return;
                }
                let mut staged: Map<JobId, (String, SystemTime)> = Map::default();
                for job_id in &self.registered {
                    let Some(job) = jobs.get_mut(job_id) else {
                        continue;
                    };
                    if let Some((remote_id, target)) =
                        job.stage_lease_renewal(SystemTime::now(), config, updates)
                    {
                        staged.insert(*job_id, (remote_id, target));
                    }
                }
                if staged.is_empty() {
                    *last_batch = Some(now);
                    return;
                }
                log::debug!(
                    "Resource {}: staged {} lease renewals",
                    self.name,
                    staged.len()
                );
                self.leases = LeaseBatch::WaitingDurability { staged };
                self.try_start_lease_wire(jobs);
            }
        }
    }

    /// A job's dirty attributes were committed; if a staged lease batch was
    /// waiting for exactly that, the wire call can go out now.
    pub fn lease_update_committed(&mut self, jobs: &Map<JobId, Job>) {
        if matches!(self.leases, LeaseBatch::WaitingDurability { .. }) {
            self.try_start_lease_wire(jobs);
        }
    }

    fn try_start_lease_wire(&mut self, jobs: &Map<JobId, Job>) {
        let LeaseBatch::WaitingDurability { staged } = &self.leases else {
            return;
        };
        let still_dirty = staged.keys().any(|job_id| {
            jobs.get(job_id)
                .is_some_and(|job| job.has_uncommitted_lease())
        });
        if still_dirty {
            return;
        }

        let batch: Vec<(JobId, LeaseRenewal)> = staged
            .iter()
            .filter(|(job_id, _)| jobs.contains_key(*job_id))
            .map(|(job_id, (remote_id, expiration))| {
                (*job_id, LeaseRenewal {
                    remote_id: remote_id.clone(),
                    expiration: *expiration,
                })
            })
            .collect();
        if batch.is_empty() {
            self.leases = LeaseBatch::Idle {
                last_batch: Some(Instant::now()),
            };
            return;
        }

        let renewals: Vec<LeaseRenewal> = batch.iter().map(|(_, r)| r.clone()).collect();
        match self.channel.renew_leases(renewals) {
            CommandStatus::Pending => {
                log::debug!(
                    "Resource {}: lease renewal batch of {} jobs sent",
                    self.name,
                    batch.len()
                );
                self.leases = LeaseBatch::WaitingWire { batch };
            }
            // Channel saturated; the staged batch stays and a later wake
            // retries the call.
            CommandStatus::NotSubmitted => {}
            CommandStatus::Completed(_) => {
                unreachable!("a freshly started command cannot be complete")
            }
        }
    }

    fn apply_lease_results(
        &mut self,
        batch: Vec<(JobId, LeaseRenewal)>,
        result: crate::helper::HelperResult<Vec<(String, bool)>>,
        jobs: &mut Map<JobId, Job>,
        updates: &dyn UpdateSink,
    ) {
        let acks: Map<String, bool> = match result {
            Ok(acks) => acks.into_iter().collect(),
            Err(e) => {
                log::warn!("Resource {}: lease renewal batch failed: {e}", self.name);
                Map::default()
            }
        };
        for (job_id, renewal) in batch {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            let accepted = acks.get(&renewal.remote_id).copied().unwrap_or(false);
            job.lease_renewal_result(accepted, renewal.expiration, updates);
        }
    }

    #[cfg(test)]
    pub fn queue_lengths(&self) -> (usize, usize, usize, usize) {
        (
            self.submits_in_progress.len(),
            self.submits_queued.len(),
            self.submits_allowed.len(),
            self.submits_wanted.len(),
        )
    }

    #[cfg(test)]
    pub fn queue_contents(&self) -> (Vec<JobId>, Vec<JobId>, Vec<JobId>, Vec<JobId>) {
        (
            self.submits_in_progress.to_vec(),
            self.submits_queued.to_vec(),
            self.submits_allowed.to_vec(),
            self.submits_wanted.to_vec(),
        )
    }
}

fn contains(queue: &JobQueue, job: JobId) -> bool {
    queue.iter().any(|id| *id == job)
}

fn push_unique(queue: &mut JobQueue, job: JobId) {
    if !contains(queue, job) {
        queue.push(job);
    }
}

fn remove(queue: &mut JobQueue, job: JobId) -> bool {
    match queue.iter().position(|id| *id == job) {
        Some(index) => {
            queue.remove(index);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rpc::make_rpc_queue;
    use crate::engine::EngineMessage;
    use crate::helper::make_notify_queue;
    use crate::tests::utils::{drain_notifications, ScriptedHelper};
    use crate::helper::HelperError;

    struct Fixture {
        resource: Resource,
        senders: EngineSenders,
        rx: crate::common::rpc::RpcReceiver<EngineMessage>,
        helper: ScriptedHelper,
        notify_rx: crate::helper::NotifyReceiver,
    }

    impl Fixture {
        fn new(submit_limit: usize, job_limit: usize) -> Self {
            let helper = ScriptedHelper::default();
            let (notify_tx, notify_rx) = make_notify_queue();
            let id = ResourceId::new(1);
            let channel = HelperChannel::new(helper.client(), id, notify_tx, 8);
            let resource = Resource::new(
                id,
                ResourceName::new("batch.example.com".to_string(), "alice".to_string()),
                channel,
                ResourceLimits {
                    submit_limit,
                    job_limit,
                },
            );
            let (tx, rx) = make_rpc_queue();
            Self {
                resource,
                senders: EngineSenders::new(tx),
                rx,
                helper,
                notify_rx,
            }
        }

        fn evaluations(&mut self) -> Vec<JobId> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let EngineMessage::Evaluate(job) = msg {
                    out.push(job);
                }
            }
            out
        }

        fn resource_notifications(&mut self) -> Vec<(JobId, bool)> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let EngineMessage::NotifyResourceState { job, up } = msg {
                    out.push((job, up));
                }
            }
            out
        }
    }

    fn job(n: u32) -> JobId {
        JobId::new(1, n)
    }

    #[test]
    fn admission_gates_on_both_limits() {
        let mut f = Fixture::new(1, 2);

        assert!(f.resource.request_submit(job(0), &f.senders));
        assert_eq!(f.resource.queue_lengths(), (1, 0, 1, 0));

        // Second job passes the job-limit gate but hits the submit limit.
        assert!(!f.resource.request_submit(job(1), &f.senders));
        assert_eq!(f.resource.queue_lengths(), (1, 1, 2, 0));

        // Third job does not even get a remote-job slot.
        assert!(!f.resource.request_submit(job(2), &f.senders));
        assert_eq!(f.resource.queue_lengths(), (1, 1, 2, 1));

        // Re-asking changes nothing.
        assert!(f.resource.request_submit(job(0), &f.senders));
        assert!(!f.resource.request_submit(job(1), &f.senders));
        assert!(!f.resource.request_submit(job(2), &f.senders));
        assert_eq!(f.resource.queue_lengths(), (1, 1, 2, 1));
    }

    #[test]
    fn request_then_cancel_is_neutral() {
        let mut f = Fixture::new(1, 1);

        // From an empty resource.
        let before = f.resource.queue_lengths();
        f.resource.request_submit(job(9), &f.senders);
        f.resource.cancel_submit(job(9), &f.senders);
        assert_eq!(f.resource.queue_lengths(), before);

        // From a fully saturated resource.
        assert!(f.resource.request_submit(job(0), &f.senders));
        let before = f.resource.queue_lengths();
        f.resource.request_submit(job(9), &f.senders);
        f.resource.cancel_submit(job(9), &f.senders);
        assert_eq!(f.resource.queue_lengths(), before);
    }

    #[test]
    fn cancel_promotes_wanted_job_into_allowed_only() {
        // Concrete scenario: jobLimit=1, submitLimit=1.
        let mut f = Fixture::new(1, 1);

        assert!(f.resource.request_submit(job(0), &f.senders));
        let (in_progress, _, _, _) = f.resource.queue_contents();
        assert_eq!(in_progress, vec![job(0)]);

        assert!(!f.resource.request_submit(job(1), &f.senders));
        let (_, _, _, wanted) = f.resource.queue_contents();
        assert_eq!(wanted, vec![job(1)]);
        f.evaluations();

        f.resource.cancel_submit(job(0), &f.senders);
        let (in_progress, queued, allowed, wanted) = f.resource.queue_contents();
        assert_eq!(allowed, vec![job(1)]);
        assert!(in_progress.is_empty());
        assert!(queued.is_empty());
        assert!(wanted.is_empty());
        // The promoted job was scheduled for re-evaluation exactly once.
        assert_eq!(f.evaluations(), vec![job(1)]);

        // It still has to ask again to take the submit slot.
        assert!(f.resource.request_submit(job(1), &f.senders));
        let (in_progress, _, _, _) = f.resource.queue_contents();
        assert_eq!(in_progress, vec![job(1)]);
    }

    #[test]
    fn submit_complete_frees_submit_slot_but_keeps_job_slot() {
        let mut f = Fixture::new(1, 4);

        assert!(f.resource.request_submit(job(0), &f.senders));
        assert!(!f.resource.request_submit(job(1), &f.senders));
        assert_eq!(f.resource.queue_lengths(), (1, 1, 2, 0));
        f.evaluations();

        f.resource.submit_complete(job(0), &f.senders);
        let (in_progress, queued, allowed, _) = f.resource.queue_contents();
        assert_eq!(in_progress, vec![job(1)]);
        assert!(queued.is_empty());
        // Both jobs still count against the remote-job limit.
        assert_eq!(allowed.len(), 2);
        assert_eq!(f.evaluations(), vec![job(1)]);
    }

    #[test]
    fn widening_limits_promotes_exactly_the_new_capacity() {
        let mut f = Fixture::new(1, 1);
        assert!(f.resource.request_submit(job(0), &f.senders));
        for n in 1..5 {
            assert!(!f.resource.request_submit(job(n), &f.senders));
        }
        assert_eq!(f.resource.queue_lengths(), (1, 0, 1, 4));
        f.evaluations();

        // Widen the job limit by 2: exactly two of the four waiters move.
        f.resource.reconfig(
            ResourceLimits {
                submit_limit: 1,
                job_limit: 3,
            },
            &f.senders,
        );
        assert_eq!(f.resource.queue_lengths(), (1, 0, 3, 2));
        assert_eq!(f.evaluations(), vec![job(1), job(2)]);

        // Widen beyond the queue length: only the remaining two move.
        f.resource.reconfig(
            ResourceLimits {
                submit_limit: 1,
                job_limit: 10,
            },
            &f.senders,
        );
        assert_eq!(f.resource.queue_lengths(), (1, 0, 5, 0));
        assert_eq!(f.evaluations(), vec![job(3), job(4)]);
    }

    #[test]
    fn unregister_releases_all_slots() {
        let mut f = Fixture::new(1, 1);
        f.resource.register_job(job(0), &f.senders);
        f.resource.register_job(job(1), &f.senders);
        assert!(f.resource.request_submit(job(0), &f.senders));
        assert!(!f.resource.request_submit(job(1), &f.senders));
        f.evaluations();

        f.resource.unregister_job(job(0), &f.senders);
        let (in_progress, _, allowed, wanted) = f.resource.queue_contents();
        assert!(in_progress.is_empty());
        assert_eq!(allowed, vec![job(1)]);
        assert!(wanted.is_empty());
        assert_eq!(f.evaluations(), vec![job(1)]);
    }

    #[tokio::test]
    async fn lease_batch_waits_for_durability_and_is_single_flight() {
        tokio::task::LocalSet::new()
            .run_until(async {
                use crate::common::ids::TimerId;
                use crate::tests::utils::{JobSpecBuilder, RecordingUpdateSink};

                let mut f = Fixture::new(5, 10);
                let config = EngineConfig::default();
                let updates = RecordingUpdateSink::default();

                // A job that already lives remotely.
                let descriptor = JobSpecBuilder::default()
                    .remote_id(Some("batch/1".to_string()))
                    .build()
                    .unwrap()
                    .into_descriptor();
                let job_id = descriptor.job_id().unwrap();
                let managed = Job::new(descriptor, ResourceId::new(1), None, TimerId::new(9));

                let mut jobs: Map<JobId, Job> = Map::default();
                f.resource.register_job(job_id, &f.senders);
                jobs.insert(job_id, managed);

                let t0 = Instant::now();
                f.resource.update_leases(&mut jobs, &config, &updates, t0);
                // Staged and durably requested, but nothing on the wire yet.
                assert_eq!(updates.updates.borrow().len(), 1);
                assert!(f.helper.with_state(|s| s.lease_batches.is_empty()));

                // A batch becoming due mid-flight does not stage again.
                f.resource.update_leases(
                    &mut jobs,
                    &config,
                    &updates,
                    t0 + config.lease_check_interval(),
                );
                assert_eq!(updates.updates.borrow().len(), 1);

                // The commit lands; only now does the wire call go out.
                for (id, dirty, _) in updates.take_requests() {
                    let names: Vec<String> =
                        dirty.into_iter().map(|(name, _)| name).collect();
                    jobs.get_mut(&id).unwrap().update_committed(&names);
                }
                f.resource.lease_update_committed(&jobs);
                drain_notifications(&mut f.notify_rx).await;
                assert_eq!(f.helper.with_state(|s| s.lease_batches.len()), 1);

                // Completion applies the per-job bookkeeping.
                f.resource.update_leases(
                    &mut jobs,
                    &config,
                    &updates,
                    t0 + config.lease_check_interval(),
                );
                let (sent, received, failed) = jobs[&job_id].lease_state();
                assert!(sent.is_some());
                assert_eq!(received, sent);
                assert!(!failed);
            })
            .await;
    }

    #[tokio::test]
    async fn first_probe_notifies_every_registered_job() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let mut f = Fixture::new(1, 10);
                let config = EngineConfig::default();
                f.resource.register_job(job(0), &f.senders);
                f.resource.register_job(job(1), &f.senders);
                // No synthetic notification before the first probe resolves.
                assert!(f.resource_notifications().is_empty());

                f.resource.probe(Instant::now(), &config, &f.senders);
                drain_notifications(&mut f.notify_rx).await;
                f.resource.probe(Instant::now(), &config, &f.senders);

                let mut notified = f.resource_notifications();
                notified.sort();
                assert_eq!(notified, vec![(job(0), true), (job(1), true)]);
                assert!(f.resource.first_ping_done());
                assert!(!f.resource.is_down());

                // A job registering after the first probe learns the status
                // right away.
                f.resource.register_job(job(2), &f.senders);
                assert_eq!(f.resource_notifications(), vec![(job(2), true)]);
            })
            .await;
    }

    #[tokio::test]
    async fn status_change_broadcasts_and_clears_requesters() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let mut f = Fixture::new(1, 10);
                let config = EngineConfig::default();
                f.resource.register_job(job(0), &f.senders);
                f.resource.register_job(job(1), &f.senders);

                // First probe: up.
                f.resource.probe(Instant::now(), &config, &f.senders);
                drain_notifications(&mut f.notify_rx).await;
                f.resource.probe(Instant::now(), &config, &f.senders);
                f.resource_notifications();

                // A requester asks for a fresh probe; the endpoint answers
                // and the status has not changed, so only the requester is
                // notified.
                f.resource.request_ping(job(0));
                let later = Instant::now() + config.probe_delay();
                f.resource.probe(later, &config, &f.senders);
                drain_notifications(&mut f.notify_rx).await;
                f.resource.probe(later, &config, &f.senders);
                assert_eq!(f.resource_notifications(), vec![(job(0), true)]);

                // The endpoint goes down: everyone hears about it.
                f.helper
                    .push_ping(Err(HelperError::Connection("refused".to_string())));
                f.resource.request_ping(job(1));
                let even_later = later + config.probe_delay();
                f.resource.probe(even_later, &config, &f.senders);
                drain_notifications(&mut f.notify_rx).await;
                f.resource.probe(even_later, &config, &f.senders);
                let mut notified = f.resource_notifications();
                notified.sort();
                assert_eq!(notified, vec![(job(0), false), (job(1), false)]);
                assert!(f.resource.is_down());
            })
            .await;
    }
}
