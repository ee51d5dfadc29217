//! The engine: a single cooperative task owning every job, resource and
//! credential, driven by timers and by messages from the surrounding
//! scheduler. Nothing here blocks; remote work happens in spawned local
//! tasks behind the helper channels and completion notifications are folded
//! back into this loop.

pub mod registry;
pub mod timer;

use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use crate::common::ids::{IdCounter, JobId, ResourceId, TimerId};
use crate::common::rpc::{initiate_request, make_rpc_queue, ResponseToken, RpcReceiver, RpcSender};
use crate::config::EngineConfig;
use crate::credential::{CredentialSource, CredentialStore, CredentialWatcher};
use crate::descriptor::{ATTR_CREDENTIAL_FILE, ATTR_REMOTE_ENDPOINT, AttrValue, JobDescriptor};
use crate::events::{EventSink, UpdateSink};
use crate::helper::{
    make_notify_queue, HelperChannel, NotifyReceiver, NotifySender, NotifyTarget, RemoteHelper,
    RemoteStatus,
};
use crate::job::{Disposition, EvalCtx, Job, JobStatus};
use crate::resource::{Resource, ResourceName};
use crate::Map;

use registry::JobRegistry;
use timer::TimerService;

/// Upper bound on concurrently in-flight helper commands per resource.
const MAX_INFLIGHT_COMMANDS_PER_RESOURCE: usize = 32;

/// How long the loop sleeps when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub enum TimerTarget {
    EvaluateJob(JobId),
    ResourceTick(ResourceId),
    CheckCredentials,
}

#[derive(Debug)]
pub enum EngineMessage {
    /// The persistence layer delivered a job destined for this engine.
    JobArrived(JobDescriptor),
    /// Committed attribute changes from outside (user removal/hold,
    /// schedd-side edits).
    JobUpdated {
        job: JobId,
        attrs: Map<String, AttrValue>,
    },
    Evaluate(JobId),
    WakeResource(ResourceId),
    /// Endpoint status notification, scheduled by the owning resource.
    NotifyResourceState { job: JobId, up: bool },
    /// The persistence layer committed the given attributes of the job.
    UpdateCommitted { job: JobId, attrs: Vec<String> },
    /// Out-of-band remote status, addressed by remote job id.
    RemoteStatusUpdate {
        remote_id: String,
        status: RemoteStatus,
    },
    Reconfig(EngineConfig),
    GetJobSnapshot(JobId, ResponseToken<Option<JobSnapshot>>),
    Quit,
}

#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub remote_state: String,
    pub remote_id: Option<String>,
    pub hold_reason: Option<String>,
}

/// Handles for scheduling work back into the engine loop. Resources and
/// jobs never call each other directly; they enqueue triggers here.
pub struct EngineSenders {
    rpc: RpcSender<EngineMessage>,
}

impl EngineSenders {
    pub fn new(rpc: RpcSender<EngineMessage>) -> Self {
        Self { rpc }
    }

    pub fn evaluate(&self, job: JobId) {
        let _ = self.rpc.send(EngineMessage::Evaluate(job));
    }

    pub fn wake_resource(&self, resource: ResourceId) {
        let _ = self.rpc.send(EngineMessage::WakeResource(resource));
    }

    pub fn notify_resource_state(&self, job: JobId, up: bool) {
        let _ = self
            .rpc
            .send(EngineMessage::NotifyResourceState { job, up });
    }

    /// Credential watcher that re-evaluates the given job.
    pub fn evaluate_watcher(&self, job: JobId) -> CredentialWatcher {
        let sender = self.rpc.clone();
        Box::new(move || {
            let _ = sender.send(EngineMessage::Evaluate(job));
        })
    }

    /// Credential watcher that wakes the given resource.
    pub fn wake_resource_watcher(&self, resource: ResourceId) -> CredentialWatcher {
        let sender = self.rpc.clone();
        Box::new(move || {
            let _ = sender.send(EngineMessage::WakeResource(resource));
        })
    }
}

/// Chooses the helper implementation for an endpoint.
pub type HelperFactory = Box<dyn Fn(&ResourceName) -> Rc<dyn RemoteHelper>>;

pub struct Engine {
    config: EngineConfig,
    jobs: Map<JobId, Job>,
    resources: Map<ResourceId, Resource>,
    resource_ids: Map<ResourceName, ResourceId>,
    resource_timers: Map<ResourceId, TimerId>,
    resource_id_counter: IdCounter,
    credentials: CredentialStore,
    registry: JobRegistry,
    timers: TimerService<TimerTarget>,
    senders: EngineSenders,
    helper_factory: HelperFactory,
    updates: Rc<dyn UpdateSink>,
    events: Rc<dyn EventSink>,
    receiver: RpcReceiver<EngineMessage>,
    completions: NotifyReceiver,
    notify_tx: NotifySender,
    credential_timer: TimerId,
}

/// Facade used by the surrounding scheduler (and by the update sink to
/// acknowledge commits).
#[derive(Clone)]
pub struct EngineService {
    sender: RpcSender<EngineMessage>,
}

impl EngineService {
    pub fn job_arrived(&self, descriptor: JobDescriptor) {
        let _ = self.sender.send(EngineMessage::JobArrived(descriptor));
    }

    pub fn job_updated(&self, job: JobId, attrs: Map<String, AttrValue>) {
        let _ = self.sender.send(EngineMessage::JobUpdated { job, attrs });
    }

    pub fn evaluate(&self, job: JobId) {
        let _ = self.sender.send(EngineMessage::Evaluate(job));
    }

    pub fn update_committed(&self, job: JobId, attrs: Vec<String>) {
        let _ = self
            .sender
            .send(EngineMessage::UpdateCommitted { job, attrs });
    }

    pub fn remote_status_update(&self, remote_id: String, status: RemoteStatus) {
        let _ = self.sender.send(EngineMessage::RemoteStatusUpdate {
            remote_id,
            status,
        });
    }

    pub fn reconfig(&self, config: EngineConfig) {
        let _ = self.sender.send(EngineMessage::Reconfig(config));
    }

    pub fn get_job_snapshot(
        &self,
        job: JobId,
    ) -> impl Future<Output = Option<JobSnapshot>> + use<> {
        let fut = initiate_request(|token| {
            let _ = self.sender.send(EngineMessage::GetJobSnapshot(job, token));
        });
        async move { fut.await.ok().flatten() }
    }

    pub fn quit(&self) {
        let _ = self.sender.send(EngineMessage::Quit);
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        helper_factory: HelperFactory,
        credential_source: Box<dyn CredentialSource>,
        updates: Rc<dyn UpdateSink>,
        events: Rc<dyn EventSink>,
    ) -> (Engine, EngineService) {
        let (sender, receiver) = make_rpc_queue();
        let (notify_tx, completions) = make_notify_queue();

        let credentials = CredentialStore::new(
            credential_source,
            config.master_credential_dir.clone(),
            config.min_credential_lifetime(),
            config.credential_check_interval(),
        );

        let mut timers = TimerService::new();
        // Periodic as a backstop; each pass resets the deadline to the
        // earliest upcoming near-expiration crossing.
        let credential_timer = timers.register(
            config.credential_check_interval(),
            Some(config.credential_check_interval()),
            TimerTarget::CheckCredentials,
        );

        let engine = Engine {
            config,
            jobs: Map::default(),
            resources: Map::default(),
            resource_ids: Map::default(),
            resource_timers: Map::default(),
            resource_id_counter: IdCounter::default(),
            credentials,
            registry: JobRegistry::new(),
            timers,
            senders: EngineSenders::new(sender.clone()),
            helper_factory,
            updates,
            events,
            receiver,
            completions,
            notify_tx,
            credential_timer,
        };
        (engine, EngineService { sender })
    }

    /// The engine loop: sleep until the earliest timer deadline, handle
    /// messages and command completions as they arrive.
    pub async fn run(mut self) {
        log::info!("Remote-job engine starting");
        loop {
            let deadline = self
                .timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline.into()) => {
                    for (_, target) in self.timers.take_due(Instant::now()) {
                        self.handle_timer(target);
                    }
                }
                msg = self.receiver.recv() => {
                    match msg {
                        None | Some(EngineMessage::Quit) => break,
                        Some(msg) => self.handle_message(msg),
                    }
                }
                Some(target) = self.completions.recv() => {
                    self.handle_completion(target);
                }
            }
        }
        log::info!("Remote-job engine stopped");
    }

    fn handle_timer(&mut self, target: TimerTarget) {
        match target {
            TimerTarget::EvaluateJob(job) => self.evaluate_job(job),
            TimerTarget::ResourceTick(resource) => self.resource_step(resource),
            TimerTarget::CheckCredentials => {
                let delay = self.credentials.check_credentials(SystemTime::now());
                self.timers.reset(self.credential_timer, delay);
            }
        }
    }

    fn handle_completion(&mut self, target: NotifyTarget) {
        match target {
            NotifyTarget::Job(job) => self.evaluate_job(job),
            NotifyTarget::Resource(resource) => self.resource_step(resource),
        }
    }

    fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::JobArrived(descriptor) => self.add_job(descriptor),
            EngineMessage::JobUpdated { job, attrs } => {
                if let Some(entry) = self.jobs.get_mut(&job) {
                    entry.refresh_from(&attrs);
                    self.evaluate_job(job);
                }
            }
            EngineMessage::Evaluate(job) => self.evaluate_job(job),
            EngineMessage::WakeResource(resource) => self.resource_step(resource),
            EngineMessage::NotifyResourceState { job, up } => {
                if let Some(entry) = self.jobs.get_mut(&job) {
                    entry.resource_status_changed(up, self.events.as_ref());
                    self.evaluate_job(job);
                }
            }
            EngineMessage::UpdateCommitted { job, attrs } => {
                let Some(entry) = self.jobs.get_mut(&job) else {
                    return;
                };
                entry.update_committed(&attrs);
                let resource_id = entry.resource();
                if let Some(resource) = self.resources.get_mut(&resource_id) {
                    resource.lease_update_committed(&self.jobs);
                }
                self.evaluate_job(job);
            }
            EngineMessage::RemoteStatusUpdate { remote_id, status } => {
                let Some(job) = self.registry.lookup_remote_id(&remote_id) else {
                    log::warn!("Status update for unknown remote job {remote_id}");
                    return;
                };
                if let Some(entry) = self.jobs.get_mut(&job) {
                    entry.note_remote_status(status);
                    self.evaluate_job(job);
                }
            }
            EngineMessage::Reconfig(config) => self.reconfig(config),
            EngineMessage::GetJobSnapshot(job, token) => {
                token.respond(self.jobs.get(&job).map(|entry| JobSnapshot {
                    status: entry.status(),
                    remote_state: entry.remote_state().to_string(),
                    remote_id: entry.remote_id().map(str::to_string),
                    hold_reason: entry.hold_reason().map(str::to_string),
                }));
            }
            EngineMessage::Quit => unreachable!("Quit is handled by the loop"),
        }
    }

    /// Builds the Job object for a freshly delivered descriptor: resolve
    /// its resource (created lazily per endpoint identity), acquire its
    /// credential, index it, and let the evaluate timer fire immediately.
    fn add_job(&mut self, descriptor: JobDescriptor) {
        let Some(id) = descriptor.job_id() else {
            log::error!("Received a job descriptor without identity attributes");
            return;
        };
        if self.jobs.contains_key(&id) {
            log::warn!("Job {id} is already managed, ignoring duplicate arrival");
            return;
        }

        let endpoint = descriptor
            .get_string(ATTR_REMOTE_ENDPOINT)
            .unwrap_or_default()
            .to_string();

        let mut failure = None;
        let mut identity = String::new();
        let mut credential = None;
        if let Some(path) = descriptor.get_string(ATTR_CREDENTIAL_FILE) {
            let path = PathBuf::from(path);
            match self
                .credentials
                .acquire(&path, self.senders.evaluate_watcher(id))
            {
                Ok((credential_id, token)) => {
                    identity = self.credentials.get(credential_id).subject().to_string();
                    credential = Some((credential_id, token));
                }
                Err(e) => failure = Some(e.to_string()),
            }
        }
        if endpoint.is_empty() && failure.is_none() {
            failure = Some("Job has no remote endpoint".to_string());
        }

        let name = ResourceName::new(endpoint, identity);
        let resource_id = self.get_or_create_resource(&name);
        let evaluate_timer = self.timers.register(
            Duration::ZERO,
            Some(self.config.poll_interval()),
            TimerTarget::EvaluateJob(id),
        );

        let mut job = Job::new(descriptor, resource_id, credential, evaluate_timer);
        if let Some(reason) = failure {
            log::warn!("Job {id} cannot be managed: {reason}");
            job.pre_hold(reason);
        }

        self.registry.insert_job(id);
        if let Some(remote_id) = job.remote_id() {
            self.registry.bind_remote_id(remote_id.to_string(), id);
        }
        self.resources
            .get_mut(&resource_id)
            .unwrap()
            .register_job(id, &self.senders);
        log::info!("Job {id} arrived, bound to resource {}", name);
        self.jobs.insert(id, job);
    }

    fn get_or_create_resource(&mut self, name: &ResourceName) -> ResourceId {
        if let Some(&id) = self.resource_ids.get(name) {
            return id;
        }
        let id = ResourceId::new(self.resource_id_counter.increment() as u32);
        let helper = (self.helper_factory)(name);
        let channel = HelperChannel::new(
            helper,
            id,
            self.notify_tx.clone(),
            MAX_INFLIGHT_COMMANDS_PER_RESOURCE,
        );
        let mut resource = Resource::new(
            id,
            name.clone(),
            channel,
            self.config.limits_for(name.endpoint()),
        );
        if !name.identity().is_empty() {
            let watcher = self.senders.wake_resource_watcher(id);
            resource.set_master_credential(self.credentials.acquire_master(name.identity(), watcher));
        }

        let timer = self.timers.register(
            Duration::ZERO,
            Some(self.resource_tick_period()),
            TimerTarget::ResourceTick(id),
        );
        self.resource_timers.insert(id, timer);
        self.resource_ids.insert(name.clone(), id);
        self.resources.insert(id, resource);
        id
    }

    fn resource_tick_period(&self) -> Duration {
        self.config
            .probe_delay()
            .min(self.config.lease_check_interval())
    }

    fn evaluate_job(&mut self, id: JobId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        let resource_id = job.resource();
        let resource = self
            .resources
            .get_mut(&resource_id)
            .expect("job bound to an unknown resource");
        let mut ctx = EvalCtx {
            resource,
            credentials: &mut self.credentials,
            registry: &mut self.registry,
            timers: &mut self.timers,
            config: &self.config,
            senders: &self.senders,
            updates: self.updates.as_ref(),
            events: self.events.as_ref(),
        };
        if let Some(disposition) = job.evaluate_state(&mut ctx) {
            self.unregister_job(id, disposition);
        }
    }

    fn resource_step(&mut self, id: ResourceId) {
        let Some(resource) = self.resources.get_mut(&id) else {
            return;
        };
        let now = Instant::now();
        resource.probe(now, &self.config, &self.senders);
        resource.update_leases(&mut self.jobs, &self.config, self.updates.as_ref(), now);
    }

    /// The one place that releases everything a job holds: admission
    /// slots, resource registration, credential reference, timers and
    /// registry entries. Runs exactly once per job lifetime.
    fn unregister_job(&mut self, id: JobId, disposition: Disposition) {
        let mut job = self
            .jobs
            .remove(&id)
            .expect("unregistering an unknown job");
        log::info!("Job {id} is leaving the engine ({disposition:?})");

        let resource_id = job.resource();
        if let Some(resource) = self.resources.get_mut(&resource_id) {
            resource.unregister_job(id, &self.senders);
            if !resource.has_registered_jobs() {
                self.destroy_resource(resource_id);
            }
        }
        if let Some((credential, token)) = job.take_credential() {
            self.credentials.release(credential, token);
        }
        self.timers.cancel(job.evaluate_timer());
        self.registry.remove_job(id);
        if disposition == Disposition::DeleteRecord {
            self.updates.request_delete(id);
        }
    }

    fn destroy_resource(&mut self, id: ResourceId) {
        let Some(mut resource) = self.resources.remove(&id) else {
            return;
        };
        log::debug!("Destroying resource {}", resource.name());
        if let Some(timer) = self.resource_timers.remove(&id) {
            self.timers.cancel(timer);
        }
        if let Some((credential, token)) = resource.take_master_credential() {
            self.credentials.release(credential, token);
        }
        self.resource_ids.remove(resource.name());
    }

    fn reconfig(&mut self, config: EngineConfig) {
        log::info!("Applying new engine configuration");
        self.config = config;
        self.credentials.reconfig(
            self.config.min_credential_lifetime(),
            self.config.credential_check_interval(),
        );
        // Re-run the credential reconciliation right away.
        self.timers.set_period(
            self.credential_timer,
            Some(self.config.credential_check_interval()),
        );
        self.timers.reset(self.credential_timer, Duration::ZERO);

        let tick = self.resource_tick_period();
        for resource in self.resources.values_mut() {
            let limits = self.config.limits_for(resource.name().endpoint());
            resource.reconfig(limits, &self.senders);
            if let Some(timer) = self.resource_timers.get(&resource.id()) {
                self.timers.set_period(*timer, Some(tick));
            }
        }
        for job in self.jobs.values() {
            self.timers
                .set_period(job.evaluate_timer(), Some(self.config.poll_interval()));
        }
    }
}
