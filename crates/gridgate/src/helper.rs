//! The remote helper channel: an abstraction over whatever process or
//! service performs the actual remote-protocol calls.
//!
//! Every call through [`HelperChannel`] is non-blocking. The first call
//! starts the operation and returns [`CommandStatus::Pending`]; the caller
//! re-issues the same call on its next evaluation and receives the stored
//! result once the operation has finished. Completion wakes the owning
//! entity through the engine's notification queue, so nobody polls blindly.

use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Output;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::common::ids::{JobId, ResourceId};
use crate::descriptor::JobDescriptor;
use crate::Map;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Exit code remote tools use to signal "endpoint temporarily unreachable"
/// (EX_TEMPFAIL from sysexits).
const TEMPFAIL_EXIT_CODE: i32 = 75;

/// The two universal failure categories of a remote call. How a concrete
/// failure maps onto them is adapter business.
#[derive(Debug, Clone, Error)]
pub enum HelperError {
    /// The endpoint could not be reached; worth retrying and worth a probe.
    #[error("failed to contact endpoint: {0}")]
    Connection(String),
    /// The endpoint answered and said no.
    #[error("{0}")]
    Remote(String),
}

pub type HelperResult<T> = Result<T, HelperError>;

/// Status of a job as reported by the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Running,
    Completed,
    Failed,
    /// The endpoint has no record of the job.
    Unknown,
}

impl Display for RemoteStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemoteStatus::Queued => "queued",
            RemoteStatus::Running => "running",
            RemoteStatus::Completed => "completed",
            RemoteStatus::Failed => "failed",
            RemoteStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One entry of a lease-renewal batch.
#[derive(Debug, Clone)]
pub struct LeaseRenewal {
    pub remote_id: String,
    pub expiration: SystemTime,
}

/// Adapter seam: performs the protocol-specific remote operations.
/// Returned futures must be self-contained (no borrow of the helper).
pub trait RemoteHelper {
    /// Submit the job; resolves to the id the endpoint assigned to it.
    fn submit_job(&self, job: JobId, descriptor: JobDescriptor) -> BoxFuture<HelperResult<String>>;

    fn query_status(&self, remote_id: String) -> BoxFuture<HelperResult<RemoteStatus>>;

    fn cancel_job(&self, remote_id: String) -> BoxFuture<HelperResult<()>>;

    /// Cheap liveness probe of the endpoint.
    fn ping(&self) -> BoxFuture<HelperResult<()>>;

    /// Renew a batch of leases; resolves to per-job acceptance flags.
    fn renew_leases(
        &self,
        leases: Vec<LeaseRenewal>,
    ) -> BoxFuture<HelperResult<Vec<(String, bool)>>>;
}

/// Entity to wake when a pending command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyTarget {
    Job(JobId),
    Resource(ResourceId),
}

pub type NotifySender = mpsc::UnboundedSender<NotifyTarget>;
pub type NotifyReceiver = mpsc::UnboundedReceiver<NotifyTarget>;

pub fn make_notify_queue() -> (NotifySender, NotifyReceiver) {
    mpsc::unbounded_channel()
}

/// Result of one non-blocking call through the channel.
#[derive(Debug)]
pub enum CommandStatus<T> {
    /// The channel is saturated; nothing was started. Retry later.
    NotSubmitted,
    /// The command is in flight; the caller will be woken on completion.
    Pending,
    Completed(HelperResult<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CommandKind {
    Submit,
    Status,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CommandKey {
    Job(JobId, CommandKind),
    Ping,
    RenewLeases,
}

enum CommandValue {
    RemoteId(String),
    Status(RemoteStatus),
    Unit,
    LeaseAcks(Vec<(String, bool)>),
}

type CommandSlot = Rc<RefCell<Option<HelperResult<CommandValue>>>>;

/// Per-resource channel tracking in-flight commands.
pub struct HelperChannel {
    helper: Rc<dyn RemoteHelper>,
    resource: ResourceId,
    notify: NotifySender,
    inflight: Map<CommandKey, CommandSlot>,
    max_inflight: usize,
}

impl HelperChannel {
    pub fn new(
        helper: Rc<dyn RemoteHelper>,
        resource: ResourceId,
        notify: NotifySender,
        max_inflight: usize,
    ) -> Self {
        Self {
            helper,
            resource,
            notify,
            inflight: Map::default(),
            max_inflight,
        }
    }

    pub fn submit_job(
        &mut self,
        job: JobId,
        descriptor: JobDescriptor,
    ) -> CommandStatus<String> {
        let status = self.poll_command(CommandKey::Job(job, CommandKind::Submit), |helper| {
            let fut = helper.submit_job(job, descriptor);
            Box::pin(async move { fut.await.map(CommandValue::RemoteId) })
        });
        map_status(status, |value| match value {
            CommandValue::RemoteId(id) => id,
            _ => unreachable!("submit command produced a non-submit result"),
        })
    }

    pub fn query_status(&mut self, job: JobId, remote_id: String) -> CommandStatus<RemoteStatus> {
        let status = self.poll_command(CommandKey::Job(job, CommandKind::Status), |helper| {
            let fut = helper.query_status(remote_id);
            Box::pin(async move { fut.await.map(CommandValue::Status) })
        });
        map_status(status, |value| match value {
            CommandValue::Status(status) => status,
            _ => unreachable!("status command produced a non-status result"),
        })
    }

    pub fn cancel_job(&mut self, job: JobId, remote_id: String) -> CommandStatus<()> {
        let status = self.poll_command(CommandKey::Job(job, CommandKind::Cancel), |helper| {
            let fut = helper.cancel_job(remote_id);
            Box::pin(async move { fut.await.map(|_| CommandValue::Unit) })
        });
        map_status(status, |value| match value {
            CommandValue::Unit => (),
            _ => unreachable!("cancel command produced an unexpected result"),
        })
    }

    pub fn ping(&mut self) -> CommandStatus<()> {
        let status = self.poll_command(CommandKey::Ping, |helper| {
            let fut = helper.ping();
            Box::pin(async move { fut.await.map(|_| CommandValue::Unit) })
        });
        map_status(status, |value| match value {
            CommandValue::Unit => (),
            _ => unreachable!("ping command produced an unexpected result"),
        })
    }

    pub fn renew_leases(
        &mut self,
        leases: Vec<LeaseRenewal>,
    ) -> CommandStatus<Vec<(String, bool)>> {
        let status = self.poll_command(CommandKey::RenewLeases, |helper| {
            let fut = helper.renew_leases(leases);
            Box::pin(async move { fut.await.map(CommandValue::LeaseAcks) })
        });
        map_status(status, |value| match value {
            CommandValue::LeaseAcks(acks) => acks,
            _ => unreachable!("lease command produced an unexpected result"),
        })
    }

    /// Discards any commands belonging to the job, in flight or completed
    /// but unconsumed. Late completions of discarded commands are ignored.
    pub fn discard_job_commands(&mut self, job: JobId) {
        for kind in [CommandKind::Submit, CommandKind::Status, CommandKind::Cancel] {
            self.inflight.remove(&CommandKey::Job(job, kind));
        }
    }

    pub fn has_job_commands(&self, job: JobId) -> bool {
        [CommandKind::Submit, CommandKind::Status, CommandKind::Cancel]
            .iter()
            .any(|kind| self.inflight.contains_key(&CommandKey::Job(job, *kind)))
    }

    fn poll_command(
        &mut self,
        key: CommandKey,
        start: impl FnOnce(&dyn RemoteHelper) -> BoxFuture<HelperResult<CommandValue>>,
    ) -> CommandStatus<CommandValue> {
        if let Some(slot) = self.inflight.get(&key) {
            let finished = slot.borrow_mut().take();
            return match finished {
                Some(result) => {
                    self.inflight.remove(&key);
                    CommandStatus::Completed(result)
                }
                None => CommandStatus::Pending,
            };
        }

        if self.inflight.len() >= self.max_inflight {
            return CommandStatus::NotSubmitted;
        }

        let fut = start(&*self.helper);
        let slot: CommandSlot = Rc::new(RefCell::new(None));
        self.inflight.insert(key, slot.clone());

        let notify = self.notify.clone();
        let target = match key {
            CommandKey::Job(job, _) => NotifyTarget::Job(job),
            CommandKey::Ping | CommandKey::RenewLeases => NotifyTarget::Resource(self.resource),
        };
        tokio::task::spawn_local(async move {
            let result = fut.await;
            *slot.borrow_mut() = Some(result);
            let _ = notify.send(target);
        });
        CommandStatus::Pending
    }
}

fn map_status<T>(
    status: CommandStatus<CommandValue>,
    convert: impl FnOnce(CommandValue) -> T,
) -> CommandStatus<T> {
    match status {
        CommandStatus::NotSubmitted => CommandStatus::NotSubmitted,
        CommandStatus::Pending => CommandStatus::Pending,
        CommandStatus::Completed(result) => CommandStatus::Completed(result.map(convert)),
    }
}

/// The "batch queue via helper" adapter: drives a set of command-line tools,
/// one per operation. The submit tool receives the job descriptor as a JSON
/// file and prints the remote job id; the status tool prints one of
/// queued/running/completed/failed/unknown. Tools signal a connectivity
/// problem with exit code 75 (EX_TEMPFAIL); any other non-zero exit is
/// treated as a remote rejection.
pub struct CommandLineHelper {
    submit_argv: Vec<String>,
    status_argv: Vec<String>,
    cancel_argv: Vec<String>,
    ping_argv: Vec<String>,
    renew_argv: Vec<String>,
    workdir: PathBuf,
}

impl CommandLineHelper {
    pub fn new(
        submit_argv: Vec<String>,
        status_argv: Vec<String>,
        cancel_argv: Vec<String>,
        ping_argv: Vec<String>,
        renew_argv: Vec<String>,
        workdir: PathBuf,
    ) -> Self {
        Self {
            submit_argv,
            status_argv,
            cancel_argv,
            ping_argv,
            renew_argv,
            workdir,
        }
    }
}

impl RemoteHelper for CommandLineHelper {
    fn submit_job(&self, job: JobId, descriptor: JobDescriptor) -> BoxFuture<HelperResult<String>> {
        let argv = self.submit_argv.clone();
        let workdir = self.workdir.clone();
        Box::pin(async move {
            let payload = serde_json::to_vec_pretty(descriptor.attrs())
                .map_err(|e| HelperError::Remote(format!("cannot encode job {job}: {e}")))?;
            let description_file = workdir.join(format!("submit-{job}.json"));
            tokio::fs::write(&description_file, payload)
                .await
                .map_err(|e| HelperError::Connection(e.to_string()))?;

            let mut argv = argv;
            argv.push(description_file.to_string_lossy().into_owned());
            let output = run_tool(&argv, &workdir).await?;
            let remote_id = stdout_text(&output)?.trim().to_string();
            if remote_id.is_empty() {
                return Err(HelperError::Remote(
                    "submit tool printed no remote job id".to_string(),
                ));
            }
            Ok(remote_id)
        })
    }

    fn query_status(&self, remote_id: String) -> BoxFuture<HelperResult<RemoteStatus>> {
        let mut argv = self.status_argv.clone();
        let workdir = self.workdir.clone();
        argv.push(remote_id);
        Box::pin(async move {
            let output = run_tool(&argv, &workdir).await?;
            let text = stdout_text(&output)?;
            match text.split_whitespace().next() {
                Some("queued") => Ok(RemoteStatus::Queued),
                Some("running") => Ok(RemoteStatus::Running),
                Some("completed") => Ok(RemoteStatus::Completed),
                Some("failed") => Ok(RemoteStatus::Failed),
                Some("unknown") | None => Ok(RemoteStatus::Unknown),
                Some(other) => Err(HelperError::Remote(format!(
                    "status tool printed unrecognized status {other:?}"
                ))),
            }
        })
    }

    fn cancel_job(&self, remote_id: String) -> BoxFuture<HelperResult<()>> {
        let mut argv = self.cancel_argv.clone();
        let workdir = self.workdir.clone();
        argv.push(remote_id);
        Box::pin(async move {
            run_tool(&argv, &workdir).await?;
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<HelperResult<()>> {
        let argv = self.ping_argv.clone();
        let workdir = self.workdir.clone();
        Box::pin(async move {
            run_tool(&argv, &workdir).await?;
            Ok(())
        })
    }

    fn renew_leases(
        &self,
        leases: Vec<LeaseRenewal>,
    ) -> BoxFuture<HelperResult<Vec<(String, bool)>>> {
        let argv = self.renew_argv.clone();
        let workdir = self.workdir.clone();
        Box::pin(async move {
            let mut acks = Vec::with_capacity(leases.len());
            for lease in leases {
                let expiration = lease
                    .expiration
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let mut argv = argv.clone();
                argv.push(lease.remote_id.clone());
                argv.push(expiration.to_string());
                match run_tool(&argv, &workdir).await {
                    Ok(_) => acks.push((lease.remote_id, true)),
                    Err(HelperError::Remote(message)) => {
                        log::debug!(
                            "Lease renewal of {} rejected: {message}",
                            lease.remote_id
                        );
                        acks.push((lease.remote_id, false));
                    }
                    // Connectivity failure fails the whole batch.
                    Err(error) => return Err(error),
                }
            }
            Ok(acks)
        })
    }
}

async fn run_tool(argv: &[String], workdir: &std::path::Path) -> HelperResult<Output> {
    if argv.is_empty() {
        return Err(HelperError::Remote("helper tool not configured".to_string()));
    }
    log::debug!("Running helper tool `{}`", argv.join(" "));
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(workdir)
        .output()
        .await
        .map_err(|e| HelperError::Connection(format!("{} start failed: {e}", argv[0])))?;

    let status = output.status;
    if status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let code = status.code().unwrap_or(-1);
    if code == TEMPFAIL_EXIT_CODE {
        Err(HelperError::Connection(stderr))
    } else {
        Err(HelperError::Remote(format!(
            "{} exited with code {code}: {stderr}",
            argv[0]
        )))
    }
}

fn stdout_text(output: &Output) -> HelperResult<String> {
    String::from_utf8(output.stdout.clone())
        .map_err(|e| HelperError::Remote(format!("invalid UTF-8 tool output: {e:?}")))
}
