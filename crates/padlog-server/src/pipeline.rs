//! Message acceptance pipeline.
//!
//! Every message for a channel moves through the same stages:
//!
//! ```text
//! Classify -> LoadMetadata -> Validate -> Deduplicate -> Persist -> Acknowledge
//! ```
//!
//! Classification happens synchronously in [`Pipeline::admit`], which also
//! takes the message's place in the channel's validation queue. From there
//! the two per-channel FIFO queues (validation, then write) guarantee that
//! messages are acknowledged in the order they were admitted.
//!
//! Duplicate checkpoints are detected under the write turn, against the
//! index of what is actually on disk, so a checkpoint is only ever reported
//! as a duplicate of one that was durably written.

use std::fmt;
use std::sync::Arc;

use padlog_shared::{ChannelId, ChannelKind, ChannelMetadata, LogMessage, ShardId, ShardRouter, UserKey};
use padlog_store::{
    AppendAck, ChannelStore, StoreError, ValidationTicket, ValidationTurn, WriteTicket, WriteTurn,
};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::hub::ChannelHub;
use crate::validator::{MessageValidator, ValidationError};

/// Named pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classify,
    Deduplicate,
    LoadMetadata,
    Validate,
    Persist,
    Acknowledge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Classify => "classify",
            Stage::Deduplicate => "deduplicate",
            Stage::LoadMetadata => "load-metadata",
            Stage::Validate => "validate",
            Stage::Persist => "persist",
            Stage::Acknowledge => "acknowledge",
        };
        f.write_str(name)
    }
}

/// Reasons a message is not accepted.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Channel is owned by shard {owner}")]
    WrongShard { owner: ShardId },

    #[error("EINVAL: {0}")]
    InvalidMessage(String),

    #[error("Admin channels only accept system messages")]
    AdminOnly,

    #[error("EEXPIRED")]
    Expired,

    #[error("EACCES")]
    AccessDenied,

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{source}")]
    Store {
        stage: Stage,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    /// Stage that produced the error.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::WrongShard { .. }
            | PipelineError::InvalidMessage(_)
            | PipelineError::AdminOnly => Stage::Classify,
            PipelineError::Expired | PipelineError::AccessDenied => Stage::LoadMetadata,
            PipelineError::Validation(_) => Stage::Validate,
            PipelineError::Store { stage, .. } => *stage,
        }
    }
}

/// A message offered to the pipeline.
#[derive(Debug, Clone)]
pub struct Submission {
    pub channel: ChannelId,
    pub message: LogMessage,
    /// Public key of the author, checked against restricted channels.
    pub author_key: Option<UserKey>,
    /// Signature already checked upstream; skips verification but still
    /// keeps its place in the validation queue.
    pub pre_validated: bool,
}

impl Submission {
    pub fn new(channel: ChannelId, message: LogMessage) -> Self {
        Self {
            channel,
            message,
            author_key: None,
            pre_validated: false,
        }
    }
}

/// Successful outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Durably written and broadcast.
    Stored(AppendAck),
    /// Checkpoint already saved; nothing written or broadcast.
    Duplicate,
    /// Ephemeral channel: broadcast only.
    Presence(LogMessage),
}

#[derive(Clone)]
pub struct Pipeline {
    store: ChannelStore,
    validator: Arc<dyn MessageValidator>,
    hub: ChannelHub,
    router: ShardRouter,
    local: ShardId,
}

impl Pipeline {
    pub fn new(
        store: ChannelStore,
        validator: Arc<dyn MessageValidator>,
        hub: ChannelHub,
        router: ShardRouter,
        local: ShardId,
    ) -> Self {
        Self {
            store,
            validator,
            hub,
            router,
            local,
        }
    }

    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    pub fn local_shard(&self) -> &ShardId {
        &self.local
    }

    /// Reject channels routed to another node.
    pub fn check_owner(&self, channel: &ChannelId) -> Result<(), PipelineError> {
        let owner = self.router.route_channel(channel);
        if owner == self.local {
            Ok(())
        } else {
            Err(PipelineError::WrongShard { owner })
        }
    }

    /// Classify a submission and take its place in the channel's queue.
    pub fn admit(&self, submission: Submission) -> Result<Admitted, PipelineError> {
        let channel = &submission.channel;
        self.check_owner(channel)?;

        if submission.message.channel != channel.as_str() {
            return Err(PipelineError::InvalidMessage(
                "message channel does not match target".into(),
            ));
        }

        let ticket = match channel.kind() {
            ChannelKind::Ephemeral => None,
            ChannelKind::Admin if submission.message.sender.is_some() => {
                return Err(PipelineError::AdminOnly);
            }
            _ => Some(self.store.enqueue_validation(channel)),
        };

        Ok(Admitted {
            pipeline: self.clone(),
            submission,
            ticket,
        })
    }

    /// Run a submission through every stage.
    pub async fn submit(&self, submission: Submission) -> Result<Accepted, PipelineError> {
        let channel = submission.channel.clone();
        let result = match self.admit(submission) {
            Ok(admitted) => admitted.complete().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            info!(channel = %channel, stage = %e.stage(), reason = %e, "Message rejected");
        }
        result
    }
}

/// A classified submission holding its place in the validation queue.
pub struct Admitted {
    pipeline: Pipeline,
    submission: Submission,
    ticket: Option<ValidationTicket>,
}

/// In-flight pipeline state. Each variant carries what the next stage needs.
enum Step {
    LoadMetadata(ValidationTurn),
    Validate(ValidationTurn, Option<Arc<ChannelMetadata>>),
    Deduplicate(WriteTicket),
    Persist(WriteTurn),
    Acknowledge(WriteTurn, AppendAck),
    Done(Accepted),
}

impl Step {
    fn stage(&self) -> Stage {
        match self {
            Step::LoadMetadata(_) => Stage::LoadMetadata,
            Step::Validate(..) => Stage::Validate,
            Step::Deduplicate(_) => Stage::Deduplicate,
            Step::Persist(_) => Stage::Persist,
            Step::Acknowledge(..) | Step::Done(_) => Stage::Acknowledge,
        }
    }
}

impl Admitted {
    /// Drive the remaining stages to completion.
    pub async fn complete(self) -> Result<Accepted, PipelineError> {
        let Admitted {
            pipeline,
            submission,
            ticket,
        } = self;
        let Submission {
            channel,
            message,
            author_key,
            pre_validated,
        } = submission;

        let Some(ticket) = ticket else {
            pipeline.hub.publish(&channel, &message).await;
            return Ok(Accepted::Presence(message));
        };

        let checkpoint_id = channel
            .kind()
            .supports_checkpoints()
            .then(|| message.checkpoint().and_then(|cp| cp.id.map(str::to_string)))
            .flatten();

        let store = &pipeline.store;
        let mut message = Some(message);
        let mut step = Step::LoadMetadata(ticket.wait().await);

        loop {
            let stage = step.stage();
            trace!(channel = %channel, %stage, "Entering stage");
            let at = |source| PipelineError::Store { stage, source };

            step = match step {
                Step::LoadMetadata(turn) => {
                    let metadata = store.metadata(&channel).await.map_err(at)?;
                    if let Some(meta) = &metadata {
                        check_metadata(meta, author_key.as_ref())?;
                    }
                    Step::Validate(turn, metadata)
                }

                Step::Validate(turn, metadata) => {
                    let validate_key = metadata.as_ref().and_then(|m| m.validate_key.as_deref());
                    if let (Some(key), false, Some(msg)) = (validate_key, pre_validated, &message) {
                        pipeline.validator.validate(msg, key).await?;
                    }

                    // Take the write slot before giving up the validation turn.
                    let ticket = store.enqueue_write(&channel);
                    drop(turn);
                    Step::Deduplicate(ticket)
                }

                Step::Deduplicate(ticket) => {
                    let turn = ticket.wait().await;
                    if let Some(id) = &checkpoint_id {
                        let last = store.last_checkpoint_in(&turn).await.map_err(at)?;
                        if last.as_deref() == Some(id.as_str()) {
                            debug!(channel = %channel, checkpoint = %id, "Duplicate checkpoint ignored");
                            return Ok(Accepted::Duplicate);
                        }
                    }
                    Step::Persist(turn)
                }

                Step::Persist(turn) => {
                    let Some(msg) = message.take() else {
                        return Err(PipelineError::InvalidMessage("message consumed".into()));
                    };
                    let ack = store.append_in(&turn, msg).await.map_err(at)?;
                    Step::Acknowledge(turn, ack)
                }

                Step::Acknowledge(turn, ack) => {
                    pipeline.hub.publish(&channel, &ack.message).await;
                    drop(turn);
                    Step::Done(Accepted::Stored(ack))
                }

                Step::Done(accepted) => return Ok(accepted),
            };
        }
    }
}

fn check_metadata(meta: &ChannelMetadata, author: Option<&UserKey>) -> Result<(), PipelineError> {
    if meta.is_expired(chrono::Utc::now().timestamp_millis()) {
        return Err(PipelineError::Expired);
    }
    if meta.restricted {
        let allowed = author.is_some_and(|key| meta.allows(&key.canonical()));
        if !allowed {
            return Err(PipelineError::AccessDenied);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use padlog_store::StoreConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    const STANDARD: &str = "5e1f0123456789abcdef0123456789ab";
    const ADMIN: &str = "ad0123456789abcdef0123456789abcde";
    const EPHEMERAL: &str = "e50123456789abcdef0123456789abcdef";

    /// Sleeps longer for earlier messages, rejects payloads containing "bad".
    struct SlowValidator;

    #[async_trait]
    impl MessageValidator for SlowValidator {
        async fn validate(&self, message: &LogMessage, _key: &str) -> Result<(), ValidationError> {
            if message.payload.contains("bad") {
                return Err(ValidationError::Signature(
                    padlog_shared::SignatureError::BadSignature,
                ));
            }
            let n: u64 = message.payload.trim_start_matches("m").parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(n * 2))).await;
            Ok(())
        }
    }

    async fn pipeline(dir: &TempDir) -> Pipeline {
        let store = ChannelStore::open(StoreConfig::new(dir.path())).await.unwrap();
        let router = ShardRouter::new("core", 1);
        let local = router.shard(0);
        Pipeline::new(store, Arc::new(SlowValidator), ChannelHub::new(), router, local)
    }

    fn id(raw: &str) -> ChannelId {
        ChannelId::parse(raw).unwrap()
    }

    fn submission(channel: &str, payload: &str) -> Submission {
        Submission::new(
            id(channel),
            LogMessage::new(Some("alice".into()), channel, payload),
        )
    }

    async fn with_metadata(p: &Pipeline, meta: ChannelMetadata) {
        let channel = id(&meta.channel);
        assert!(p.store().create_with_metadata(&channel, &meta).await.unwrap());
    }

    async fn payloads(p: &Pipeline, channel: &str) -> Vec<String> {
        p.store()
            .get_full_history(&id(channel))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message.payload)
            .collect()
    }

    #[tokio::test]
    async fn test_acceptance_order_matches_admission_order() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let mut meta = ChannelMetadata::new(STANDARD);
        meta.validate_key = Some("key".into());
        with_metadata(&p, meta).await;
        let mut rx = p.hub().subscribe(&id(STANDARD)).await;

        let admitted: Vec<_> = (0..8)
            .map(|i| p.admit(submission(STANDARD, &format!("m{i}"))).unwrap())
            .collect();
        let results = futures::future::join_all(admitted.into_iter().map(|a| a.complete())).await;
        assert!(results.iter().all(|r| matches!(r, Ok(Accepted::Stored(_)))));

        let expected: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
        assert_eq!(payloads(&p, STANDARD).await, expected);
        for want in &expected {
            let got = rx.recv().await.unwrap();
            assert_eq!(&got.payload, want);
            assert!(got.time.is_some());
        }
    }

    #[tokio::test]
    async fn test_duplicate_checkpoint_is_acknowledged_once() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;

        let first = p.submit(submission(STANDARD, "cp|v1|state")).await.unwrap();
        assert!(matches!(first, Accepted::Stored(_)));
        let again = p.submit(submission(STANDARD, "cp|v1|state")).await.unwrap();
        assert_eq!(again, Accepted::Duplicate);
        let next = p.submit(submission(STANDARD, "cp|v2|state")).await.unwrap();
        assert!(matches!(next, Accepted::Stored(_)));

        assert_eq!(payloads(&p, STANDARD).await, vec!["cp|v1|state", "cp|v2|state"]);
    }

    #[tokio::test]
    async fn test_duplicate_decided_after_earlier_write_lands() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let chan = id(STANDARD);
        p.store().get_index(&chan).await.unwrap();

        let held = p.store().enqueue_write(&chan).wait().await;
        let first = tokio::spawn({
            let p = p.clone();
            async move { p.submit(submission(STANDARD, "cp|v1|state")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::spawn({
            let p = p.clone();
            async move { p.submit(submission(STANDARD, "cp|v1|state")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Neither is answered while the first write is still pending.
        assert!(!first.is_finished());
        assert!(!second.is_finished());
        drop(held);

        assert!(matches!(first.await.unwrap(), Ok(Accepted::Stored(_))));
        assert_eq!(second.await.unwrap().unwrap(), Accepted::Duplicate);
        assert_eq!(payloads(&p, STANDARD).await, vec!["cp|v1|state"]);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_a_duplicate_source() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let chan = id(STANDARD);
        p.submit(submission(STANDARD, "m0")).await.unwrap();
        p.store().get_index(&chan).await.unwrap();

        let held = p.store().enqueue_write(&chan).wait().await;
        let first = tokio::spawn({
            let p = p.clone();
            async move { p.submit(submission(STANDARD, "cp|v1|state")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::spawn({
            let p = p.clone();
            async move { p.submit(submission(STANDARD, "cp|v1|state")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The log becomes unwritable before the first checkpoint lands.
        let path = p.store().paths().log(&chan);
        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::create_dir(&path).await.unwrap();
        drop(held);

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Store { .. }));
        assert_eq!(err.stage(), Stage::Persist);
        let second = second.await.unwrap();
        assert!(
            !matches!(second, Ok(Accepted::Duplicate)),
            "unexpected result: {second:?}"
        );
    }

    #[tokio::test]
    async fn test_duplicate_detected_after_eviction() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        p.submit(submission(STANDARD, "cp|v1|state")).await.unwrap();

        p.store().evict_idle(Duration::ZERO);
        let again = p.submit(submission(STANDARD, "cp|v1|state")).await.unwrap();
        assert_eq!(again, Accepted::Duplicate);
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_dedup_state() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let mut meta = ChannelMetadata::new(STANDARD);
        meta.validate_key = Some("key".into());
        with_metadata(&p, meta).await;

        let err = p.submit(submission(STANDARD, "cp|v1|bad")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(err.stage(), Stage::Validate);
        assert_eq!(p.store().last_checkpoint(&id(STANDARD)).await.unwrap(), None);

        let ok = p.submit(submission(STANDARD, "cp|v1|good")).await.unwrap();
        assert!(matches!(ok, Accepted::Stored(_)));
        assert_eq!(payloads(&p, STANDARD).await, vec!["cp|v1|good"]);
    }

    #[tokio::test]
    async fn test_pre_validated_skips_verification() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let mut meta = ChannelMetadata::new(STANDARD);
        meta.validate_key = Some("key".into());
        with_metadata(&p, meta).await;

        let mut sub = submission(STANDARD, "bad-but-trusted");
        sub.pre_validated = true;
        assert!(matches!(p.submit(sub).await.unwrap(), Accepted::Stored(_)));
    }

    #[tokio::test]
    async fn test_admin_channel_accepts_only_system_messages() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;

        let err = p.submit(submission(ADMIN, "hello")).await.unwrap_err();
        assert!(matches!(err, PipelineError::AdminOnly));
        assert_eq!(err.stage(), Stage::Classify);

        let system = Submission::new(id(ADMIN), LogMessage::new(None, ADMIN, "notice"));
        assert!(matches!(p.submit(system).await.unwrap(), Accepted::Stored(_)));
    }

    #[tokio::test]
    async fn test_ephemeral_is_broadcast_only() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let mut rx = p.hub().subscribe(&id(EPHEMERAL)).await;

        let accepted = p.submit(submission(EPHEMERAL, "typing")).await.unwrap();
        assert!(matches!(accepted, Accepted::Presence(_)));
        assert_eq!(rx.recv().await.unwrap().payload, "typing");
        assert!(!p.store().paths().log(&id(EPHEMERAL)).exists());
    }

    #[tokio::test]
    async fn test_expired_channel_rejected() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let mut meta = ChannelMetadata::new(STANDARD);
        meta.expire = Some(1);
        with_metadata(&p, meta).await;

        let err = p.submit(submission(STANDARD, "late")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Expired));
        assert_eq!(err.to_string(), "EEXPIRED");
        assert!(payloads(&p, STANDARD).await.is_empty());
    }

    #[tokio::test]
    async fn test_restricted_channel_checks_author() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let mut meta = ChannelMetadata::new(STANDARD);
        meta.restricted = true;
        meta.allowed = vec!["abc/def+ghi".into()];
        with_metadata(&p, meta).await;

        let err = p.submit(submission(STANDARD, "anon")).await.unwrap_err();
        assert!(matches!(err, PipelineError::AccessDenied));

        let mut sub = submission(STANDARD, "member");
        sub.author_key = Some(UserKey("[abc-def_ghi]".into()));
        assert!(matches!(p.submit(sub).await.unwrap(), Accepted::Stored(_)));
    }

    #[tokio::test]
    async fn test_foreign_channel_names_owner() {
        let dir = TempDir::new().unwrap();
        let store = ChannelStore::open(StoreConfig::new(dir.path())).await.unwrap();
        let router = ShardRouter::new("core", 4);
        let owner = router.route_channel(&id(STANDARD));
        let local = router.shard((owner.index + 1) % 4);
        let p = Pipeline::new(store, Arc::new(SlowValidator), ChannelHub::new(), router, local);

        match p.submit(submission(STANDARD, "x")).await {
            Err(PipelineError::WrongShard { owner: got }) => assert_eq!(got, owner),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mismatched_channel_rejected() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir).await;
        let sub = Submission::new(
            id(STANDARD),
            LogMessage::new(Some("alice".into()), "another", "x"),
        );
        assert!(matches!(
            p.submit(sub).await,
            Err(PipelineError::InvalidMessage(_))
        ));
    }
}
