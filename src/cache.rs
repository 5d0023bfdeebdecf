use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::actors::SamplingParams;
use crate::error::CacheError;
use crate::messages::{Message, Sender, ToolCall, ToolOutcome};

/// Deterministic cache key over (actor identity, conversation prefix,
/// sampling config). Any change anywhere in the prefix changes the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(actor_id: &str, sampling: &SamplingParams, prefix: &[Message]) -> Self {
        // Usage metadata is excluded: token counts are diagnostics, not
        // conversation content, and must not perturb replay.
        #[derive(Serialize)]
        struct StableView<'a> {
            sender: Sender,
            turn: usize,
            content: &'a Option<String>,
            tool_calls: &'a [ToolCall],
            tool_result: &'a Option<ToolOutcome>,
        }

        let views: Vec<StableView<'_>> = prefix
            .iter()
            .map(|m| StableView {
                sender: m.sender,
                turn: m.turn,
                content: &m.content,
                tool_calls: &m.tool_calls,
                tool_result: &m.tool_result,
            })
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(actor_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(sampling).expect("sampling serializes"));
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&views).expect("messages serialize"));
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Keyed get/put collaborator shared by concurrent trials. Lookups must be
/// idempotent; entries are never mutated after creation.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<Message>>, CacheError>;

    async fn put(&self, fingerprint: &Fingerprint, messages: &[Message]) -> Result<(), CacheError>;
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResponseCache for InMemoryCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<Message>>, CacheError> {
        Ok(self.entries.read().await.get(fingerprint.as_str()).cloned())
    }

    async fn put(&self, fingerprint: &Fingerprint, messages: &[Message]) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(fingerprint.as_str().to_string(), messages.to_vec());
        Ok(())
    }
}

/// Pre-populates the cache from a recorded conversation so a trial can be
/// re-executed deterministically without invoking any provider. Messages are
/// grouped into the batches each actor produced: consecutive same-sender
/// actor messages form one batch, keyed by the prefix before the batch.
pub async fn seed_from_transcript(
    cache: &dyn ResponseCache,
    agent: (&str, &SamplingParams),
    user: (&str, &SamplingParams),
    messages: &[Message],
) -> Result<usize, CacheError> {
    let mut seeded = 0;
    let mut index = 0;

    while index < messages.len() {
        let sender = messages[index].sender;
        if sender == Sender::Environment {
            index += 1;
            continue;
        }

        let mut end = index + 1;
        while end < messages.len() && messages[end].sender == sender {
            end += 1;
        }

        let (actor_id, sampling) = match sender {
            Sender::Agent => agent,
            Sender::User => user,
            Sender::Environment => unreachable!(),
        };
        let fingerprint = Fingerprint::compute(actor_id, sampling, &messages[..index]);
        cache.put(&fingerprint, &messages[index..end]).await?;
        seeded += 1;
        index = end;
    }

    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, TokenUsage};
    use serde_json::json;

    fn sampling() -> SamplingParams {
        SamplingParams::new("test-model").with_seed(7)
    }

    fn prefix() -> Vec<Message> {
        let mut user = Message::text(Sender::User, "cancel my reservation");
        user.turn = 0;
        let mut agent = Message::text(Sender::Agent, "which reservation id?");
        agent.turn = 1;
        vec![user, agent]
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let a = Fingerprint::compute("agent", &sampling(), &prefix());
        let b = Fingerprint::compute("agent", &sampling(), &prefix());
        assert_eq!(a, b);
    }

    #[test]
    fn any_prefix_change_changes_the_fingerprint() {
        let base = Fingerprint::compute("agent", &sampling(), &prefix());

        let mut edited = prefix();
        edited[0].content = Some("cancel my Reservation".to_string());
        assert_ne!(base, Fingerprint::compute("agent", &sampling(), &edited));

        assert_ne!(base, Fingerprint::compute("user", &sampling(), &prefix()));

        let hotter = SamplingParams::new("test-model").with_temperature(0.9);
        assert_ne!(base, Fingerprint::compute("agent", &hotter, &prefix()));
    }

    #[test]
    fn usage_metadata_does_not_perturb_the_fingerprint() {
        let base = Fingerprint::compute("agent", &sampling(), &prefix());
        let mut with_usage = prefix();
        with_usage[1].usage = Some(TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
        });
        assert_eq!(base, Fingerprint::compute("agent", &sampling(), &with_usage));
    }

    #[tokio::test]
    async fn lookup_is_idempotent() {
        let cache = InMemoryCache::new();
        let fp = Fingerprint::compute("agent", &sampling(), &prefix());
        let stored = vec![Message::text(Sender::Agent, "done, ###STOP###")];

        cache.put(&fp, &stored).await.unwrap();
        let first = cache.get(&fp).await.unwrap();
        let second = cache.get(&fp).await.unwrap();
        assert_eq!(first, Some(stored.clone()));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn seeding_reconstructs_actor_batches() {
        let cache = InMemoryCache::new();
        let sampling = sampling();

        let mut transcript = Vec::new();
        let mut m0 = Message::text(Sender::User, "hi");
        m0.turn = 0;
        let mut m1 = Message::tool_calls(
            Sender::Agent,
            vec![ToolCall::new("c1", "get_reservation", json!({"reservation_id": "R1"}))],
        );
        m1.turn = 1;
        let mut m2 = Message::tool_result(ToolOutcome {
            call_id: "c1".to_string(),
            ok: true,
            payload: json!({"status": "confirmed"}),
        });
        m2.turn = 2;
        let mut m3 = Message::text(Sender::Agent, "found it");
        m3.turn = 3;
        transcript.extend([m0.clone(), m1.clone(), m2, m3.clone()]);

        let seeded = seed_from_transcript(
            &cache,
            ("agent", &sampling),
            ("user", &sampling),
            &transcript,
        )
        .await
        .unwrap();
        assert_eq!(seeded, 3);

        // The user's opener is keyed by the empty prefix.
        let fp = Fingerprint::compute("user", &sampling, &[]);
        assert_eq!(cache.get(&fp).await.unwrap(), Some(vec![m0]));

        // The agent's post-tool reply is keyed by everything before it.
        let fp = Fingerprint::compute("agent", &sampling, &transcript[..3]);
        assert_eq!(cache.get(&fp).await.unwrap(), Some(vec![m3]));
    }
}
