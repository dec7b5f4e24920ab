//! Request coalescing.
//!
//! Requests that share system instructions, history, response shape and sampling
//! can ride in one model call. The first request for a key opens a batch; the batch
//! is flushed when it is full or when the coalescing window closes, whichever comes
//! first. Requests carrying images are never coalesced.
//!
//! The merged call asks the model to answer every sub-request through one
//! `answer_batch` function; `split_reply` hands each caller back the reply it would
//! have received on its own. A sub-request the model skipped is dispatched solo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::context::RequestEnvelope;
use crate::conversation::Role;
use crate::interpreter::ResponseShape;
use crate::llm_client::{
    strip_json_fences, FunctionSchema, MessagePart, ModelMessage, ModelReply, ModelRequest,
};

use super::DispatchOutcome;

pub const BATCH_FUNCTION: &str = "answer_batch";

const BATCH_INSTRUCTION: &str = "\
Several independent requests follow, each introduced by a `### Request N` header. \
Answer each one separately, exactly as you would if it were the only request. \
Return every answer through the provided function, using the request number as `id`.";

/// Requests with equal keys can share one model call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    system: String,
    history: Vec<(Role, String)>,
    pub shape: ResponseShape,
    temperature_bits: u32,
    max_tokens: u32,
}

impl BatchKey {
    /// `None` when the envelope cannot be coalesced.
    pub fn for_envelope(envelope: &RequestEnvelope) -> Option<Self> {
        if envelope.has_images() {
            return None;
        }
        Some(Self {
            system: envelope.system_instructions.clone(),
            history: envelope
                .context_turns
                .iter()
                .map(|turn| (turn.role, turn.prompt_text()))
                .collect(),
            shape: envelope.expected_shape,
            temperature_bits: envelope.sampling.temperature.to_bits(),
            max_tokens: envelope.sampling.max_tokens,
        })
    }
}

/// One caller waiting on a batch.
pub struct Member {
    pub request: ModelRequest,
    pub reply_tx: oneshot::Sender<DispatchOutcome>,
    /// The caller's token. Retries on the member's behalf stop once it fires.
    pub cancel: CancellationToken,
}

/// A token that fires once every member has been cancelled, so a merged call keeps
/// retrying while at least one caller still waits for it.
pub fn batch_token(members: &[Member]) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let tokens: Vec<CancellationToken> = members.iter().map(|m| m.cancel.clone()).collect();
    let batch = CancellationToken::new();
    let fire = batch.clone();
    let watcher = tokio::spawn(async move {
        for token in &tokens {
            token.cancelled().await;
        }
        fire.cancel();
    });
    (batch, watcher)
}

pub enum Enqueued {
    /// Added to a batch someone else opened.
    Joined,
    /// Opened a new batch; the caller arranges the window flush.
    Opened { batch_id: u64 },
    /// This member filled the batch; the caller flushes it now.
    Full(Vec<Member>),
}

struct OpenBatch {
    id: u64,
    members: Vec<Member>,
}

/// Open batches by key. Process-wide, serialized behind one mutex.
pub struct Coalescer {
    max_batch_size: usize,
    open: Mutex<HashMap<BatchKey, OpenBatch>>,
    next_id: AtomicU64,
}

impl Coalescer {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            open: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn enqueue(&self, key: BatchKey, member: Member) -> Enqueued {
        let mut open = self.open.lock().await;

        if let Some(batch) = open.get_mut(&key) {
            batch.members.push(member);
            if batch.members.len() < self.max_batch_size {
                return Enqueued::Joined;
            }
            return match open.remove(&key) {
                Some(batch) => Enqueued::Full(batch.members),
                None => Enqueued::Joined,
            };
        }

        let batch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let members = vec![member];
        if self.max_batch_size == 1 {
            return Enqueued::Full(members);
        }
        open.insert(
            key,
            OpenBatch {
                id: batch_id,
                members,
            },
        );
        Enqueued::Opened { batch_id }
    }

    /// Removes the batch `batch_id` if it is still open. `None` when it was already
    /// flushed because it filled up.
    pub async fn take(&self, key: &BatchKey, batch_id: u64) -> Option<Vec<Member>> {
        let mut open = self.open.lock().await;
        match open.get(key) {
            Some(batch) if batch.id == batch_id => open.remove(key).map(|b| b.members),
            _ => None,
        }
    }

    #[cfg(test)]
    pub async fn open_batches(&self) -> usize {
        self.open.lock().await.len()
    }
}

fn batch_schema(shape: ResponseShape) -> FunctionSchema {
    let (field, answer_schema) = match shape.function_schema() {
        Some(schema) => ("result", schema.parameters),
        None => ("answer", json!({"type": "string"})),
    };

    let mut properties = Map::new();
    properties.insert("id".to_string(), json!({"type": "integer"}));
    properties.insert(field.to_string(), answer_schema);

    FunctionSchema {
        name: BATCH_FUNCTION.to_string(),
        description: "Answer several independent requests at once.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "responses": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": properties,
                        "required": ["id", field]
                    }
                }
            },
            "required": ["responses"]
        }),
    }
}

/// Merges requests sharing one `BatchKey` into a single model request.
///
/// History and system instructions are taken from the first request; each
/// request's final user message becomes one numbered section.
pub fn merge_requests(requests: &[&ModelRequest], shape: ResponseShape) -> ModelRequest {
    let first = requests[0];
    let history = first
        .messages
        .split_last()
        .map(|(_, history)| history.to_vec())
        .unwrap_or_default();

    let mut parts = Vec::new();
    for (index, request) in requests.iter().enumerate() {
        parts.push(MessagePart::Text(format!("### Request {}", index + 1)));
        if let Some(user) = request.messages.last() {
            parts.extend(user.parts.iter().cloned());
        }
    }

    let mut messages = history;
    messages.push(ModelMessage {
        role: Role::User,
        parts,
    });

    let mut sampling = first.sampling;
    sampling.max_tokens = sampling
        .max_tokens
        .saturating_mul(requests.len() as u32);

    ModelRequest {
        system: format!("{}\n\n{BATCH_INSTRUCTION}", first.system),
        messages,
        function: Some(batch_schema(shape)),
        sampling,
    }
}

#[derive(Debug, Deserialize)]
struct BatchPayload {
    responses: Vec<BatchEntry>,
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    id: usize,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

/// Splits a merged reply into one reply per member, in member order. A member the
/// model did not answer gets `None`.
pub fn split_reply(reply: &ModelReply, members: usize, shape: ResponseShape) -> Vec<Option<ModelReply>> {
    let mut replies: Vec<Option<ModelReply>> = vec![None; members];
    let Ok(payload) = serde_json::from_str::<BatchPayload>(strip_json_fences(reply.raw_text()))
    else {
        return replies;
    };

    for entry in payload.responses {
        let Some(slot) = entry.id.checked_sub(1).and_then(|i| replies.get_mut(i)) else {
            continue;
        };
        if slot.is_some() {
            continue;
        }
        *slot = match (shape.function_name(), entry.answer, entry.result) {
            (None, Some(text), _) if !text.trim().is_empty() => Some(ModelReply::Text { text }),
            (Some(name), _, Some(result)) => Some(ModelReply::FunctionCall {
                name: name.to_string(),
                arguments: result.to_string(),
            }),
            _ => None,
        };
    }
    replies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::CHAT_SAMPLING;

    fn request(system: &str, query: &str) -> ModelRequest {
        ModelRequest {
            system: system.to_string(),
            messages: vec![
                ModelMessage::text(Role::User, "earlier"),
                ModelMessage::text(Role::Assistant, "reply"),
                ModelMessage::text(Role::User, query),
            ],
            function: None,
            sampling: CHAT_SAMPLING,
        }
    }

    fn key(system: &str) -> BatchKey {
        BatchKey {
            system: system.to_string(),
            history: vec![],
            shape: ResponseShape::FreeText,
            temperature_bits: 0,
            max_tokens: 800,
        }
    }

    fn member(query: &str) -> (Member, oneshot::Receiver<DispatchOutcome>) {
        let (reply_tx, rx) = oneshot::channel();
        (
            Member {
                request: request("sys", query),
                reply_tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    #[test]
    fn test_merge_numbers_each_request_and_keeps_history() {
        let a = request("sys", "first question");
        let b = request("sys", "second question");
        let merged = merge_requests(&[&a, &b], ResponseShape::FreeText);

        assert_eq!(merged.messages.len(), 3);
        let user = &merged.messages[2];
        assert_eq!(
            user.parts,
            vec![
                MessagePart::Text("### Request 1".to_string()),
                MessagePart::Text("first question".to_string()),
                MessagePart::Text("### Request 2".to_string()),
                MessagePart::Text("second question".to_string()),
            ]
        );
        assert!(merged.system.starts_with("sys\n\n"));
        assert_eq!(merged.function.as_ref().unwrap().name, BATCH_FUNCTION);
        assert_eq!(merged.sampling.max_tokens, CHAT_SAMPLING.max_tokens * 2);
    }

    #[test]
    fn test_structured_batch_schema_embeds_the_shape_schema() {
        let schema = batch_schema(ResponseShape::StructuredComparison);
        let item = &schema.parameters["properties"]["responses"]["items"];
        assert_eq!(item["required"], json!(["id", "result"]));
        assert_eq!(
            item["properties"]["result"],
            ResponseShape::StructuredComparison
                .function_schema()
                .unwrap()
                .parameters
        );
    }

    #[test]
    fn test_split_free_text_answers_by_id() {
        let reply = ModelReply::FunctionCall {
            name: BATCH_FUNCTION.to_string(),
            arguments: json!({"responses": [
                {"id": 2, "answer": "second"},
                {"id": 1, "answer": "first"},
                {"id": 9, "answer": "ignored"}
            ]})
            .to_string(),
        };
        assert_eq!(
            split_reply(&reply, 3, ResponseShape::FreeText),
            vec![
                Some(ModelReply::Text {
                    text: "first".to_string()
                }),
                Some(ModelReply::Text {
                    text: "second".to_string()
                }),
                None,
            ]
        );
    }

    #[test]
    fn test_split_structured_answers_become_function_calls() {
        let reply = ModelReply::FunctionCall {
            name: BATCH_FUNCTION.to_string(),
            arguments: json!({"responses": [
                {"id": 1, "result": {"matches": ["Python"], "gaps": []}}
            ]})
            .to_string(),
        };
        let split = split_reply(&reply, 1, ResponseShape::StructuredComparison);
        assert_eq!(
            split[0],
            Some(ModelReply::FunctionCall {
                name: "compare_cv_jd".to_string(),
                arguments: json!({"matches": ["Python"], "gaps": []}).to_string(),
            })
        );
    }

    #[test]
    fn test_unparseable_batch_reply_leaves_every_member_unanswered() {
        let reply = ModelReply::Text {
            text: "sorry, I cannot do that".to_string(),
        };
        assert_eq!(
            split_reply(&reply, 2, ResponseShape::FreeText),
            vec![None, None]
        );
    }

    #[tokio::test]
    async fn test_batch_fills_then_flushes() {
        let coalescer = Coalescer::new(3);
        let (a, _ra) = member("a");
        let (b, _rb) = member("b");
        let (c, _rc) = member("c");

        let batch_id = match coalescer.enqueue(key("sys"), a).await {
            Enqueued::Opened { batch_id } => batch_id,
            _ => panic!("first member should open the batch"),
        };
        assert!(matches!(coalescer.enqueue(key("sys"), b).await, Enqueued::Joined));
        match coalescer.enqueue(key("sys"), c).await {
            Enqueued::Full(members) => assert_eq!(members.len(), 3),
            _ => panic!("third member should fill the batch"),
        }
        assert_eq!(coalescer.open_batches().await, 0);
        assert!(coalescer.take(&key("sys"), batch_id).await.is_none());
    }

    #[tokio::test]
    async fn test_different_keys_open_separate_batches() {
        let coalescer = Coalescer::new(3);
        let (a, _ra) = member("a");
        let (b, _rb) = member("b");
        let first = coalescer.enqueue(key("sys-a"), a).await;
        let second = coalescer.enqueue(key("sys-b"), b).await;
        assert!(matches!(first, Enqueued::Opened { .. }));
        assert!(matches!(second, Enqueued::Opened { .. }));
        assert_eq!(coalescer.open_batches().await, 2);

        if let Enqueued::Opened { batch_id } = first {
            let members = coalescer.take(&key("sys-a"), batch_id).await.unwrap();
            assert_eq!(members.len(), 1);
        }
        assert_eq!(coalescer.open_batches().await, 1);
    }

    #[tokio::test]
    async fn test_batch_token_fires_only_when_every_member_is_cancelled() {
        let (a, _ra) = member("a");
        let (b, _rb) = member("b");
        let (cancel_a, cancel_b) = (a.cancel.clone(), b.cancel.clone());
        let (batch, _watcher) = batch_token(&[a, b]);

        cancel_a.cancel();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!batch.is_cancelled());

        cancel_b.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), batch.cancelled())
            .await
            .unwrap();
    }
}
