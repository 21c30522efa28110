//! In-memory dead letter storage.
//!
//! "Durable" here means held by the process: messages are visible as soon
//! as `append` returns and are lost on restart. Use it for tests and for
//! paths where losing dead letters on a crash is acceptable.

use bulwark_core::{DeadLetterDraft, DeadLetterMessage, DlqStorage, MessageId, StorageFuture};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    messages: BTreeMap<MessageId, DeadLetterMessage>,
}

/// Process-local [`DlqStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    /// Create an empty store. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }
}

impl DlqStorage for MemoryStorage {
    fn append(&self, draft: DeadLetterDraft) -> StorageFuture<'_, DeadLetterMessage> {
        let message = self.with_inner(|inner| {
            inner.next_id += 1;
            let message = DeadLetterMessage::from_draft(MessageId::new(inner.next_id), draft);
            inner.messages.insert(message.id, message.clone());
            message
        });
        Box::pin(async move { Ok(message) })
    }

    fn list(&self) -> StorageFuture<'_, Vec<DeadLetterMessage>> {
        let messages = self.with_inner(|inner| inner.messages.values().cloned().collect());
        Box::pin(async move { Ok(messages) })
    }

    fn remove(&self, ids: Vec<MessageId>) -> StorageFuture<'_, usize> {
        let removed = self.with_inner(|inner| {
            ids.iter()
                .filter(|id| inner.messages.remove(id).is_some())
                .count()
        });
        Box::pin(async move { Ok(removed) })
    }

    fn get(&self, id: MessageId) -> StorageFuture<'_, Option<DeadLetterMessage>> {
        let message = self.with_inner(|inner| inner.messages.get(&id).cloned());
        Box::pin(async move { Ok(message) })
    }

    fn count(&self) -> StorageFuture<'_, usize> {
        let count = self.with_inner(|inner| inner.messages.len());
        Box::pin(async move { Ok(count) })
    }
}
