//! Operator actions on dead letters.

use prscan_core::{
    DeadLetter, DeadLetterError, DeadLetterSink, DeadLetterStatus, EntryId, StreamLog,
    StreamLogError, StreamName,
};
use std::sync::Arc;
use thiserror::Error;

/// Errors from [`DeadLetterReplayer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// Dead-letter sink failed, or the letter is missing or already resolved
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    /// Re-appending the message failed; the letter stays pending
    #[error(transparent)]
    Log(#[from] StreamLogError),
}

/// Replays or discards buried messages.
#[derive(Clone)]
pub struct DeadLetterReplayer {
    sink: Arc<dyn DeadLetterSink>,
    log: Arc<dyn StreamLog>,
}

impl DeadLetterReplayer {
    /// Create a replayer appending to `log`.
    #[must_use]
    pub fn new(sink: Arc<dyn DeadLetterSink>, log: Arc<dyn StreamLog>) -> Self {
        Self { sink, log }
    }

    /// Pending dead letters, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::DeadLetter`] if the sink fails.
    pub async fn pending(&self, limit: usize) -> Result<Vec<DeadLetter>, ReplayError> {
        Ok(self.sink.list(Some(DeadLetterStatus::Pending), limit).await?)
    }

    /// Append the buried message to its stream again as a new entry and mark
    /// the letter replayed. Returns the resolved letter and the new entry id.
    ///
    /// Two concurrent replays of one letter may both append; only one of them
    /// resolves it.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`] / [`DeadLetterError::AlreadyResolved`]
    ///   if there is nothing pending to replay
    /// - [`ReplayError::Log`] if the append fails (the letter stays pending)
    pub async fn replay(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        operator: impl Into<String>,
        notes: Option<String>,
    ) -> Result<(DeadLetter, EntryId), ReplayError> {
        let letter = self.pending_letter(stream, entry_id).await?;
        let new_id = self.log.append(&letter.stream, letter.message.clone()).await?;
        let notes = notes.or_else(|| Some(format!("replayed as {new_id}")));
        let resolved = self
            .sink
            .resolve(stream, entry_id, DeadLetterStatus::Replayed, operator.into(), notes)
            .await?;
        tracing::info!(
            stream = %stream,
            entry_id = %entry_id,
            new_entry_id = %new_id,
            request_id = %resolved.message.request_id,
            "Dead letter replayed"
        );
        Ok((resolved, new_id))
    }

    /// Mark the letter discarded.
    ///
    /// # Errors
    ///
    /// [`DeadLetterError::NotFound`] / [`DeadLetterError::AlreadyResolved`]
    /// if there is nothing pending to discard.
    pub async fn discard(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        operator: impl Into<String>,
        notes: Option<String>,
    ) -> Result<DeadLetter, ReplayError> {
        let resolved = self
            .sink
            .resolve(stream, entry_id, DeadLetterStatus::Discarded, operator.into(), notes)
            .await?;
        tracing::info!(stream = %stream, entry_id = %entry_id, "Dead letter discarded");
        Ok(resolved)
    }

    async fn pending_letter(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Result<DeadLetter, ReplayError> {
        let letter = self.sink.get(stream, entry_id).await?;
        if letter.status != DeadLetterStatus::Pending {
            return Err(DeadLetterError::AlreadyResolved {
                stream: stream.clone(),
                entry_id,
                status: letter.status,
            }
            .into());
        }
        Ok(letter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use prscan_core::{Burial, GroupName, RequestId, StreamMessage};
    use prscan_testing::{InMemoryDeadLetterSink, InMemoryStreamLog, test_clock};
    use prscan_core::Clock;

    async fn buried(sink: &InMemoryDeadLetterSink, stream: &StreamName) -> EntryId {
        let entry_id = EntryId::new(1_700_000_000_000, 0);
        sink.bury(Burial {
            stream: stream.clone(),
            entry_id,
            group: GroupName::workers(),
            message: StreamMessage::new(RequestId::generate(), "http://cb"),
            delivery_count: 5,
            dead_lettered_at: test_clock().now(),
        })
        .await
        .unwrap();
        entry_id
    }

    #[tokio::test]
    async fn replay_appends_and_resolves_once() {
        let sink = InMemoryDeadLetterSink::new();
        let log = InMemoryStreamLog::new();
        let stream = StreamName::new("worker-kics");
        let entry_id = buried(&sink, &stream).await;
        let replayer = DeadLetterReplayer::new(Arc::new(sink.clone()), Arc::new(log.clone()));

        assert_eq!(replayer.pending(10).await.unwrap().len(), 1);
        let (letter, new_id) = replayer.replay(&stream, entry_id, "ops", None).await.unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Replayed);
        assert_eq!(letter.resolved_by.as_deref(), Some("ops"));
        assert_eq!(log.entries(&stream)[0].0, new_id);
        assert_eq!(log.entries(&stream)[0].1, letter.message);

        let again = replayer.replay(&stream, entry_id, "ops", None).await.unwrap_err();
        assert!(matches!(
            again,
            ReplayError::DeadLetter(DeadLetterError::AlreadyResolved { .. })
        ));
        assert_eq!(log.len(&stream), 1);
        assert!(replayer.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_append_keeps_letter_pending() {
        let sink = InMemoryDeadLetterSink::new();
        let log = InMemoryStreamLog::new();
        let stream = StreamName::new("worker-kics");
        let entry_id = buried(&sink, &stream).await;
        log.set_unavailable(true);
        let replayer = DeadLetterReplayer::new(Arc::new(sink.clone()), Arc::new(log));

        let err = replayer.replay(&stream, entry_id, "ops", None).await.unwrap_err();
        assert!(matches!(err, ReplayError::Log(_)));
        assert_eq!(
            sink.get(&stream, entry_id).await.unwrap().status,
            DeadLetterStatus::Pending
        );
    }

    #[tokio::test]
    async fn discard_and_missing_letters() {
        let sink = InMemoryDeadLetterSink::new();
        let stream = StreamName::new("worker-kics");
        let entry_id = buried(&sink, &stream).await;
        let replayer =
            DeadLetterReplayer::new(Arc::new(sink.clone()), Arc::new(InMemoryStreamLog::new()));

        let letter = replayer
            .discard(&stream, entry_id, "ops", Some("bad payload".into()))
            .await
            .unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Discarded);
        assert_eq!(letter.resolution_notes.as_deref(), Some("bad payload"));

        let missing = replayer
            .discard(&stream, EntryId::new(1, 1), "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(
            missing,
            ReplayError::DeadLetter(DeadLetterError::NotFound { .. })
        ));
    }
}
