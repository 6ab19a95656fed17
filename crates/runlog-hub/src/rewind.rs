use crate::hub::{RunError, RunHub, ThreadSlot};
use crate::registry::{ActiveRunClaim, AdmissionConflict, REWIND_LABEL};
use chrono::Utc;
use runlog_core::events::{EventBody, HistoryResetPayload, RewindStatus};
use runlog_core::rewind::{apply_rewind_flags, check_rewind_target, rewindable_indices};
use runlog_core::{is_new_thread_sentinel, NewMessage};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RewindError {
    #[error(transparent)]
    Busy(#[from] AdmissionConflict),
    #[error("{0}")]
    Validation(String),
    #[error("thread not found: {0}")]
    NotFound(String),
    #[error("rewind failed: {0}")]
    Store(String),
}

impl From<RunError> for RewindError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Busy(conflict) => RewindError::Busy(conflict),
            RunError::Validation(detail) => RewindError::Validation(detail),
            RunError::NotFound(thread_id) => RewindError::NotFound(thread_id),
            other => RewindError::Store(other.to_string()),
        }
    }
}

impl RunHub {
    /// Replaces the end-user turn at `message_index` and everything after it,
    /// then runs the executor again from the edited turn.
    pub async fn rewind(
        self: &Arc<Self>,
        thread_id: &str,
        message_index: u64,
        new_content: &str,
    ) -> Result<(), RewindError> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() || is_new_thread_sentinel(thread_id) {
            return Err(RewindError::Validation(
                "rewind needs an existing thread_id".to_string(),
            ));
        }

        let admitted = self.registry().try_admit(thread_id, REWIND_LABEL, None)?;
        let slot = match self.slot(thread_id) {
            Ok(slot) => slot,
            Err(err) => {
                self.registry().release(admitted.claim.token);
                return Err(err.into());
            }
        };
        let mut guard = slot.lock().await;

        if let Err(err) = self.check_rewind(thread_id, &mut guard, message_index, new_content) {
            drop(guard);
            self.registry().release(admitted.claim.token);
            info!(event = "rewind_rejected", thread_id, message_index, error = %err);
            return Err(err);
        }

        info!(event = "rewind_started", thread_id, message_index, token = admitted.claim.token);
        if let Err(err) = self.apply_rewind(thread_id, &mut guard, message_index, new_content) {
            warn!(event = "rewind_failed", thread_id, message_index, error = %err);
            self.fail_rewind(&admitted.claim, &mut guard, &err);
            return Err(err.into());
        }
        drop(guard);

        tokio::spawn(self.clone().drive(admitted));
        Ok(())
    }

    fn check_rewind(
        &self,
        thread_id: &str,
        slot: &mut ThreadSlot,
        message_index: u64,
        new_content: &str,
    ) -> Result<(), RewindError> {
        if new_content.trim().is_empty() {
            return Err(RewindError::Validation(
                "new_message must not be blank".to_string(),
            ));
        }
        let messages = self
            .with_store(|store| store.read(thread_id, 0))
            .map_err(RunError::from)?;
        let eligible = rewindable_indices(&messages, slot.in_flight);
        check_rewind_target(&messages, message_index, &eligible)
            .map_err(|err| RewindError::Validation(err.to_string()))?;
        slot.eligible = eligible;
        Ok(())
    }

    fn apply_rewind(
        &self,
        thread_id: &str,
        slot: &mut ThreadSlot,
        message_index: u64,
        new_content: &str,
    ) -> Result<(), RunError> {
        slot.in_flight = Some(message_index);
        self.emit_rewind_status(
            thread_id,
            slot,
            RewindStatus::Pending,
            Some(message_index),
            None,
        )?;

        self.with_store(|store| {
            store.rewrite_from(
                thread_id,
                message_index,
                NewMessage::end_user(new_content),
                Utc::now(),
            )
        })?;
        let (mut messages, plan) = self.with_store(|store| {
            Ok((store.read(thread_id, 0)?, store.latest_plan(thread_id)?))
        })?;
        apply_rewind_flags(&mut messages, &BTreeSet::new());
        self.emit(
            thread_id,
            EventBody::HistoryReset(HistoryResetPayload { messages, plan }),
        )?;

        slot.in_flight = None;
        self.refresh_eligibility(thread_id, slot, true)?;
        self.emit_rewind_status(
            thread_id,
            slot,
            RewindStatus::Ready,
            Some(message_index),
            None,
        )?;
        Ok(())
    }

    fn fail_rewind(&self, claim: &ActiveRunClaim, slot: &mut ThreadSlot, err: &RunError) {
        let thread_id = claim.thread_id.as_str();
        slot.in_flight = None;
        if let Err(emit_err) = self.emit_rewind_status(
            thread_id,
            slot,
            RewindStatus::Error,
            None,
            Some(err.to_string()),
        ) {
            warn!(event = "rewind_status_failed", thread_id, error = %emit_err);
        }
        if let Err(emit_err) = self.emit_terminal(claim, EventBody::error(err.to_string())) {
            warn!(event = "rewind_error_publish_failed", thread_id, error = %emit_err);
            self.registry().release(claim.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{events_until_terminal, hub_with, next_event, seeded_store};
    use runlog_core::events::EventKind;
    use serde_json::json;
    use std::time::Duration;

    fn five_turns() -> [&'static str; 5] {
        ["draft report", "drafted", "add charts", "charts added", "ship it"]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rewind_truncates_resets_history_and_reruns() {
        let (store, thread_id) = seeded_store(&five_turns());
        let hub = hub_with(store, Duration::from_millis(5));
        let before = hub.history(&thread_id, false).await.expect("history");
        let mut sub = hub
            .subscribe(&thread_id, before.event_cursor)
            .expect("subscribe");

        hub.rewind(&thread_id, 2, "retry").await.expect("rewind");
        let events = events_until_terminal(&mut sub).await;
        let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::RewindStatus,
                EventKind::HistoryReset,
                EventKind::RewindUpdate,
                EventKind::RewindStatus,
                EventKind::MessageUpdate,
                EventKind::RewindUpdate,
                EventKind::Done,
            ]
        );
        assert_eq!(events[0].payload["status"], json!("pending"));
        assert_eq!(events[0].payload["message_index"], json!(2));
        assert_eq!(events[3].payload["status"], json!("ready"));

        let reset: Vec<u64> = events[1].payload["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .filter_map(|message| message["message_index"].as_u64())
            .collect();
        assert_eq!(reset, vec![0, 1, 2]);
        assert_eq!(events[1].payload["messages"][2]["content"], json!("retry"));
        assert!(events[1].payload["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .filter(|message| message["originator"]["kind"] == json!("end_user"))
            .all(|message| message["can_rewind_before"] == json!(false)));
        assert_eq!(events[2].payload, json!({"rewindable_indices": [0]}));
        assert_eq!(events[5].payload, json!({"rewindable_indices": [0, 2]}));

        let cursors: Vec<u64> = events.iter().map(|event| event.cursor).collect();
        assert!(cursors.windows(2).all(|pair| pair[1] == pair[0] + 1));

        let after = hub.history(&thread_id, false).await.expect("history");
        let texts: Vec<Option<&str>> = after.messages.iter().map(|m| m.content_text()).collect();
        assert_eq!(
            texts,
            vec![
                Some("draft report"),
                Some("drafted"),
                Some("retry"),
                Some("echo: retry")
            ]
        );
        assert_eq!(after.rewind_status, RewindStatus::Ready);
        assert_eq!(hub.registry().current(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rewind_is_rejected_while_another_thread_runs() {
        let (store, busy_thread) = seeded_store(&[]);
        let hub = hub_with(store, Duration::from_secs(30));
        let idle_thread = hub
            .with_store(|store| store.create_run(Utc::now()))
            .expect("second thread");

        hub.start_run(&busy_thread, "long job").await.expect("run");
        match hub.rewind(&idle_thread, 0, "edit").await {
            Err(RewindError::Busy(conflict)) => {
                assert_eq!(conflict.active_thread_id, busy_thread);
            }
            other => panic!("expected busy, got {other:?}"),
        }
        assert_eq!(
            hub.registry().current().map(|claim| claim.thread_id),
            Some(busy_thread.clone())
        );
        hub.interrupt(&busy_thread).expect("interrupt");
    }

    #[tokio::test]
    async fn invalid_targets_release_the_claim_without_events() {
        let (store, thread_id) = seeded_store(&five_turns());
        let hub = hub_with(store, Duration::ZERO);
        let head = hub.history(&thread_id, false).await.expect("history").event_cursor;

        for (index, content) in [(1, "x"), (4, "x"), (9, "x"), (0, "  ")] {
            let result = hub.rewind(&thread_id, index, content).await;
            assert!(
                matches!(result, Err(RewindError::Validation(_))),
                "index {index}: {result:?}"
            );
            assert_eq!(hub.registry().current(), None);
        }
        assert!(matches!(
            hub.rewind("250101_000000_000000", 0, "x").await,
            Err(RewindError::NotFound(_))
        ));
        assert_eq!(hub.registry().current(), None);

        let after = hub.history(&thread_id, false).await.expect("history");
        assert_eq!(after.event_cursor, head);
        assert_eq!(after.messages.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rewinding_the_first_turn_keeps_cursors_monotonic() {
        let (store, thread_id) = seeded_store(&five_turns());
        let hub = hub_with(store, Duration::from_millis(1));
        let mut sub = hub.subscribe(&thread_id, 0).expect("subscribe");

        hub.rewind(&thread_id, 0, "start over").await.expect("first rewind");
        let first = events_until_terminal(&mut sub).await;
        hub.rewind(&thread_id, 0, "again").await.expect("second rewind");
        let second = events_until_terminal(&mut sub).await;

        let cursors: Vec<u64> = first.iter().chain(&second).map(|e| e.cursor).collect();
        assert_eq!(cursors, (0..cursors.len() as u64).collect::<Vec<_>>());
        let reset = second
            .iter()
            .find(|event| event.kind == EventKind::HistoryReset)
            .expect("history reset");
        assert_eq!(reset.payload["messages"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn failed_rewind_reports_error_status_then_terminal_error() {
        let (store, thread_id) = seeded_store(&five_turns());
        let hub = hub_with(store, Duration::ZERO);
        let head = hub.history(&thread_id, false).await.expect("history").event_cursor;
        let mut sub = hub.subscribe(&thread_id, head).expect("subscribe");

        let admitted = hub
            .registry()
            .try_admit(&thread_id, REWIND_LABEL, None)
            .expect("admit");
        let slot = hub.slot(&thread_id).expect("slot");
        {
            let mut guard = slot.lock().await;
            guard.in_flight = Some(2);
            guard.rewind_status = RewindStatus::Pending;
            let err = RunError::Validation("disk full".to_string());
            hub.fail_rewind(&admitted.claim, &mut guard, &err);
            assert_eq!(guard.in_flight, None);
            assert_eq!(guard.rewind_status, RewindStatus::Error);
        }

        let status = next_event(&mut sub).await;
        assert_eq!(status.kind, EventKind::RewindStatus);
        assert_eq!(status.payload["status"], json!("error"));
        assert_eq!(status.payload["detail"], json!("disk full"));
        let terminal = next_event(&mut sub).await;
        assert_eq!(terminal.kind, EventKind::Error);
        assert_eq!(terminal.payload, json!({"error": "disk full"}));
        assert_eq!(terminal.cursor, status.cursor + 1);
        assert_eq!(hub.registry().current(), None);

        hub.start_run(&thread_id, "carry on").await.expect("next run");
        let events = events_until_terminal(&mut sub).await;
        let ready = events
            .iter()
            .find(|event| event.kind == EventKind::RewindStatus)
            .expect("status reset");
        assert_eq!(ready.payload["status"], json!("ready"));
    }

    #[tokio::test]
    async fn snapshot_cursor_pairs_with_subscription() {
        let (store, thread_id) = seeded_store(&five_turns());
        let hub = hub_with(store, Duration::from_secs(30));
        hub.rewind(&thread_id, 2, "retry").await.expect("rewind");

        let snapshot = hub.history(&thread_id, false).await.expect("history");
        assert_eq!(snapshot.messages.len(), 3);
        let mut sub = hub
            .subscribe(&thread_id, snapshot.event_cursor)
            .expect("subscribe");
        hub.interrupt(&thread_id).expect("interrupt");

        let event = next_event(&mut sub).await;
        assert_eq!(event.cursor, snapshot.event_cursor);
        assert_eq!(event.kind, EventKind::MessageUpdate);
        assert_eq!(event.payload["messages"][0]["message_index"], json!(3));
    }
}
