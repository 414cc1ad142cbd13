//! Polling watch over a session row.
//!
//! Each write bumps `exam_sessions.revision`; the poller re-reads the document
//! whenever the revision changes. Query failures are reported as
//! `ConnectionLost` and never as `Missing`.

use std::time::Duration;

use exam_core::model::SessionId;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;

use super::session_repo::load_session;
use crate::feed::{SessionSubscription, WatchEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Present(i64),
    Missing,
    Lost,
}

pub(crate) fn spawn_poller(
    pool: SqlitePool,
    id: SessionId,
    interval: Duration,
) -> SessionSubscription {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut last: Option<Observed> = None;
        while !tx.is_closed() {
            let (observed, event) = poll_once(&pool, id).await;
            if last != Some(observed) {
                if let Some(event) = event {
                    if tx.send(event).is_err() {
                        break;
                    }
                    last = Some(observed);
                }
            }
            tokio::time::sleep(interval).await;
        }
        tracing::debug!(session = %id, "session watch closed");
    });
    SessionSubscription::new(rx)
}

async fn poll_once(pool: &SqlitePool, id: SessionId) -> (Observed, Option<WatchEvent>) {
    let revision = sqlx::query("SELECT revision FROM exam_sessions WHERE id = ?1")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
        .and_then(|row| row.map(|r| r.try_get::<i64, _>("revision")).transpose());

    match revision {
        Ok(Some(rev)) => match load_session(pool, id).await {
            Ok(Some(session)) => (Observed::Present(rev), Some(WatchEvent::Snapshot(session))),
            // Deleted between the two reads; the next poll reports it.
            Ok(None) => (Observed::Present(rev), None),
            Err(err) => {
                tracing::warn!(session = %id, error = %err, "session watch read failed");
                (Observed::Lost, Some(WatchEvent::ConnectionLost))
            }
        },
        Ok(None) => (Observed::Missing, Some(WatchEvent::Missing)),
        Err(err) => {
            tracing::warn!(session = %id, error = %err, "session watch poll failed");
            (Observed::Lost, Some(WatchEvent::ConnectionLost))
        }
    }
}
