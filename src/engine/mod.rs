mod audit;
mod conflict;
mod error;
mod interval;
mod mutations;
mod queries;
mod slots;
mod windows;
mod zone;
#[cfg(test)]
mod tests;

pub use audit::{is_consistent, state_at};
pub use error::EngineError;
pub use interval::{merge_overlapping, subtract_one, union};
pub use mutations::{AdminEdit, BookingRequest};
pub use queries::SlotRequest;
pub use slots::{generate_slots, SlotQuery};
pub use windows::{coalesced_windows_for_date, day_of_week, windows_for_date};
pub use zone::{localize, parse_tz, project};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

pub type SharedAuthorState = Arc<RwLock<AuthorState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
///
/// A non-append command found while draining closes the batch and runs after it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(batch = batch.len(), "WAL flush failed: {e}");
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so the partial bytes don't ride along
    // with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}

/// The booking engine: per-author state in memory, made durable through the WAL.
///
/// Every author is a unit of isolation. A transaction takes that author's
/// write lock, checks its invariants, appends one WAL record and only then
/// applies the record in memory. A WAL failure returns before anything is
/// applied.
pub struct Engine {
    pub state: DashMap<Ulid, SharedAuthorState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
    /// Reverse lookup: entity (type/rule/override/appointment) id → author id.
    pub(super) entity_to_author: DashMap<Ulid, Ulid>,
    /// Held shared by every mutation. Compaction and author registration
    /// hold it exclusively: a compaction snapshot never misses a record
    /// appended behind it, and two registrations never both pass the
    /// duplicate check.
    pub(super) commit_gate: RwLock<()>,
    pub(super) job_secret: Option<String>,
}

/// Apply an event to an author's state (no locking; caller holds the lock).
fn apply_to_author(st: &mut AuthorState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::InterviewTypeAdded { interview_type } => {
            entity_map.insert(interview_type.id, interview_type.author_id);
            st.interview_types.push(interview_type.clone());
        }
        Event::RuleAdded { rule } => {
            entity_map.insert(rule.id, rule.author_id);
            st.rules.push(rule.clone());
        }
        Event::RuleActiveSet { id, active, .. } => {
            if let Some(rule) = st.rules.iter_mut().find(|r| r.id == *id) {
                rule.active = *active;
            }
        }
        Event::OverrideAdded { entry } => {
            entity_map.insert(entry.id, entry.author_id);
            st.overrides.push(entry.clone());
        }
        Event::AppointmentCommitted { entry } => {
            entity_map.insert(entry.after.id, entry.after.author_id);
            st.upsert_appointment(entry.after.clone());
            st.audit.push(entry.clone());
        }
        // Registration creates the state itself, handled at the DashMap level.
        Event::AuthorRegistered { .. } => {}
    }
}

/// The author an event belongs to.
fn event_author_id(event: &Event) -> Ulid {
    match event {
        Event::AuthorRegistered { profile } => profile.id,
        Event::InterviewTypeAdded { interview_type } => interview_type.author_id,
        Event::RuleAdded { rule } => rule.author_id,
        Event::RuleActiveSet { author_id, .. } => *author_id,
        Event::OverrideAdded { entry } => entry.author_id,
        Event::AppointmentCommitted { entry } => entry.after.author_id,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notifier,
            clock,
            entity_to_author: DashMap::new(),
            commit_gate: RwLock::new(()),
            job_secret: None,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never block here: this may run inside an async context.
        for event in &events {
            if let Event::AuthorRegistered { profile } = event {
                let st = AuthorState::new(profile.clone());
                engine.state.insert(profile.id, Arc::new(RwLock::new(st)));
                continue;
            }
            let author_id = event_author_id(event);
            let Some(entry) = engine.state.get(&author_id) else {
                tracing::warn!(%author_id, "replay: event for unknown author skipped");
                continue;
            };
            let st_arc = entry.clone();
            drop(entry);
            if let Ok(mut guard) = st_arc.try_write() {
                apply_to_author(&mut guard, event, &engine.entity_to_author);
            }
        }

        tracing::info!(
            events = events.len(),
            authors = engine.state.len(),
            "engine state restored from {}",
            wal_path.display()
        );
        metrics::gauge!(crate::observability::AUTHORS_ACTIVE).set(engine.state.len() as f64);
        Ok(engine)
    }

    /// Secret required by the on-demand reminder job. `None` leaves it open.
    pub fn with_job_secret(mut self, secret: Option<String>) -> Self {
        self.job_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn get_author(&self, id: &Ulid) -> Option<SharedAuthorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_author_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_author.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(&self, st: &mut AuthorState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_author(st, event, &self.entity_to_author);
        Ok(())
    }

    /// Lookup entity → author, get author, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
        not_found: fn(Ulid) -> EngineError,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<AuthorState>, EngineError> {
        let author_id = self
            .get_author_for_entity(entity_id)
            .ok_or_else(|| not_found(*entity_id))?;
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        Ok(st.write_owned().await)
    }

    /// Lookup entity → author, acquire read lock.
    pub(super) async fn resolve_entity_read(
        &self,
        entity_id: &Ulid,
        not_found: fn(Ulid) -> EngineError,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<AuthorState>, EngineError> {
        let author_id = self
            .get_author_for_entity(entity_id)
            .ok_or_else(|| not_found(*entity_id))?;
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        Ok(st.read_owned().await)
    }

    pub(super) fn author_arcs(&self) -> Vec<SharedAuthorState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }
}
