mod allocator;
pub mod billing;
mod capacity;
mod catalog;
mod compaction;
mod error;
mod ledger;
mod queries;

pub use allocator::{allocate, spot_label};
pub use billing::CostBreakdown;
pub use capacity::{plan_resize, ResizePlan};
pub use error::{EngineError, ErrorClass};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

pub type SharedLot = Arc<RwLock<LotState>>;
pub type SharedUser = Arc<Mutex<UserState>>;

/// Where a reservation lives and who holds it. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ReservationRef {
    pub lot_id: Ulid,
    pub user_id: Ulid,
}

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

/// Owns the WAL. Each wakeup takes every append already queued, writes them
/// all, fsyncs once and answers every waiter with the shared outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<PendingAppend> = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
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
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL commit failed, rolling back batch");
        // A batch nobody was told succeeded must not reach replay.
        if let Err(e) = wal.rollback() {
            tracing::error!(error = %e, "WAL rollback failed, retrying on next append");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(outcome);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Applying events ──────────────────────────────────────

fn lot_from_event(event: &Event) -> Option<LotState> {
    let Event::LotCreated {
        id,
        name,
        address,
        pin_code,
        hourly_rate,
        active,
        spots,
    } = event
    else {
        return None;
    };
    Some(LotState {
        id: *id,
        name: name.clone(),
        address: address.clone(),
        pin_code: pin_code.clone(),
        hourly_rate: *hourly_rate,
        active: *active,
        retired: false,
        spots: spots.iter().map(Spot::from_seed).collect(),
        reservations: BTreeMap::new(),
    })
}

fn user_from_event(event: &Event) -> Option<UserState> {
    let Event::UserRegistered {
        id,
        username,
        full_name,
    } = event
    else {
        return None;
    };
    Some(UserState {
        id: *id,
        username: username.clone(),
        full_name: full_name.clone(),
        active: true,
        active_reservation: None,
    })
}

/// Free a spot, but only if this reservation is the one parked there.
fn vacate(lot: &mut LotState, spot_id: Ulid, reservation_id: Ulid) {
    if let Some(spot) = lot.spot_mut(spot_id)
        && spot.occupant == Some(reservation_id)
    {
        spot.occupant = None;
    }
}

/// Apply an event to a lot. The caller holds the lot's write lock.
fn apply_to_lot(lot: &mut LotState, event: &Event) {
    match event {
        Event::LotUpdated {
            name,
            address,
            pin_code,
            hourly_rate,
            active,
            added,
            removed,
            ..
        } => {
            lot.name = name.clone();
            lot.address = address.clone();
            lot.pin_code = pin_code.clone();
            lot.hourly_rate = *hourly_rate;
            lot.active = *active;
            lot.spots.retain(|s| !removed.contains(&s.id));
            lot.spots.extend(added.iter().map(Spot::from_seed));
        }
        Event::LotDeleted { .. } => {
            lot.retired = true;
            lot.active = false;
            lot.spots.clear();
        }
        Event::ReservationOpened {
            id,
            lot_id,
            spot_id,
            spot_label,
            user_id,
            vehicle_number,
            vehicle_model,
            entry,
        } => {
            if let Some(spot) = lot.spot_mut(*spot_id) {
                spot.occupant = Some(*id);
            }
            lot.reservations.insert(
                *id,
                Reservation {
                    id: *id,
                    lot_id: *lot_id,
                    spot_id: *spot_id,
                    spot_label: spot_label.clone(),
                    user_id: *user_id,
                    vehicle_number: vehicle_number.clone(),
                    vehicle_model: vehicle_model.clone(),
                    entry: *entry,
                    exit: None,
                    final_cost: None,
                    billed_rate: None,
                    status: ReservationStatus::Active,
                    forced: false,
                },
            );
        }
        Event::ReservationOccupied { id, entry, .. } => {
            if let Some(r) = lot.reservations.get_mut(id) {
                r.entry = *entry;
            }
        }
        Event::ReservationCompleted {
            id,
            exit,
            hourly_rate,
            final_cost,
            forced,
            ..
        } => {
            let Some(r) = lot.reservations.get_mut(id) else { return };
            r.status = ReservationStatus::Completed;
            r.exit = Some(*exit);
            r.final_cost = Some(*final_cost);
            r.billed_rate = Some(*hourly_rate);
            r.forced = *forced;
            let spot_id = r.spot_id;
            vacate(lot, spot_id, *id);
        }
        Event::ReservationCancelled { id, .. } => {
            let Some(r) = lot.reservations.get_mut(id) else { return };
            r.status = ReservationStatus::Cancelled;
            let spot_id = r.spot_id;
            vacate(lot, spot_id, *id);
        }
        Event::UserRegistered { .. } | Event::UserStatusChanged { .. } | Event::LotCreated { .. } => {}
    }
}

/// Apply an event to a user (caller holds the user's lock).
fn apply_to_user(user: &mut UserState, event: &Event) {
    match event {
        Event::UserStatusChanged { active, .. } => user.active = *active,
        Event::ReservationOpened { id, .. } => user.active_reservation = Some(*id),
        Event::ReservationCompleted { id, .. } | Event::ReservationCancelled { id, .. } => {
            if user.active_reservation == Some(*id) {
                user.active_reservation = None;
            }
        }
        _ => {}
    }
}

fn event_lot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::LotUpdated { id, .. } | Event::LotDeleted { id } => Some(*id),
        Event::ReservationOpened { lot_id, .. }
        | Event::ReservationOccupied { lot_id, .. }
        | Event::ReservationCompleted { lot_id, .. }
        | Event::ReservationCancelled { lot_id, .. } => Some(*lot_id),
        Event::LotCreated { .. } | Event::UserRegistered { .. } | Event::UserStatusChanged { .. } => {
            None
        }
    }
}

/// Rebuilt state before it is shared. Plain maps: nothing else can see it yet.
#[derive(Default)]
struct Replayed {
    lots: HashMap<Ulid, LotState>,
    users: HashMap<Ulid, UserState>,
    index: HashMap<Ulid, ReservationRef>,
}

impl Replayed {
    fn apply(&mut self, event: &Event) {
        if let Some(lot) = lot_from_event(event) {
            self.lots.insert(lot.id, lot);
            return;
        }
        if let Some(user) = user_from_event(event) {
            self.users.insert(user.id, user);
            return;
        }
        if let Event::ReservationOpened {
            id,
            lot_id,
            user_id,
            ..
        } = event
        {
            self.index.insert(
                *id,
                ReservationRef {
                    lot_id: *lot_id,
                    user_id: *user_id,
                },
            );
        }
        if let Some(lot) = event_lot_id(event).and_then(|id| self.lots.get_mut(&id)) {
            apply_to_lot(lot, event);
        }
        let user_id = match event {
            Event::UserStatusChanged { id, .. } => Some(*id),
            Event::ReservationOpened { user_id, .. } => Some(*user_id),
            Event::ReservationCompleted { id, .. } | Event::ReservationCancelled { id, .. } => {
                self.index.get(id).map(|r| r.user_id)
            }
            _ => None,
        };
        if let Some(user) = user_id.and_then(|id| self.users.get_mut(&id)) {
            apply_to_user(user, event);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) lots: DashMap<Ulid, SharedLot>,
    pub(super) users: DashMap<Ulid, SharedUser>,
    pub(super) usernames: DashMap<String, Ulid>,
    pub(super) reservation_index: DashMap<Ulid, ReservationRef>,
    /// Serialises creation, renames and deletion of lots and users.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_clock(wal_path, Arc::new(SystemClock))
    }

    pub fn with_clock(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event);
        }

        let engine = Self {
            lots: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            reservation_index: DashMap::new(),
            catalog_lock: Mutex::new(()),
            wal_tx,
            clock,
        };
        for (id, user) in replayed.users {
            engine.usernames.insert(user.username.clone(), id);
            engine.users.insert(id, Arc::new(Mutex::new(user)));
        }
        for (id, lot) in replayed.lots {
            engine.lots.insert(id, Arc::new(RwLock::new(lot)));
        }
        for (id, r) in replayed.index {
            engine.reservation_index.insert(id, r);
        }
        tracing::info!(
            events = events.len(),
            lots = engine.lots.len(),
            users = engine.users.len(),
            "ledger state replayed"
        );
        Ok(engine)
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn lot(&self, id: &Ulid) -> Option<SharedLot> {
        self.lots.get(id).map(|e| e.value().clone())
    }

    pub fn user(&self, id: &Ulid) -> Option<SharedUser> {
        self.users.get(id).map(|e| e.value().clone())
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
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably record a lot-only transition, then apply it.
    pub(super) async fn commit_lot(
        &self,
        lot: &mut LotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_lot(lot, event);
        Ok(())
    }

    pub(super) async fn commit_user(
        &self,
        user: &mut UserState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_user(user, event);
        Ok(())
    }

    /// Durably record a reservation transition, then apply it to both sides.
    /// The caller holds the user lock and the lot write lock, so no reader
    /// can observe the spot and the reservation out of step.
    pub(super) async fn commit_reservation(
        &self,
        user: &mut UserState,
        lot: &mut LotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_lot(lot, event);
        apply_to_user(user, event);
        Ok(())
    }

    /// Lock the holder and the lot of an existing reservation, in that order.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
    ) -> Result<(OwnedMutexGuard<UserState>, OwnedRwLockWriteGuard<LotState>), EngineError> {
        let r = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::ReservationNotFound(id))?;
        let user = self
            .user(&r.user_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let lot = self
            .lot(&r.lot_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let user_guard = user.lock_owned().await;
        let lot_guard = lot.write_owned().await;
        // A reserve still in flight has claimed the id but not committed.
        if !lot_guard.reservations.contains_key(&id) {
            return Err(EngineError::ReservationNotFound(id));
        }
        Ok((user_guard, lot_guard))
    }
}

// ── Caller checks ────────────────────────────────────────

pub(super) fn require_admin(caller: &Caller) -> Result<(), EngineError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(EngineError::AdminRequired)
    }
}

pub(super) fn require_user(caller: &Caller) -> Result<Ulid, EngineError> {
    match caller.role {
        Role::User => Ok(caller.id),
        Role::Admin => Err(EngineError::UserRequired),
    }
}
