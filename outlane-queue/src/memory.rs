use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    Bounce, Delivery, Lease, QueueAuthority, QueueError, Result, protocol::Command,
};

struct Pending {
    delivery: Delivery,
    not_before: Option<Instant>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, VecDeque<Pending>>,
    leased: HashMap<(String, String), (String, Delivery)>,
    commands: Vec<Command>,
    bounces: Vec<Bounce>,
    released: Vec<Delivery>,
    fail_updates: usize,
    fail_gets: usize,
}

/// In-memory queue authority
///
/// Holds deliveries per zone, grants a fresh lock on every GET and enforces
/// it on RELEASE and DEFER. Every command is recorded so callers can inspect
/// exactly what was issued. Intended for testing and for embedding the
/// engine without an external queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `delivery` for `zone`, ready immediately.
    pub fn push(&self, zone: &str, delivery: Delivery) {
        self.state
            .lock()
            .pending
            .entry(zone.to_string())
            .or_default()
            .push_back(Pending {
                delivery,
                not_before: None,
            });
    }

    /// Makes the next `count` RELEASE/DEFER/BOUNCE calls fail.
    pub fn fail_next_updates(&self, count: usize) {
        self.state.lock().fail_updates = count;
    }

    /// Makes the next `count` GET calls fail.
    pub fn fail_next_gets(&self, count: usize) {
        self.state.lock().fail_gets = count;
    }

    /// Every command received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Status updates (everything except GET) received so far.
    #[must_use]
    pub fn updates(&self) -> Vec<Command> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|command| !matches!(command, Command::Get { .. }))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn bounces(&self) -> Vec<Bounce> {
        self.state.lock().bounces.clone()
    }

    #[must_use]
    pub fn released(&self) -> Vec<Delivery> {
        self.state.lock().released.clone()
    }

    /// Deliveries waiting in `zone`, including deferred ones.
    #[must_use]
    pub fn pending(&self, zone: &str) -> Vec<Delivery> {
        self.state
            .lock()
            .pending
            .get(zone)
            .map(|queue| queue.iter().map(|p| p.delivery.clone()).collect())
            .unwrap_or_default()
    }

    fn take_update_failure(state: &mut State) -> Result<()> {
        if state.fail_updates > 0 {
            state.fail_updates -= 1;
            return Err(QueueError::Server("injected failure".to_string()));
        }
        Ok(())
    }

    fn take_lease(state: &mut State, lease: &Lease) -> Result<(String, Delivery)> {
        let key = (lease.id.clone(), lease.seq.clone());
        match state.leased.get(&key) {
            Some((_, delivery)) if delivery.lock == lease.lock => {
                state.leased.remove(&key).ok_or(QueueError::LockMismatch {
                    id: lease.id.clone(),
                    seq: lease.seq.clone(),
                })
            }
            _ => Err(QueueError::LockMismatch {
                id: lease.id.clone(),
                seq: lease.seq.clone(),
            }),
        }
    }
}

#[async_trait]
impl QueueAuthority for MemoryQueue {
    async fn get(&self, zone: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.lock();
        state.commands.push(Command::Get {
            zone: zone.to_string(),
        });

        if state.fail_gets > 0 {
            state.fail_gets -= 1;
            return Err(QueueError::Server("injected failure".to_string()));
        }

        let now = Instant::now();
        let Some(queue) = state.pending.get_mut(zone) else {
            return Ok(None);
        };
        let Some(position) = queue
            .iter()
            .position(|p| p.not_before.is_none_or(|at| at <= now))
        else {
            return Ok(None);
        };
        let Some(Pending { mut delivery, .. }) = queue.remove(position) else {
            return Ok(None);
        };

        delivery.lock = ulid::Ulid::new().to_string();
        state.leased.insert(
            (delivery.id.clone(), delivery.seq.clone()),
            (zone.to_string(), delivery.clone()),
        );

        Ok(Some(delivery))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut state = self.state.lock();
        state.commands.push(Command::Release(lease.clone()));
        Self::take_update_failure(&mut state)?;

        let (_, delivery) = Self::take_lease(&mut state, lease)?;
        state.released.push(delivery);
        Ok(())
    }

    async fn defer(&self, lease: &Lease, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.commands.push(Command::Defer {
            lease: lease.clone(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        });
        Self::take_update_failure(&mut state)?;

        let (zone, mut delivery) = Self::take_lease(&mut state, lease)?;
        delivery.deferred_count += 1;
        delivery.lock.clear();
        state.pending.entry(zone).or_default().push_back(Pending {
            delivery,
            not_before: Instant::now().checked_add(ttl),
        });
        Ok(())
    }

    async fn bounce(&self, bounce: &Bounce) -> Result<()> {
        let mut state = self.state.lock();
        state.commands.push(Command::Bounce(Box::new(bounce.clone())));
        Self::take_update_failure(&mut state)?;

        state.bounces.push(bounce.clone());
        Ok(())
    }
}
