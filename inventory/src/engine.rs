//! The engine task and its command channel.
//!
//! [`InventoryEngine::spawn`] starts one task that owns the whole ledger
//! and executes commands strictly one at a time. The returned handle is
//! cheap to clone and implements [`InventoryStore`]; callers never touch
//! zone state directly.

use crate::ledger::Ledger;
use booking_rush_core::{
    BookingId, Clock, ConfirmOutcome, InventoryError, InventoryStore, ReleaseOutcome,
    ReserveOutcome, SaleWindow, ZoneCounters, ZoneKey,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Command-channel depth. Commands are O(1); the buffer only absorbs
/// bursts.
const COMMAND_BUFFER: usize = 4096;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Seed {
        zone: ZoneKey,
        total_seats: u32,
        sale_window: Option<SaleWindow>,
        reply: Reply<()>,
    },
    Reserve {
        zone: ZoneKey,
        hold_key: BookingId,
        quantity: u32,
        ttl: Duration,
        reply: Reply<Result<ReserveOutcome, InventoryError>>,
    },
    Confirm {
        zone: ZoneKey,
        hold_key: BookingId,
        reply: Reply<Result<ConfirmOutcome, InventoryError>>,
    },
    Release {
        zone: ZoneKey,
        hold_key: BookingId,
        reply: Reply<Result<ReleaseOutcome, InventoryError>>,
    },
    Snapshot {
        zone: ZoneKey,
        reply: Reply<Option<ZoneCounters>>,
    },
    Rebuild {
        zone: ZoneKey,
        counters: ZoneCounters,
        reply: Reply<Result<(), InventoryError>>,
    },
    Zones {
        reply: Reply<Vec<ZoneKey>>,
    },
}

/// Handle to the inventory engine task.
///
/// Implements [`InventoryStore`]; clone freely.
#[derive(Clone)]
pub struct InventoryEngine {
    tx: mpsc::Sender<Command>,
}

impl InventoryEngine {
    /// Spawns the engine task. `sweep_interval` bounds how stale an expired
    /// hold can get before the background sweep releases it; holds are also
    /// swept lazily on every command touching their zone.
    #[must_use]
    pub fn spawn(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(rx, clock, sweep_interval));
        Self { tx }
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, InventoryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| InventoryError::Unavailable("engine task stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| InventoryError::Unavailable("engine dropped the reply".to_string()))
    }
}

async fn run(
    mut rx: mpsc::Receiver<Command>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
) {
    let mut ledger = Ledger::default();
    let mut tick = tokio::time::interval(sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    tracing::debug!("all inventory handles dropped, engine exiting");
                    break;
                };
                execute(&mut ledger, &*clock, command);
            }
            _ = tick.tick() => {
                let swept = ledger.sweep_all(clock.now());
                if swept > 0 {
                    tracing::debug!(swept, "background sweep released expired holds");
                    metrics::counter!("inventory.holds.swept").increment(swept as u64);
                }
            }
        }
    }
}

/// Executes one command synchronously. This function being the only writer
/// is the linearization point for all inventory mutations.
fn execute(ledger: &mut Ledger, clock: &dyn Clock, command: Command) {
    match command {
        Command::Seed {
            zone,
            total_seats,
            sale_window,
            reply,
        } => {
            ledger.seed(zone, total_seats, sale_window);
            let _ = reply.send(());
        }
        Command::Reserve {
            zone,
            hold_key,
            quantity,
            ttl,
            reply,
        } => {
            let now = clock.now();
            let result = ledger
                .zone_mut(zone)
                .and_then(|z| z.reserve(hold_key, quantity, now, ttl));
            if matches!(result, Ok(ReserveOutcome::Insufficient { .. })) {
                metrics::counter!("inventory.reserve.insufficient").increment(1);
            }
            let _ = reply.send(result);
        }
        Command::Confirm {
            zone,
            hold_key,
            reply,
        } => {
            let now = clock.now();
            let result = ledger.zone_mut(zone).map(|z| z.confirm(hold_key, now));
            let _ = reply.send(result);
        }
        Command::Release {
            zone,
            hold_key,
            reply,
        } => {
            let now = clock.now();
            let result = ledger.zone_mut(zone).map(|z| z.release(hold_key, now));
            let _ = reply.send(result);
        }
        Command::Snapshot { zone, reply } => {
            let _ = reply.send(ledger.snapshot(zone));
        }
        Command::Rebuild {
            zone,
            counters,
            reply,
        } => {
            let result = ledger.zone_mut(zone).map(|z| z.rebuild(counters));
            let _ = reply.send(result);
        }
        Command::Zones { reply } => {
            let _ = reply.send(ledger.keys());
        }
    }
}

#[async_trait]
impl InventoryStore for InventoryEngine {
    async fn seed(
        &self,
        zone: ZoneKey,
        total_seats: u32,
        sale_window: Option<SaleWindow>,
    ) -> Result<(), InventoryError> {
        self.send(|reply| Command::Seed {
            zone,
            total_seats,
            sale_window,
            reply,
        })
        .await
    }

    async fn reserve(
        &self,
        zone: ZoneKey,
        hold_key: BookingId,
        quantity: u32,
        ttl: Duration,
    ) -> Result<ReserveOutcome, InventoryError> {
        self.send(|reply| Command::Reserve {
            zone,
            hold_key,
            quantity,
            ttl,
            reply,
        })
        .await?
    }

    async fn confirm(
        &self,
        zone: ZoneKey,
        hold_key: BookingId,
    ) -> Result<ConfirmOutcome, InventoryError> {
        self.send(|reply| Command::Confirm {
            zone,
            hold_key,
            reply,
        })
        .await?
    }

    async fn release(
        &self,
        zone: ZoneKey,
        hold_key: BookingId,
    ) -> Result<ReleaseOutcome, InventoryError> {
        self.send(|reply| Command::Release {
            zone,
            hold_key,
            reply,
        })
        .await?
    }

    async fn snapshot(&self, zone: ZoneKey) -> Result<Option<ZoneCounters>, InventoryError> {
        self.send(|reply| Command::Snapshot { zone, reply }).await
    }

    async fn rebuild(&self, zone: ZoneKey, counters: ZoneCounters) -> Result<(), InventoryError> {
        self.send(|reply| Command::Rebuild {
            zone,
            counters,
            reply,
        })
        .await?
    }

    async fn zones(&self) -> Result<Vec<ZoneKey>, InventoryError> {
        self.send(|reply| Command::Zones { reply }).await
    }
}
