//! Background health checking of idle connections.
//!
//! Every `health_check_interval` the pool sweeps its idle connections one at
//! a time: connections past their lifetime, idle for too long while the pool
//! is above its minimum, or failing their liveness probe are closed. The pool
//! is then topped back up to `min_connections`. Failures are logged and never
//! reach callers of the pool.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::lifecycle::{ConnectionFactory, ConnectionMetadata};
use crate::pool::{PoolInner, Reservation};

/// What a single health check sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Idle connections examined.
    pub checked: u32,
    /// Connections closed by the sweep.
    pub evicted: u32,
    /// Replacement connections opened.
    pub opened: u32,
}

/// Why an idle connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    Expired,
    IdleTimeout,
    Invalid,
}

impl std::fmt::Display for Eviction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Expired => "max lifetime exceeded",
            Self::IdleTimeout => "idle timeout exceeded",
            Self::Invalid => "failed liveness probe",
        })
    }
}

/// Start the periodic health check task for a pool.
///
/// The task only holds a weak reference, so it ends on its own once every
/// handle to the pool is gone.
pub(crate) fn spawn<F: ConnectionFactory>(inner: &Arc<PoolInner<F>>) -> JoinHandle<()> {
    let pool = Arc::downgrade(inner);
    let stop = Arc::clone(&inner.reaper_stop);
    let period = inner.config.health_check_interval;
    let pool_id = inner.id;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.notified() => break,
                _ = interval.tick() => {}
            }

            let Some(inner) = pool.upgrade() else {
                break;
            };
            if inner.state.lock().closed {
                break;
            }

            let summary = sweep(&inner).await;
            if summary.evicted > 0 || summary.opened > 0 {
                tracing::debug!(
                    pool = pool_id,
                    checked = summary.checked,
                    evicted = summary.evicted,
                    opened = summary.opened,
                    "health check sweep finished"
                );
            }
        }

        tracing::debug!(pool = pool_id, "health check task stopped");
    })
}

/// Run one sweep over the connections idle at the time of the call.
pub(crate) async fn sweep<F: ConnectionFactory>(inner: &PoolInner<F>) -> SweepSummary {
    let mut summary = SweepSummary::default();
    let ids = inner.state.lock().registry.idle_ids();

    for id in ids {
        let lent = {
            let mut state = inner.state.lock();
            if state.closed {
                break;
            }
            let above_min = state.registry.size() > inner.config.min_connections;
            state
                .registry
                .begin_probe(id)
                .map(|idle| (idle, above_min))
        };
        let Some((mut idle, above_min)) = lent else {
            continue;
        };
        summary.checked += 1;

        let eviction = match stale(inner, &idle.meta, above_min) {
            Some(reason) => Some(reason),
            None => (!inner.is_alive(&mut idle.conn).await).then_some(Eviction::Invalid),
        };

        let doomed = {
            let mut state = inner.state.lock();
            if state.closed || eviction.is_some() {
                state.registry.remove_invalid(id);
                Some(idle.conn)
            } else {
                state.registry.finish_probe(idle);
                None
            }
        };

        match doomed {
            Some(conn) => {
                if let Some(reason) = eviction {
                    tracing::debug!(
                        pool = inner.id,
                        connection = %id,
                        reason = %reason,
                        "evicting idle connection"
                    );
                    summary.evicted += 1;
                }
                inner.available.notify_one();
                inner.factory.close(conn).await;
            }
            None => inner.available.notify_one(),
        }
    }

    if inner.config.refill {
        summary.opened = refill(inner).await;
    }
    summary
}

fn stale<F: ConnectionFactory>(
    inner: &PoolInner<F>,
    meta: &ConnectionMetadata,
    above_min: bool,
) -> Option<Eviction> {
    if inner
        .config
        .max_lifetime
        .is_some_and(|lifetime| meta.is_expired(lifetime))
    {
        return Some(Eviction::Expired);
    }
    if above_min
        && inner
            .config
            .idle_timeout
            .is_some_and(|timeout| meta.is_idle_expired(timeout))
    {
        return Some(Eviction::IdleTimeout);
    }
    None
}

/// Open connections until the pool is back at `min_connections`.
///
/// Never exceeds `max_connections`. Returns how many were opened.
async fn refill<F: ConnectionFactory>(inner: &PoolInner<F>) -> u32 {
    let min = inner.config.min_connections;
    let deficit = {
        let state = inner.state.lock();
        if state.closed {
            0
        } else {
            min.saturating_sub(state.registry.size() + state.pending)
        }
    };

    let mut opened = 0;
    for _ in 0..deficit {
        let reservation = {
            let mut state = inner.state.lock();
            if state.closed
                || !state.has_capacity()
                || state.registry.size() + state.pending >= min
            {
                break;
            }
            Reservation::reserve(inner, &mut *state, false)
        };

        let conn = match inner.factory.open(&inner.config).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(pool = inner.id, error = %e, "failed to open replacement connection");
                continue;
            }
        };

        let rejected = {
            let mut state = inner.state.lock();
            reservation.settle(&mut *state);
            if state.closed {
                Some(conn)
            } else {
                state.registry.add_new(conn).err()
            }
        };

        match rejected {
            None => {
                opened += 1;
                inner.available.notify_one();
            }
            Some(conn) => inner.factory.close(conn).await,
        }
    }
    opened
}
