//! Lane supervision
//!
//! A lane is every worker of one zone in this process. Workers share the
//! zone's throttle and a close signal; each keeps its own TLS memory.

use std::sync::Arc;

use outlane_common::{Signal, internal};
use tokio::{sync::broadcast, task::JoinSet};

use crate::{
    config::{DeliveryConfig, ZoneConfig},
    error::SenderError,
    sender::{CloseHandle, Sender, Services},
    throttle::ThrottleGate,
};

pub struct Lane {
    zone: Arc<ZoneConfig>,
    senders: Vec<Sender>,
    close: CloseHandle,
}

impl Lane {
    /// Builds `zone.connections` senders for `zone`.
    #[must_use]
    pub fn new(
        zone: Arc<ZoneConfig>,
        config: Arc<DeliveryConfig>,
        services: &Services,
        throttle: Arc<ThrottleGate>,
    ) -> Self {
        let close = CloseHandle::new();
        let senders = (0..zone.connections)
            .map(|_| {
                Sender::new(zone.clone(), config.clone(), services.clone(), throttle.clone())
                    .with_close_handle(close.clone())
            })
            .collect();

        Self {
            zone,
            senders,
            close,
        }
    }

    #[must_use]
    pub fn zone(&self) -> &ZoneConfig {
        &self.zone
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// A handle that closes every worker of this lane.
    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Asks every worker to stop after its current delivery.
    pub fn close(&self) {
        self.close.close();
    }

    /// Runs every worker until the lane is closed or `shutdown` fires.
    ///
    /// # Errors
    ///
    /// The first fatal worker error. The remaining workers are closed and
    /// allowed to finish their current delivery before it is returned.
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), SenderError> {
        let Self {
            zone,
            senders,
            close,
        } = self;

        internal!(
            level = INFO,
            zone = %zone.name,
            workers = senders.len(),
            "Starting lane"
        );

        let mut workers = JoinSet::new();
        for mut sender in senders {
            workers.spawn(async move { sender.run().await });
        }

        let mut failure = None;
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };

                    let result = joined.unwrap_or_else(|err| Err(SenderError::Worker(err.to_string())));
                    if let Err(err) = result {
                        internal!(level = ERROR, zone = %zone.name, "Worker stopped: {err}");
                        if failure.is_none() {
                            close.close();
                            failure = Some(err);
                        }
                    }
                }
                sig = shutdown.recv(), if !close.is_closed() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(zone = %zone.name, "Lane received shutdown signal");
                        }
                        Err(err) => {
                            internal!(level = ERROR, zone = %zone.name, "Lane shutdown channel error: {err}");
                        }
                    }
                    close.close();
                }
            }
        }

        internal!(level = INFO, zone = %zone.name, "Lane stopped");
        failure.map_or(Ok(()), Err)
    }
}
