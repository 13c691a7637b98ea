//! Mirror synchronisation: the update-when-on cycle, the initial full sync and
//! the background poller.
//!
//! A cycle pushes the setpoints before reading the actuals back, so a freshly
//! changed setpoint shows up in the very next actual-value read.
//!
//! The [`Poller`] runs cycles on a background task. Its enabled flag lives in
//! a `tokio::sync::watch` channel that the task checks at every cycle boundary;
//! disabling wakes the inter-cycle sleep, lets the in-flight cycle finish and
//! runs one last cycle before the task exits.

use crate::engine::CommandEngine;
use crate::error::{PsuError, PsuResult};
use crate::property::{PropertyId, Value};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Setpoints pushed by every cycle, in order.
pub const CYCLE_PUSHES: [PropertyId; 5] = [
    PropertyId::Output,
    PropertyId::SetVoltage,
    PropertyId::SetCurrent,
    PropertyId::Ocp,
    PropertyId::Ovp,
];

/// Readings refreshed by every cycle, in order, after the pushes.
pub const CYCLE_REFRESHES: [PropertyId; 3] = [
    PropertyId::ActualVoltage,
    PropertyId::ActualCurrent,
    PropertyId::Status,
];

/// Push every setpoint, then refresh every reading.
///
/// All eight commands are attempted in order even if some fail; the first
/// error is returned once the cycle is complete.
pub async fn update_when_on(engine: &CommandEngine) -> PsuResult<()> {
    let mut first_error = None;
    for id in CYCLE_PUSHES {
        if let Err(e) = engine.set(id).await {
            warn!(property = %id, error = %e, "Push failed during cycle");
            first_error.get_or_insert(e);
        }
    }

    for id in CYCLE_REFRESHES {
        if let Err(e) = engine.get(id).await {
            debug!(property = %id, error = %e, "Refresh failed during cycle");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// First synchronisation of a freshly opened session.
///
/// Reads every gettable property, applies the session defaults (beep off,
/// both protections on, output setpoint mirrored from the device) and runs
/// one cycle.
pub async fn full_sync(engine: &CommandEngine) -> PsuResult<()> {
    let gettable: Vec<PropertyId> = PropertyId::ALL
        .into_iter()
        .filter(|id| id.def().is_gettable())
        .collect();

    let results = join_all(gettable.iter().map(|id| engine.get(*id))).await;
    let mut first_error: Option<PsuError> = None;
    for (id, result) in gettable.iter().zip(results) {
        if let Err(e) = result {
            warn!(property = %id, error = %e, "Initial read failed");
            first_error.get_or_insert(e);
        }
    }

    let store = engine.store();
    store.record(PropertyId::Beep, Value::Flag(false));
    if let Err(e) = engine.set(PropertyId::Beep).await {
        first_error.get_or_insert(e);
    }
    store.record(PropertyId::Ocp, Value::Flag(true));
    store.record(PropertyId::Ovp, Value::Flag(true));

    // keep the next cycle from toggling the output the device already has
    if let Some(status) = store.get(PropertyId::Status).as_status() {
        store.record(PropertyId::Output, Value::Flag(status.output_enabled));
    }

    let cycle = update_when_on(engine).await;
    match first_error {
        Some(e) => Err(e),
        None => cycle,
    }
}

/// Background task that keeps the mirror in step while polling is enabled.
pub struct Poller {
    enabled: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
    shutdown_timeout: Duration,
}

impl Poller {
    pub fn new(interval: Duration, shutdown_timeout: Duration) -> Self {
        let (enabled, _) = watch::channel(false);
        Self {
            enabled,
            task: Mutex::new(None),
            interval,
            shutdown_timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling. A no-op while already enabled.
    pub async fn enable(&self, engine: Arc<CommandEngine>) {
        let mut task = self.task.lock().await;
        if self.is_enabled() {
            return;
        }

        self.enabled.send_replace(true);
        info!(interval_ms = self.interval.as_millis() as u64, "Polling enabled");
        *task = Some(tokio::spawn(poll_loop(
            engine,
            self.enabled.subscribe(),
            self.interval,
        )));
    }

    /// Stop polling and wait for the final cycle, bounded by the shutdown timeout.
    pub async fn disable(&self) {
        let mut task = self.task.lock().await;
        self.enabled.send_replace(false);

        if let Some(mut handle) = task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(_) => info!("Polling disabled"),
                Err(_) => {
                    warn!(
                        timeout = ?self.shutdown_timeout,
                        "Polling task did not stop in time; aborting"
                    );
                    handle.abort();
                }
            }
        }
    }
}

async fn poll_loop(
    engine: Arc<CommandEngine>,
    mut enabled: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut cycles: u64 = 0;
    loop {
        if let Err(e) = update_when_on(&engine).await {
            warn!(error = %e, "Polling cycle reported errors");
        }
        cycles += 1;

        if !*enabled.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = enabled.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if !*enabled.borrow_and_update() {
            break;
        }
    }

    // leave the mirror on a complete pass
    if let Err(e) = update_when_on(&engine).await {
        warn!(error = %e, "Final polling cycle reported errors");
    }
    debug!(cycles = cycles + 1, "Polling loop stopped");
}
