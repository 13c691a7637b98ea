//! Instrument session: the surface UI and automation callers use.
//!
//! A [`PsuSession`] owns exactly one transport, the property store and the
//! poller. Its lifecycle is
//!
//! 1. [`PsuSession::new`] with default values,
//! 2. [`PsuSession::open`] (or [`PsuSession::attach`]) to bind a link,
//! 3. [`PsuSession::init`] for the first full synchronisation,
//! 4. any number of [`PsuSession::assign`], [`PsuSession::refresh`] and polling cycles,
//! 5. [`PsuSession::close`], after which the last known values stay readable.
//!
//! # Example
//!
//! ```no_run
//! use rust_psu::{PropertyId, PsuSession, SessionSettings};
//!
//! # async fn example() -> rust_psu::PsuResult<()> {
//! let session = PsuSession::new(SessionSettings::default());
//! session.open("/dev/ttyACM0", 9600).await?;
//! session.init().await?;
//! session.assign(PropertyId::SetVoltage, 12.0.into()).await?;
//! session.assign(PropertyId::Output, true.into()).await?;
//! println!("{}", session.value(PropertyId::ActualVoltage));
//! session.close().await;
//! # Ok(())
//! # }
//! ```

use crate::engine::{CommandEngine, EngineSettings, EngineState};
use crate::error::{PsuError, PsuResult};
use crate::property::{PropertyId, PropertyStore, Snapshot, Value};
use crate::sync::{self, Poller};
use crate::transport::{self, DynSerial, PortDescriptor, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Timing knobs of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Sleep between polling cycles.
    pub poll_interval: Duration,
    /// Longest `close` and `set_polling(false)` wait for the final cycle.
    pub shutdown_timeout: Duration,
    pub engine: EngineSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            shutdown_timeout: Duration::from_millis(3000),
            engine: EngineSettings::default(),
        }
    }
}

/// One connection to one supply, plus its mirrored state.
pub struct PsuSession {
    engine: Arc<CommandEngine>,
    poller: Poller,
}

impl PsuSession {
    pub fn new(settings: SessionSettings) -> Self {
        let transport = Arc::new(Transport::new());
        let store = Arc::new(PropertyStore::new());
        Self {
            engine: Arc::new(CommandEngine::new(transport, store, settings.engine)),
            poller: Poller::new(settings.poll_interval, settings.shutdown_timeout),
        }
    }

    /// Serial ports a supply could be attached to.
    pub fn list_ports() -> PsuResult<Vec<PortDescriptor>> {
        transport::list_ports()
    }

    /// Open a serial port (8-N-1), releasing any link already open.
    pub async fn open(&self, port_name: &str, baud_rate: u32) -> PsuResult<()> {
        self.engine.transport().open(port_name, baud_rate).await
    }

    /// Bind an already-open stream, e.g. a simulated supply.
    pub async fn attach(&self, name: &str, link: DynSerial) {
        self.engine.transport().attach(name, link).await;
        info!(link = name, "Link attached");
    }

    /// First full synchronisation with the device.
    pub async fn init(&self) -> PsuResult<()> {
        info!("Initial synchronisation");
        sync::full_sync(&self.engine).await
    }

    /// Stop polling, release the link and keep the last known values.
    pub async fn close(&self) {
        self.poller.disable().await;
        self.engine.transport().close().await;
    }

    /// Current mirrored value; never contacts the device.
    pub fn value(&self, id: PropertyId) -> Value {
        self.engine.store().get(id)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.engine.store().snapshot()
    }

    /// Receiver notified after every change to the mirror.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.engine.store().subscribe()
    }

    /// Record a new setpoint and push it to the device.
    ///
    /// While polling is enabled the push is left to the next cycle. A device
    /// that is offline or a gate that stays busy does not make this fail; the
    /// value is kept locally and pushed again by the next cycle.
    pub async fn assign(&self, id: PropertyId, value: Value) -> PsuResult<()> {
        let def = id.def();
        if !def.is_settable() {
            return Err(PsuError::NoSetter(id));
        }
        let value = value.coerce(def.kind).ok_or(PsuError::InvalidValue {
            property: id,
            expected: def.kind,
        })?;

        self.engine.store().record(id, value);
        if self.poller.is_enabled() {
            debug!(property = %id, "Push deferred to next polling cycle");
            return Ok(());
        }
        self.engine.set(id).await.map(|_| ())
    }

    /// Query the device for `id` and return the refreshed value.
    pub async fn refresh(&self, id: PropertyId) -> PsuResult<Value> {
        self.engine.get(id).await
    }

    /// Run one update-when-on cycle now.
    pub async fn update(&self) -> PsuResult<()> {
        sync::update_when_on(&self.engine).await
    }

    /// Enable or disable continuous polling.
    ///
    /// Disabling waits for the in-flight cycle and one final cycle.
    pub async fn set_polling(&self, enabled: bool) {
        if enabled {
            self.poller.enable(self.engine.clone()).await;
        } else {
            self.poller.disable().await;
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_enabled()
    }

    /// True iff a link is open and has not failed.
    pub fn is_online(&self) -> bool {
        self.engine.transport().is_online()
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimulatedSupply;

    #[tokio::test]
    async fn assign_offline_keeps_value() {
        let session = PsuSession::new(SessionSettings::default());
        session.assign(PropertyId::SetCurrent, 0.75.into()).await.unwrap();
        assert_eq!(session.value(PropertyId::SetCurrent), Value::Decimal(0.75));
        assert!(!session.is_online());
    }

    #[tokio::test]
    async fn assign_rejects_read_only_and_wrong_kind() {
        let session = PsuSession::new(SessionSettings::default());
        let err = session
            .assign(PropertyId::ActualVoltage, 1.0.into())
            .await
            .unwrap_err();
        assert!(matches!(err, PsuError::NoSetter(PropertyId::ActualVoltage)));

        let err = session
            .assign(PropertyId::Output, Value::Text("on".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PsuError::InvalidValue { .. }));
        assert_eq!(session.value(PropertyId::Output), Value::Flag(false));
    }

    #[tokio::test]
    async fn assign_coerces_numeric_flags() {
        let session = PsuSession::new(SessionSettings::default());
        session.assign(PropertyId::Output, 1.0.into()).await.unwrap();
        assert_eq!(session.value(PropertyId::Output), Value::Flag(true));
    }

    #[tokio::test]
    async fn close_keeps_values_readable() {
        let session = PsuSession::new(SessionSettings::default());
        let (_supply, link) = SimulatedSupply::spawn();
        session.attach("sim", link).await;
        session.refresh(PropertyId::SetVoltage).await.unwrap();

        session.close().await;
        assert!(!session.is_online());
        assert_eq!(session.value(PropertyId::SetVoltage), Value::Decimal(5.0));
        assert!(session.refresh(PropertyId::SetVoltage).await.unwrap_err().is_transport());
    }
}
