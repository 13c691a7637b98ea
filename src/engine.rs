//! Command engine: one command in flight at a time.
//!
//! Every transport write passes through a single gate. Holding the gate is
//! the `Busy` state: the engine clears the inbound buffer, writes the
//! encoded command, waits the property's settle time and takes whatever
//! accumulated as the reply. Waiters queue on a `tokio::sync::Mutex`, which
//! hands the gate over in FIFO order.
//!
//! Every wait is bounded: acquiring the gate by `gate_timeout`, the write by
//! `write_timeout`, and the reply window by the property's settle time. A
//! query whose window closes empty may keep listening for `reply_grace`, so a
//! reply that lands right on the settle boundary is still taken as the reply.

use crate::codec;
use crate::error::{PsuError, PsuResult};
use crate::property::{PropertyId, PropertyStore, Value};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Gate state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Busy,
}

/// Timeouts applied by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Longest a command waits for the gate before failing with `Busy`.
    pub gate_timeout: Duration,
    /// Longest a single transport write may take.
    pub write_timeout: Duration,
    /// Extra listening time for a query that has received nothing when its settle time ends.
    pub reply_grace: Duration,
}

/// Inbound buffer sampling period while a reply is still arriving.
const REPLY_POLL: Duration = Duration::from_millis(5);

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gate_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(500),
            reply_grace: Duration::from_millis(50),
        }
    }
}

/// Serialises all device traffic and keeps the property store in step with it.
pub struct CommandEngine {
    transport: Arc<Transport>,
    store: Arc<PropertyStore>,
    gate: Mutex<()>,
    busy: AtomicBool,
    settings: EngineSettings,
}

/// Marks the engine busy for as long as the gate is held.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    _gate: MutexGuard<'a, ()>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl CommandEngine {
    pub fn new(
        transport: Arc<Transport>,
        store: Arc<PropertyStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            transport,
            store,
            gate: Mutex::new(()),
            busy: AtomicBool::new(false),
            settings,
        }
    }

    pub fn state(&self) -> EngineState {
        if self.busy.load(Ordering::SeqCst) {
            EngineState::Busy
        } else {
            EngineState::Idle
        }
    }

    pub fn store(&self) -> &Arc<PropertyStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    async fn acquire(&self) -> PsuResult<BusyGuard<'_>> {
        let gate = tokio::time::timeout(self.settings.gate_timeout, self.gate.lock())
            .await
            .map_err(|_| PsuError::Busy(self.settings.gate_timeout))?;
        self.busy.store(true, Ordering::SeqCst);
        Ok(BusyGuard {
            busy: &self.busy,
            _gate: gate,
        })
    }

    /// Send `command` and collect the bytes received during `settle`.
    ///
    /// If nothing arrived by then, keep listening for up to `grace` and stop
    /// once the reply has gone quiet for one sampling period.
    async fn send(&self, command: &str, settle: Duration, grace: Duration) -> PsuResult<Vec<u8>> {
        let _busy = self.acquire().await?;

        self.transport.clear_inbound();
        self.transport
            .write(command.as_bytes(), self.settings.write_timeout)
            .await?;
        tokio::time::sleep(settle).await;

        let mut seen = self.transport.inbound_len();
        if seen == 0 && !grace.is_zero() {
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                tokio::time::sleep(REPLY_POLL).await;
                let len = self.transport.inbound_len();
                if len > 0 && len == seen {
                    break;
                }
                seen = len;
            }
        }
        let reply = self.transport.take_inbound();

        trace!(
            %command,
            settle_ms = settle.as_millis() as u64,
            bytes = reply.len(),
            "Command complete"
        );
        Ok(reply)
    }

    /// Query the device for `id` and record the decoded value.
    #[instrument(skip(self), fields(property = %id))]
    pub async fn get(&self, id: PropertyId) -> PsuResult<Value> {
        let def = id.def();
        let template = def.get_command.ok_or(PsuError::NoGetter(id))?;
        let command = codec::encode_get(template);

        let reply = self
            .send(command, def.settle_time, self.settings.reply_grace)
            .await?;
        let previous = self.store.get(id);
        let value = codec::decode_reply(command, &reply, &previous, def.kind)?;

        debug!(value = %value, "Refreshed from device");
        self.store.record(id, value.clone());
        Ok(value)
    }

    /// Push the locally held value of `id` to the device.
    ///
    /// Transport failures and an expired gate wait are logged and swallowed:
    /// the local value stays as-is and the next sync cycle pushes it again.
    /// Only protocol misuse is returned as an error.
    #[instrument(skip(self), fields(property = %id))]
    pub async fn set(&self, id: PropertyId) -> PsuResult<Value> {
        let def = id.def();
        let template = def.set_command.ok_or(PsuError::NoSetter(id))?;
        let value = self.store.get(id);
        let command = codec::encode_set(template, &value, def.decimals)?;

        match self.send(&command, def.settle_time, Duration::ZERO).await {
            Ok(_) => debug!(%command, "Pushed to device"),
            Err(e) if e.is_transport() => debug!(%command, error = %e, "Push skipped"),
            Err(e @ PsuError::Busy(_)) => warn!(%command, error = %e, "Push skipped"),
            Err(e) => return Err(e),
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimulatedSupply;
    use tracing_test::traced_test;

    fn engine() -> CommandEngine {
        CommandEngine::new(
            Arc::new(Transport::new()),
            Arc::new(PropertyStore::new()),
            EngineSettings::default(),
        )
    }

    #[tokio::test]
    async fn get_without_getter_fails() {
        let engine = engine();
        let err = engine.get(PropertyId::Output).await.unwrap_err();
        assert!(matches!(err, PsuError::NoGetter(PropertyId::Output)));
    }

    #[tokio::test]
    async fn set_without_setter_fails() {
        let engine = engine();
        let err = engine.set(PropertyId::ActualVoltage).await.unwrap_err();
        assert!(matches!(err, PsuError::NoSetter(PropertyId::ActualVoltage)));
    }

    #[tokio::test]
    async fn get_while_offline_surfaces_transport_error() {
        let engine = engine();
        let err = engine.get(PropertyId::SetVoltage).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn set_while_offline_keeps_local_value() {
        let engine = engine();
        engine.store().record(PropertyId::SetVoltage, Value::Decimal(7.5));
        let value = engine.set(PropertyId::SetVoltage).await.unwrap();
        assert_eq!(value, Value::Decimal(7.5));
        assert_eq!(engine.store().get(PropertyId::SetVoltage), Value::Decimal(7.5));
    }

    #[tokio::test]
    #[traced_test]
    async fn offline_push_is_logged_and_skipped() {
        let engine = engine();
        engine.set(PropertyId::Output).await.unwrap();
        assert!(logs_contain("Push skipped"));
        assert!(logs_contain("OUT0"));
    }

    #[tokio::test]
    async fn get_records_decoded_reply() {
        let engine = engine();
        let (_supply, link) = SimulatedSupply::spawn();
        engine.transport().attach("sim", link).await;

        let value = engine.get(PropertyId::SetVoltage).await.unwrap();
        assert_eq!(value, Value::Decimal(5.0));
        assert_eq!(engine.store().get(PropertyId::SetVoltage), Value::Decimal(5.0));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn concurrent_commands_never_overlap() {
        let engine = Arc::new(engine());
        let (supply, link) = SimulatedSupply::spawn();
        engine.transport().attach("sim", link).await;

        let a = engine.clone();
        let b = engine.clone();
        let (ra, rb) = tokio::join!(
            async move { a.get(PropertyId::SetVoltage).await },
            async move { b.set(PropertyId::Output).await },
        );
        ra.unwrap();
        rb.unwrap();

        let log = supply.commands();
        assert_eq!(log.len(), 2);
        let first_settle = if log[0].command == "VSET1?" {
            PropertyId::SetVoltage.def().settle_time
        } else {
            PropertyId::Output.def().settle_time
        };
        assert!(log[1].at.duration_since(log[0].at) >= first_settle);
    }
}
