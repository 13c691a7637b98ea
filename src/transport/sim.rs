//! Simulated bench supply for testing without hardware
//!
//! This module emulates a single-channel KORAD-style supply on the far end of
//! a `tokio::io::duplex` pipe. It provides:
//! - Replies to every query of the ASCII command set after a configurable delay
//! - A resistive load model (constant-voltage vs constant-current regulation)
//! - The one-byte STATUS? bitfield
//! - Controllable fault injection (garbled status, silence)
//! - A timestamped command log for test verification
//!
//! The supply has no command terminator, so each burst read from the pipe is
//! handled as one command.

use super::DynSerial;
use crate::property::StatusRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Identification string returned for `*IDN?`.
pub const SIM_IDENTITY: &str = "KORAD KD3005P V2.0 (simulated)";

/// Front-panel state of the simulated supply.
#[derive(Debug, Clone, PartialEq)]
pub struct SupplyState {
    pub set_voltage: f64,
    pub set_current: f64,
    pub output: bool,
    pub ovp: bool,
    pub ocp: bool,
    pub beep: bool,
    pub key_locked: bool,
    /// Load attached to the terminals, in ohms.
    pub load_ohms: f64,
}

impl Default for SupplyState {
    fn default() -> Self {
        Self {
            set_voltage: 5.0,
            set_current: 1.0,
            output: false,
            ovp: false,
            ocp: false,
            beep: true,
            key_locked: false,
            load_ohms: 10.0,
        }
    }
}

impl SupplyState {
    /// True when the load would draw more than the current limit.
    fn current_limited(&self) -> bool {
        self.output && self.set_voltage / self.load_ohms > self.set_current
    }

    pub fn actual_voltage(&self) -> f64 {
        match (self.output, self.current_limited()) {
            (false, _) => 0.0,
            (true, true) => self.set_current * self.load_ohms,
            (true, false) => self.set_voltage,
        }
    }

    pub fn actual_current(&self) -> f64 {
        match (self.output, self.current_limited()) {
            (false, _) => 0.0,
            (true, true) => self.set_current,
            (true, false) => self.set_voltage / self.load_ohms,
        }
    }

    pub fn status(&self) -> StatusRecord {
        let cc = self.current_limited();
        StatusRecord {
            constant_current: cc,
            output_enabled: self.output,
            constant_voltage: self.output && !cc,
            beep_enabled: self.beep,
            key_locked: self.key_locked,
        }
    }
}

/// One command as seen by the simulated supply.
#[derive(Debug, Clone)]
pub struct LoggedCommand {
    pub at: Instant,
    pub command: String,
}

/// Handle to a running simulated supply.
///
/// # Example
///
/// ```no_run
/// use rust_psu::transport::sim::SimulatedSupply;
///
/// # async fn example() {
/// let (supply, link) = SimulatedSupply::spawn();
/// // attach `link` to a session, then inspect `supply.state()` / `supply.commands()`
/// # }
/// ```
#[derive(Clone)]
pub struct SimulatedSupply {
    state: Arc<Mutex<SupplyState>>,
    reply_delay: Arc<Mutex<Duration>>,
    garble_status: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<LoggedCommand>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SimulatedSupply {
    /// Start a supply with default front-panel state and return the host end of its link.
    pub fn spawn() -> (Self, DynSerial) {
        Self::spawn_with(SupplyState::default())
    }

    pub fn spawn_with(state: SupplyState) -> (Self, DynSerial) {
        let (host, device) = tokio::io::duplex(256);
        let supply = Self {
            state: Arc::new(Mutex::new(state)),
            reply_delay: Arc::new(Mutex::new(Duration::from_millis(5))),
            garble_status: Arc::new(AtomicBool::new(false)),
            silent: Arc::new(AtomicBool::new(false)),
            log: Arc::new(Mutex::new(Vec::new())),
            task: Arc::new(Mutex::new(None)),
        };
        let handle = tokio::spawn(supply.clone().serve(device));
        *supply.task.lock() = Some(handle);
        (supply, Box::new(host))
    }

    /// Delay before a reply is written back.
    pub fn with_reply_delay(self, delay: Duration) -> Self {
        *self.reply_delay.lock() = delay;
        self
    }

    /// Answer the next status queries with two bytes instead of one.
    pub fn set_garbled_status(&self, garbled: bool) {
        self.garble_status.store(garbled, Ordering::SeqCst);
    }

    /// Stop answering queries (set commands are still applied).
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn state(&self) -> SupplyState {
        self.state.lock().clone()
    }

    /// Change the front-panel state directly, as a user turning knobs would.
    pub fn update(&self, f: impl FnOnce(&mut SupplyState)) {
        f(&mut self.state.lock());
    }

    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.log.lock().clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.log.lock().iter().map(|c| c.command.clone()).collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Drop the device end of the link, as if the cable were pulled.
    pub fn disconnect(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn serve(self, mut device: DuplexStream) {
        let mut buf = [0u8; 128];
        loop {
            let n = match device.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let command = String::from_utf8_lossy(&buf[..n]).to_string();
            self.log.lock().push(LoggedCommand {
                at: Instant::now(),
                command: command.clone(),
            });

            let Some(reply) = self.handle(&command) else {
                continue;
            };
            if self.silent.load(Ordering::SeqCst) {
                continue;
            }

            let delay = *self.reply_delay.lock();
            tokio::time::sleep(delay).await;
            trace!(%command, bytes = reply.len(), "Simulated supply replying");
            if device.write_all(&reply).await.is_err() {
                break;
            }
        }
        debug!("Simulated supply stopped");
    }

    /// Apply a command, returning the reply bytes for queries.
    fn handle(&self, command: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let text = |s: String| Some(s.into_bytes());

        match command {
            "*IDN?" => text(SIM_IDENTITY.to_string()),
            "VSET1?" => text(format!("{:05.2}", state.set_voltage)),
            "ISET1?" => text(format!("{:.3}", state.set_current)),
            "VOUT1?" => text(format!("{:05.2}", state.actual_voltage())),
            "IOUT1?" => text(format!("{:.3}", state.actual_current())),
            "STATUS?" => {
                let byte = state.status().to_byte();
                if self.garble_status.load(Ordering::SeqCst) {
                    Some(vec![byte, b'?'])
                } else {
                    Some(vec![byte])
                }
            }
            _ => {
                if let Some(v) = command.strip_prefix("VSET1:") {
                    if let Ok(v) = v.parse() {
                        state.set_voltage = v;
                    }
                } else if let Some(i) = command.strip_prefix("ISET1:") {
                    if let Ok(i) = i.parse() {
                        state.set_current = i;
                    }
                } else if let Some(flag) = command.strip_prefix("OUT") {
                    state.output = flag == "1";
                } else if let Some(flag) = command.strip_prefix("OVP") {
                    state.ovp = flag == "1";
                } else if let Some(flag) = command.strip_prefix("OCP") {
                    state.ocp = flag == "1";
                } else if let Some(flag) = command.strip_prefix("BEEP") {
                    state.beep = flag == "1";
                } else {
                    debug!(%command, "Simulated supply ignoring unknown command");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn query(link: &mut DynSerial, command: &str) -> Vec<u8> {
        link.write_all(command.as_bytes()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = link.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn answers_queries_and_applies_sets() {
        let (supply, mut link) = SimulatedSupply::spawn();

        assert_eq!(query(&mut link, "VSET1?").await, b"05.00");

        link.write_all(b"VSET1:12.50").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(supply.state().set_voltage, 12.5);
        assert_eq!(query(&mut link, "VSET1?").await, b"12.50");

        assert_eq!(
            supply.command_names(),
            vec!["VSET1?", "VSET1:12.50", "VSET1?"]
        );
    }

    #[tokio::test]
    async fn status_byte_reflects_regulation_mode() {
        let (supply, mut link) = SimulatedSupply::spawn();
        link.write_all(b"OUT1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 5 V into 10 ohm with a 1 A limit: constant voltage
        let raw = query(&mut link, "STATUS?").await;
        let status = StatusRecord::from_byte(raw[0]);
        assert!(status.output_enabled && status.constant_voltage && !status.constant_current);

        // 2 ohm would draw 2.5 A: constant current at 1 A / 2 V
        supply.update(|s| s.load_ohms = 2.0);
        let raw = query(&mut link, "STATUS?").await;
        assert!(StatusRecord::from_byte(raw[0]).constant_current);
        assert_eq!(query(&mut link, "VOUT1?").await, b"02.00");
        assert_eq!(query(&mut link, "IOUT1?").await, b"1.000");
    }

    #[test]
    fn output_off_reads_zero() {
        let state = SupplyState::default();
        assert_eq!(state.actual_voltage(), 0.0);
        assert_eq!(state.actual_current(), 0.0);
        assert!(!state.status().constant_voltage);
    }
}
