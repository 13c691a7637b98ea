//! Property model and the in-memory mirror of the instrument.
//!
//! Every controllable or observable quantity of the supply is a [`PropertyId`].
//! Its wire commands, settle time and value kind live in a static
//! [`PropertyDef`] table and cannot change at runtime; only the mirrored
//! [`Value`] is mutable, and only through the crate's command path.
//!
//! The [`PropertyStore`] publishes a revision counter over a
//! `tokio::sync::watch` channel so renderers can wait for changes instead of
//! polling the mirror.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;

/// Marker substituted by the value in a set template (`VSET1:+`).
pub const VALUE_MARKER: char = '+';

/// Trailing marker of every query command (`VSET1?`).
pub const QUERY_MARKER: char = '?';

/// The dedicated status query.
pub const STATUS_QUERY: &str = "STATUS?";

/// Stable identifier of one instrument quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyId {
    Identity,
    SetVoltage,
    SetCurrent,
    ActualVoltage,
    ActualCurrent,
    Ovp,
    Ocp,
    Output,
    Beep,
    Status,
}

impl PropertyId {
    /// All properties in store order.
    pub const ALL: [PropertyId; 10] = [
        PropertyId::Identity,
        PropertyId::SetVoltage,
        PropertyId::SetCurrent,
        PropertyId::ActualVoltage,
        PropertyId::ActualCurrent,
        PropertyId::Ovp,
        PropertyId::Ocp,
        PropertyId::Output,
        PropertyId::Beep,
        PropertyId::Status,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PropertyId::Identity => "identity",
            PropertyId::SetVoltage => "set_voltage",
            PropertyId::SetCurrent => "set_current",
            PropertyId::ActualVoltage => "actual_voltage",
            PropertyId::ActualCurrent => "actual_current",
            PropertyId::Ovp => "ovp",
            PropertyId::Ocp => "ocp",
            PropertyId::Output => "output",
            PropertyId::Beep => "beep",
            PropertyId::Status => "status",
        }
    }

    /// Static definition of this property.
    pub fn def(self) -> &'static PropertyDef {
        &DEFINITIONS[self as usize]
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PropertyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropertyId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| format!("unknown property '{}'", s))
    }
}

/// How the untyped ASCII reply of a property is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Decimal,
    Flag,
    Status,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Decimal => "decimal",
            ValueKind::Flag => "flag",
            ValueKind::Status => "status",
            ValueKind::Text => "text",
        };
        f.write_str(s)
    }
}

/// Decoded one-byte `STATUS?` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub constant_current: bool,
    pub output_enabled: bool,
    pub constant_voltage: bool,
    pub beep_enabled: bool,
    pub key_locked: bool,
}

impl StatusRecord {
    pub const CONSTANT_CURRENT_BIT: u8 = 0;
    pub const OUTPUT_BIT: u8 = 1;
    pub const CONSTANT_VOLTAGE_BIT: u8 = 2;
    pub const BEEP_BIT: u8 = 4;
    pub const KEY_LOCK_BIT: u8 = 5;

    /// Decode the tracked flags from a status byte. Untracked bits are ignored.
    pub fn from_byte(byte: u8) -> Self {
        let bit = |n: u8| byte & (1 << n) != 0;
        Self {
            constant_current: bit(Self::CONSTANT_CURRENT_BIT),
            output_enabled: bit(Self::OUTPUT_BIT),
            constant_voltage: bit(Self::CONSTANT_VOLTAGE_BIT),
            beep_enabled: bit(Self::BEEP_BIT),
            key_locked: bit(Self::KEY_LOCK_BIT),
        }
    }

    /// Inverse of [`StatusRecord::from_byte`] for the tracked flags.
    pub fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        for (set, n) in [
            (self.constant_current, Self::CONSTANT_CURRENT_BIT),
            (self.output_enabled, Self::OUTPUT_BIT),
            (self.constant_voltage, Self::CONSTANT_VOLTAGE_BIT),
            (self.beep_enabled, Self::BEEP_BIT),
            (self.key_locked, Self::KEY_LOCK_BIT),
        ] {
            if set {
                byte |= 1 << n;
            }
        }
        byte
    }
}

/// A mirrored property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Decimal(f64),
    Flag(bool),
    Status(StatusRecord),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Flag(_) => ValueKind::Flag,
            Value::Status(_) => ValueKind::Status,
            Value::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Decimal(v) => Some(*v),
            Value::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Numeric truthiness: flags as-is, decimals when non-zero.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Flag(b) => Some(*b),
            Value::Decimal(v) => Some(*v != 0.0),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<StatusRecord> {
        match self {
            Value::Status(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into `kind`, accepting numeric truthiness for flags and 0/1 for decimals.
    pub fn coerce(self, kind: ValueKind) -> Option<Value> {
        match (kind, self) {
            (ValueKind::Decimal, Value::Decimal(v)) => Some(Value::Decimal(v)),
            (ValueKind::Decimal, Value::Flag(b)) => Some(Value::Decimal(if b { 1.0 } else { 0.0 })),
            (ValueKind::Flag, v @ (Value::Flag(_) | Value::Decimal(_))) => {
                v.as_flag().map(Value::Flag)
            }
            (ValueKind::Status, Value::Status(s)) => Some(Value::Status(s)),
            (ValueKind::Text, Value::Text(s)) => Some(Value::Text(s)),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Decimal(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Flag(b)
    }
}

impl From<StatusRecord> for Value {
    fn from(s: StatusRecord) -> Self {
        Value::Status(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Flag(b) => f.write_str(if *b { "on" } else { "off" }),
            Value::Status(s) => write!(
                f,
                "{}{}{}{}",
                if s.constant_current { "CC" } else if s.constant_voltage { "CV" } else { "--" },
                if s.output_enabled { " OUT" } else { "" },
                if s.beep_enabled { " BEEP" } else { "" },
                if s.key_locked { " LOCK" } else { "" },
            ),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Immutable wire description of a property.
#[derive(Debug)]
pub struct PropertyDef {
    pub id: PropertyId,
    /// Query command; `None` means write-only.
    pub get_command: Option<&'static str>,
    /// Set template containing [`VALUE_MARKER`]; `None` means read-only.
    pub set_command: Option<&'static str>,
    /// Minimum wait after sending before the inbound bytes count as the reply.
    pub settle_time: Duration,
    pub kind: ValueKind,
    /// Decimal places the device expects in a set command.
    pub decimals: usize,
}

impl PropertyDef {
    pub fn is_gettable(&self) -> bool {
        self.get_command.is_some()
    }

    pub fn is_settable(&self) -> bool {
        self.set_command.is_some()
    }

    /// Value held before the first read from the device.
    pub fn default_value(&self) -> Value {
        match self.kind {
            ValueKind::Decimal => Value::Decimal(0.0),
            ValueKind::Flag => Value::Flag(false),
            ValueKind::Status => Value::Status(StatusRecord::default()),
            ValueKind::Text => Value::Text("------".to_string()),
        }
    }
}

const fn def(
    id: PropertyId,
    get_command: Option<&'static str>,
    set_command: Option<&'static str>,
    settle_ms: u64,
    kind: ValueKind,
    decimals: usize,
) -> PropertyDef {
    PropertyDef {
        id,
        get_command,
        set_command,
        settle_time: Duration::from_millis(settle_ms),
        kind,
        decimals,
    }
}

// Indexed by `PropertyId as usize`.
static DEFINITIONS: [PropertyDef; 10] = [
    def(PropertyId::Identity, Some("*IDN?"), None, 90, ValueKind::Text, 0),
    def(PropertyId::SetVoltage, Some("VSET1?"), Some("VSET1:+"), 55, ValueKind::Decimal, 2),
    def(PropertyId::SetCurrent, Some("ISET1?"), Some("ISET1:+"), 55, ValueKind::Decimal, 3),
    def(PropertyId::ActualVoltage, Some("VOUT1?"), None, 55, ValueKind::Decimal, 2),
    def(PropertyId::ActualCurrent, Some("IOUT1?"), None, 55, ValueKind::Decimal, 3),
    def(PropertyId::Ovp, None, Some("OVP+"), 50, ValueKind::Flag, 0),
    def(PropertyId::Ocp, None, Some("OCP+"), 50, ValueKind::Flag, 0),
    def(PropertyId::Output, None, Some("OUT+"), 50, ValueKind::Flag, 0),
    def(PropertyId::Beep, None, Some("BEEP+"), 50, ValueKind::Flag, 0),
    def(PropertyId::Status, Some(STATUS_QUERY), None, 55, ValueKind::Status, 0),
];

/// Ordered, serialisable view of every mirrored value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub revision: u64,
    pub values: Vec<(PropertyId, Value)>,
}

impl Snapshot {
    pub fn get(&self, id: PropertyId) -> Option<&Value> {
        self.values.iter().find(|(p, _)| *p == id).map(|(_, v)| v)
    }
}

/// Authoritative mirror of every instrument property.
///
/// The set of properties is fixed at construction. Reads never touch the
/// device; writes come from the command engine or a session assignment.
pub struct PropertyStore {
    values: RwLock<Vec<Value>>,
    revision: watch::Sender<u64>,
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyStore {
    pub fn new() -> Self {
        let values = PropertyId::ALL.iter().map(|id| id.def().default_value()).collect();
        let (revision, _) = watch::channel(0);
        Self {
            values: RwLock::new(values),
            revision,
        }
    }

    /// Current mirrored value, without contacting the device.
    pub fn get(&self, id: PropertyId) -> Value {
        self.values.read()[id.index()].clone()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver that is notified after every write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        let values = self.values.read();
        Snapshot {
            revision: self.revision(),
            values: PropertyId::ALL
                .iter()
                .map(|id| (*id, values[id.index()].clone()))
                .collect(),
        }
    }

    /// Replace a value. Callers are responsible for passing the property's kind.
    pub(crate) fn record(&self, id: PropertyId, value: Value) {
        debug_assert_eq!(value.kind(), id.def().kind, "kind mismatch for {}", id);
        {
            let mut values = self.values.write();
            values[id.index()] = value;
        }
        self.revision.send_modify(|rev| *rev += 1);
    }
}
