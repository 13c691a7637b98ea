//! ASCII wire codec.
//!
//! The supply speaks untyped ASCII with no terminators: a set command is the
//! template with its [`VALUE_MARKER`] replaced, a query is a fixed string
//! ending in [`QUERY_MARKER`], and a reply is whatever bytes arrive during the
//! settle window. Decoding is therefore driven by the property's declared
//! [`ValueKind`], never by the shape of the reply.
//!
//! Decode fallbacks keep the mirror alive: a garbled status byte or an
//! unparseable number returns the previous value instead of an error.

use crate::error::{PsuError, PsuResult};
use crate::property::{StatusRecord, Value, ValueKind, QUERY_MARKER, STATUS_QUERY, VALUE_MARKER};

/// Separator between a set command and its value (`VSET1:12.50`).
const VALUE_SEPARATOR: char = ':';

/// Substitute `value` into a set template.
///
/// Flags are written as `0`/`1`; decimals with `decimals` places.
pub fn encode_set(template: &str, value: &Value, decimals: usize) -> PsuResult<String> {
    if template.matches(VALUE_MARKER).count() != 1 {
        return Err(PsuError::decode(
            template,
            format!("set template must contain exactly one '{}'", VALUE_MARKER),
        ));
    }

    let formatted = match value {
        Value::Flag(b) => i32::from(*b).to_string(),
        Value::Decimal(v) => format!("{:.*}", decimals, v),
        other => {
            return Err(PsuError::decode(
                template,
                format!("cannot encode a {} value", other.kind()),
            ))
        }
    };

    Ok(template.replacen(VALUE_MARKER, &formatted, 1))
}

/// Query commands go out unchanged.
pub fn encode_get(template: &str) -> &str {
    template
}

/// Interpret the reply to `command` as a value of `kind`.
pub fn decode_reply(
    command: &str,
    raw: &[u8],
    previous: &Value,
    kind: ValueKind,
) -> PsuResult<Value> {
    if !command.ends_with(QUERY_MARKER) {
        return decode_command_value(command, kind);
    }

    if command == STATUS_QUERY || kind == ValueKind::Status {
        return Ok(decode_status(raw, previous));
    }

    let text = latin1(raw);
    if kind == ValueKind::Text {
        return Ok(Value::Text(text));
    }

    // An empty reply reads as zero.
    let text = if text.is_empty() { "0".to_string() } else { text };
    match text.trim().parse::<f64>() {
        Ok(number) => match kind {
            ValueKind::Flag => Ok(Value::Flag(number != 0.0)),
            _ => Ok(Value::Decimal(number)),
        },
        // numeric truthiness of whatever number the reply starts with; none reads as off
        Err(_) if kind == ValueKind::Flag => Ok(Value::Flag(
            leading_number(text.trim()).is_some_and(|n| n != 0.0),
        )),
        Err(e) => previous.clone().coerce(kind).ok_or_else(|| {
            PsuError::decode(command, format!("'{}' is not a number: {}", text, e))
        }),
    }
}

/// The longest numeric prefix of `text`, e.g. `1` for `1OK`.
fn leading_number(text: &str) -> Option<f64> {
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.')))
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

/// Decode a one-byte status reply, keeping `previous` if the reply is not exactly one byte.
pub fn decode_status(raw: &[u8], previous: &Value) -> Value {
    match raw {
        [byte] => Value::Status(StatusRecord::from_byte(*byte)),
        _ => match previous {
            Value::Status(s) => Value::Status(*s),
            _ => Value::Status(StatusRecord::default()),
        },
    }
}

/// Effective value of a non-query command, read from the command itself.
///
/// `VSET1:12.50` yields the part after the separator, `OUT1` its trailing digit.
pub fn decode_command_value(command: &str, kind: ValueKind) -> PsuResult<Value> {
    let number = if let Some((_, value)) = command.split_once(VALUE_SEPARATOR) {
        value
            .trim()
            .parse::<f64>()
            .map_err(|e| PsuError::decode(command, e.to_string()))?
    } else {
        command
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .map(f64::from)
            .ok_or_else(|| PsuError::decode(command, "no trailing digit"))?
    };

    match kind {
        ValueKind::Flag => Ok(Value::Flag(number != 0.0)),
        ValueKind::Decimal => Ok(Value::Decimal(number)),
        other => Err(PsuError::decode(
            command,
            format!("a set command cannot carry a {} value", other),
        )),
    }
}

/// Each received byte is one 8-bit character.
fn latin1(raw: &[u8]) -> String {
    raw.iter().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_set_formats_by_kind() {
        assert_eq!(encode_set("OUT+", &Value::Flag(true), 0).unwrap(), "OUT1");
        assert_eq!(encode_set("BEEP+", &Value::Flag(false), 0).unwrap(), "BEEP0");
        assert_eq!(
            encode_set("VSET1:+", &Value::Decimal(12.5), 2).unwrap(),
            "VSET1:12.50"
        );
        assert_eq!(
            encode_set("ISET1:+", &Value::Decimal(1.2), 3).unwrap(),
            "ISET1:1.200"
        );
    }

    #[test]
    fn encode_set_rejects_bad_templates_and_kinds() {
        assert!(encode_set("VSET1:", &Value::Decimal(1.0), 2).is_err());
        assert!(encode_set("++", &Value::Decimal(1.0), 2).is_err());
        assert!(encode_set("OUT+", &Value::Text("on".into()), 0).is_err());
    }

    #[test]
    fn encode_get_is_identity() {
        assert_eq!(encode_get("VOUT1?"), "VOUT1?");
    }

    #[test]
    fn flag_commands_decode_back_to_the_same_flag() {
        for template in ["OUT+", "OVP+", "OCP+", "BEEP+"] {
            for flag in [true, false] {
                let cmd = encode_set(template, &Value::Flag(flag), 0).unwrap();
                let decoded =
                    decode_reply(&cmd, b"garbage", &Value::Flag(!flag), ValueKind::Flag).unwrap();
                assert_eq!(decoded, Value::Flag(flag), "{}", cmd);
            }
        }
    }

    #[test]
    fn set_command_with_separator_decodes_value() {
        let v = decode_reply("VSET1:12.50", b"", &Value::Decimal(0.0), ValueKind::Decimal).unwrap();
        assert_eq!(v, Value::Decimal(12.5));
    }

    #[test]
    fn empty_numeric_reply_is_zero() {
        let v = decode_reply("VOUT1?", b"", &Value::Decimal(3.3), ValueKind::Decimal).unwrap();
        assert_eq!(v, Value::Decimal(0.0));

        let v = decode_reply("OUT?", b"", &Value::Flag(true), ValueKind::Flag).unwrap();
        assert_eq!(v, Value::Flag(false));
    }

    #[test]
    fn numeric_reply_parses() {
        let v = decode_reply("VOUT1?", b"05.01", &Value::Decimal(0.0), ValueKind::Decimal).unwrap();
        assert_eq!(v, Value::Decimal(5.01));

        let v = decode_reply("OUT?", b"1", &Value::Flag(false), ValueKind::Flag).unwrap();
        assert_eq!(v, Value::Flag(true));
    }

    #[test]
    fn unparseable_numeric_keeps_previous() {
        let v = decode_reply("VOUT1?", b"\xff\x01", &Value::Decimal(4.2), ValueKind::Decimal)
            .unwrap();
        assert_eq!(v, Value::Decimal(4.2));
    }

    #[test]
    fn unparseable_flag_uses_numeric_truthiness() {
        let v = decode_reply("OUT?", b"on", &Value::Flag(true), ValueKind::Flag).unwrap();
        assert_eq!(v, Value::Flag(false));

        let v = decode_reply("OUT?", b"1OK", &Value::Flag(false), ValueKind::Flag).unwrap();
        assert_eq!(v, Value::Flag(true));

        let v = decode_reply("OUT?", b"0\x00", &Value::Flag(true), ValueKind::Flag).unwrap();
        assert_eq!(v, Value::Flag(false));
    }

    #[test]
    fn unparseable_numeric_without_fallback_is_a_decode_error() {
        let err = decode_reply("VOUT1?", b"junk", &Value::Text("x".into()), ValueKind::Decimal)
            .unwrap_err();
        assert!(matches!(err, PsuError::Decode { .. }));
    }

    #[test]
    fn text_reply_is_verbatim() {
        let unknown = Value::Text("------".into());
        let v = decode_reply("*IDN?", b"KORAD KD3005P V2.0", &unknown, ValueKind::Text).unwrap();
        assert_eq!(v, Value::Text("KORAD KD3005P V2.0".into()));

        let v = decode_reply("*IDN?", b"", &Value::Text("------".into()), ValueKind::Text).unwrap();
        assert_eq!(v, Value::Text(String::new()));
    }

    #[test]
    fn single_status_bits_set_exactly_one_flag() {
        let bits = [
            StatusRecord::CONSTANT_CURRENT_BIT,
            StatusRecord::OUTPUT_BIT,
            StatusRecord::CONSTANT_VOLTAGE_BIT,
            StatusRecord::BEEP_BIT,
            StatusRecord::KEY_LOCK_BIT,
        ];
        for bit in bits {
            let previous = Value::Status(Default::default());
            let v = decode_reply(STATUS_QUERY, &[1 << bit], &previous, ValueKind::Status).unwrap();
            let s = v.as_status().unwrap();
            let flags = [
                s.constant_current,
                s.output_enabled,
                s.constant_voltage,
                s.beep_enabled,
                s.key_locked,
            ];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1, "bit {}", bit);
            assert_eq!(s.to_byte(), 1 << bit);
        }
    }

    #[test]
    fn unreadable_status_keeps_previous() {
        let previous = Value::Status(StatusRecord {
            output_enabled: true,
            constant_voltage: true,
            ..Default::default()
        });
        for raw in [&b""[..], &b"\x01\x02"[..]] {
            let v = decode_reply(STATUS_QUERY, raw, &previous, ValueKind::Status).unwrap();
            assert_eq!(v, previous);
        }
    }
}
