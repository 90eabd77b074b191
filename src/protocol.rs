//! Line-oriented text codec for sensor readings.
//!
//! Two line shapes exist and they are intentionally not symmetric:
//!
//! * uplink (edge device -> collector), produced by [`encode`]:
//!   `LUX <device_id> <sequence> <value>`
//! * capture record, accepted by [`decode`]:
//!   `lux <device_id> <value> <sequence> <timestamp>`
//!
//! The uplink line carries no timestamp and orders sequence before value; the
//! capture record uses a lowercase tag and the opposite order. Decoding an
//! uplink line therefore fails with [`CodecError::MalformedPacket`].

use thiserror::Error;

use crate::models::{Payload, Reading};

const LUX_UPLINK_TAG: &str = "LUX";
const LUX_RECORD_TAG: &str = "lux";
/// Tag plus device, value, sequence and timestamp.
const LUX_RECORD_FIELDS: usize = 5;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("malformed packet ({reason}): {line:?}")]
    MalformedPacket { line: String, reason: &'static str },
    /// Device ids are one wire token: non-empty, no whitespace or control characters.
    #[error("invalid device id {device_id:?}")]
    InvalidDeviceId { device_id: String },
}

impl CodecError {
    fn malformed(line: &str, reason: &'static str) -> Self {
        CodecError::MalformedPacket {
            line: line.to_string(),
            reason,
        }
    }
}

/// Rejects a device id that would not survive the space-separated,
/// newline-framed wire format as a single field.
pub fn check_device_id(device_id: &str) -> Result<(), CodecError> {
    let splits_line = device_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control());
    if device_id.is_empty() || splits_line {
        return Err(CodecError::InvalidDeviceId {
            device_id: device_id.to_string(),
        });
    }
    Ok(())
}

/// Encodes a reading as an uplink line. The caller appends the newline when
/// writing to the wire.
pub fn encode(reading: &Reading) -> String {
    match reading.payload {
        Payload::Lux(value) => format!(
            "{LUX_UPLINK_TAG} {} {} {}",
            reading.device_id,
            reading.sequence,
            format_value(value)
        ),
    }
}

/// Decodes a capture record. Any unknown tag, wrong field count or
/// unparsable field is reported as [`CodecError::MalformedPacket`]; the caller
/// is expected to log and discard the line.
pub fn decode(line: &str) -> Result<Reading, CodecError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(' ').collect();

    match fields[0] {
        LUX_RECORD_TAG => decode_lux(line, &fields),
        _ => Err(CodecError::malformed(line, "unknown packet type")),
    }
}

fn decode_lux(line: &str, fields: &[&str]) -> Result<Reading, CodecError> {
    if fields.len() != LUX_RECORD_FIELDS {
        return Err(CodecError::malformed(line, "unexpected field count"));
    }

    let device_id = fields[1];
    if check_device_id(device_id).is_err() {
        return Err(CodecError::malformed(line, "invalid device id"));
    }
    let value: f64 = fields[2]
        .parse()
        .map_err(|_| CodecError::malformed(line, "invalid lux value"))?;
    let sequence: i64 = fields[3]
        .parse()
        .map_err(|_| CodecError::malformed(line, "invalid sequence"))?;
    let timestamp: i64 = fields[4]
        .parse()
        .map_err(|_| CodecError::malformed(line, "invalid timestamp"))?;

    Ok(Reading::lux(device_id, sequence, value, timestamp))
}

/// Integral values keep one decimal place so `11` goes out as `11.0`.
fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}
