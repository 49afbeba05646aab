//! Event plans
//!
//! Turns `type:value` payload specs and event descriptions from the command
//! line or config file into requests the bridge can create.

use anyhow::{anyhow, bail, Context, Result};
use bps_event::{Payload, PayloadValue, SerializeMode};

use crate::config::EventConfig;

/// One kind of event to create, possibly several times
#[derive(Debug, Clone, PartialEq)]
pub struct EventPlan {
    pub name: String,
    pub domain: i32,
    pub code: u32,
    pub data: Vec<PayloadValue>,
    pub pinned: bool,
    pub fail: bool,
    pub count: usize,
}

impl EventPlan {
    pub fn from_config(config: &EventConfig) -> Result<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("0x{:03X}/0x{:04X}", config.domain, config.code));
        let data = parse_values(&config.data).with_context(|| format!("in event {}", name))?;
        Ok(Self {
            name,
            domain: config.domain,
            code: config.code,
            data,
            pinned: config.pinned,
            fail: config.fail,
            count: config.count,
        })
    }

    /// Build the payload for one instance of this event
    pub fn payload(&self) -> Payload {
        let mut slots = self.data.iter().cloned().map(Some);
        let payload = Payload::from_values(
            slots.next().flatten(),
            slots.next().flatten(),
            slots.next().flatten(),
        );
        if self.pinned {
            payload.with_mode(SerializeMode::Pinned)
        } else {
            payload
        }
    }
}

/// Parse up to three payload specs
pub fn parse_values(specs: &[String]) -> Result<Vec<PayloadValue>> {
    if specs.len() > 3 {
        bail!("an event carries at most 3 data values, got {}", specs.len());
    }
    specs.iter().map(|spec| parse_value(spec)).collect()
}

/// Parse a `type:value` spec such as `i32:7`, `text:hi` or `bytes:0a0b`
pub fn parse_value(spec: &str) -> Result<PayloadValue> {
    let (kind, raw) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("data spec {:?} is not of the form type:value", spec))?;

    let value = match kind.to_ascii_lowercase().as_str() {
        "bool" => PayloadValue::Bool(raw.parse().with_context(|| bad(spec))?),
        "i8" => PayloadValue::I8(parse_int(raw).with_context(|| bad(spec))?),
        "i16" => PayloadValue::I16(parse_int(raw).with_context(|| bad(spec))?),
        "i32" => PayloadValue::I32(parse_int(raw).with_context(|| bad(spec))?),
        "i64" => PayloadValue::I64(parse_int(raw).with_context(|| bad(spec))?),
        "u8" => PayloadValue::U8(parse_int(raw).with_context(|| bad(spec))?),
        "u16" => PayloadValue::U16(parse_int(raw).with_context(|| bad(spec))?),
        "u32" => PayloadValue::U32(parse_int(raw).with_context(|| bad(spec))?),
        "u64" => PayloadValue::U64(parse_int(raw).with_context(|| bad(spec))?),
        "f32" => PayloadValue::F32(raw.parse().with_context(|| bad(spec))?),
        "f64" => PayloadValue::F64(raw.parse().with_context(|| bad(spec))?),
        "char" => {
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => PayloadValue::Char(c),
                _ => bail!("{}: expected exactly one character", bad(spec)),
            }
        }
        "text" | "str" => PayloadValue::Text(raw.to_string()),
        "bytes" => PayloadValue::Bytes(parse_hex(raw).with_context(|| bad(spec))?),
        other => bail!("unknown data type {:?} in {:?}", other, spec),
    };
    Ok(value)
}

fn bad(spec: &str) -> String {
    format!("invalid data spec {:?}", spec)
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer
fn parse_int<T>(raw: &str) -> Result<T>
where
    T: TryFrom<i128>,
{
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16)?,
        None => digits.parse::<i128>()?,
    };
    let value = if negative { -magnitude } else { magnitude };
    T::try_from(value).map_err(|_| anyhow!("{} is out of range", raw))
}

fn parse_hex(raw: &str) -> Result<Vec<u8>> {
    let raw = raw.trim();
    if raw.len() % 2 != 0 {
        bail!("hex string has an odd number of digits");
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            raw.get(i..i + 2)
                .ok_or_else(|| anyhow!("hex string is not ASCII"))
                .and_then(|pair| u8::from_str_radix(pair, 16).map_err(Into::into))
        })
        .collect()
}
