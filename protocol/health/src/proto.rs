//! Minimal protobuf encoding for the `grpc.health.v1` messages.
//!
//! Both messages have a single scalar field, so a hand-written codec is
//! all that is needed. Unknown fields are skipped on decode.

use bytes::{BufMut, Bytes, BytesMut};
use grpc::{MarshalError, Marshaller, SerializationContext};

const WIRE_TYPE_VARINT: u8 = 0;
const WIRE_TYPE_FIXED64: u8 = 1;
const WIRE_TYPE_LEN: u8 = 2;
const WIRE_TYPE_FIXED32: u8 = 5;

/// `HealthCheckResponse.ServingStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ServingStatus {
    #[default]
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    /// Only reported by `Watch`.
    ServiceUnknown = 3,
}

impl ServingStatus {
    fn from_u64(value: u64) -> Self {
        match value {
            1 => ServingStatus::Serving,
            2 => ServingStatus::NotServing,
            3 => ServingStatus::ServiceUnknown,
            _ => ServingStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckRequest {
    /// Empty for the overall server health.
    pub service: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, MarshalError> {
    let mut result = 0u64;
    for shift in (0..64).step_by(7) {
        let Some((&byte, rest)) = buf.split_first() else {
            return Err(MarshalError::new("truncated varint"));
        };
        *buf = rest;
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(MarshalError::new("varint overflow"))
}

fn get_length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], MarshalError> {
    let len = get_varint(buf)? as usize;
    if buf.len() < len {
        return Err(MarshalError::new("truncated length-delimited field"));
    }
    let (data, rest) = buf.split_at(len);
    *buf = rest;
    Ok(data)
}

fn skip_field(wire_type: u8, buf: &mut &[u8]) -> Result<(), MarshalError> {
    let width = match wire_type {
        WIRE_TYPE_VARINT => return get_varint(buf).map(drop),
        WIRE_TYPE_LEN => return get_length_delimited(buf).map(drop),
        WIRE_TYPE_FIXED64 => 8,
        WIRE_TYPE_FIXED32 => 4,
        other => return Err(MarshalError::new(format!("unsupported wire type {other}"))),
    };
    if buf.len() < width {
        return Err(MarshalError::new("truncated fixed-width field"));
    }
    *buf = &buf[width..];
    Ok(())
}

/// Walk the fields of a message, handing each (field, wire type) to `f`.
fn for_each_field(
    mut buf: &[u8],
    mut f: impl FnMut(u32, u8, &mut &[u8]) -> Result<bool, MarshalError>,
) -> Result<(), MarshalError> {
    while !buf.is_empty() {
        let tag = get_varint(&mut buf)?;
        let (field, wire_type) = ((tag >> 3) as u32, (tag & 0x07) as u8);
        if !f(field, wire_type, &mut buf)? {
            skip_field(wire_type, &mut buf)?;
        }
    }
    Ok(())
}

impl HealthCheckRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        if !self.service.is_empty() {
            put_varint(buf, (1 << 3) | WIRE_TYPE_LEN as u64);
            put_varint(buf, self.service.len() as u64);
            buf.put_slice(self.service.as_bytes());
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MarshalError> {
        let mut request = HealthCheckRequest::default();
        for_each_field(payload, |field, wire_type, buf| {
            if field != 1 || wire_type != WIRE_TYPE_LEN {
                return Ok(false);
            }
            let data = get_length_delimited(buf)?;
            request.service = std::str::from_utf8(data)
                .map_err(|e| MarshalError::new(format!("service is not UTF-8: {e}")))?
                .to_string();
            Ok(true)
        })?;
        Ok(request)
    }
}

impl HealthCheckResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        if self.status != ServingStatus::Unknown {
            put_varint(buf, (1 << 3) | WIRE_TYPE_VARINT as u64);
            put_varint(buf, self.status as u64);
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MarshalError> {
        let mut response = HealthCheckResponse::default();
        for_each_field(payload, |field, wire_type, buf| {
            if field != 1 || wire_type != WIRE_TYPE_VARINT {
                return Ok(false);
            }
            response.status = ServingStatus::from_u64(get_varint(buf)?);
            Ok(true)
        })?;
        Ok(response)
    }
}

fn write_with<T>(encode: fn(&T, &mut BytesMut)) -> impl Fn(&T, &mut SerializationContext) -> Result<(), MarshalError> {
    move |message, ctx| {
        encode(message, ctx.buffer_writer());
        ctx.complete();
        Ok(())
    }
}

pub(crate) fn request_marshaller() -> Marshaller<HealthCheckRequest> {
    Marshaller::contextual(write_with(HealthCheckRequest::encode), |payload: Bytes| {
        HealthCheckRequest::decode(&payload)
    })
}

pub(crate) fn response_marshaller() -> Marshaller<HealthCheckResponse> {
    Marshaller::contextual(write_with(HealthCheckResponse::encode), |payload: Bytes| {
        HealthCheckResponse::decode(&payload)
    })
}
