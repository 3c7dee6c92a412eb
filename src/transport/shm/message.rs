//! Control-channel wire format.
//!
//! Both sides share one host, so fields travel in native byte order.
//! Every message is a `u32` total length prefix followed by a one-byte
//! kind tag and the kind's fields; strings are `u32` length prefixed
//! UTF-8. Each message is acknowledged with a bare `u32` status, zero
//! for success.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StreamError};
use crate::sri::StreamDescriptor;
use crate::types::{PrecisionTime, Value};

use super::heap::MemoryRef;

const KIND_DATA_SHM: u8 = 1;
const KIND_DATA_INLINE: u8 = 2;
const KIND_SRI: u8 = 3;

pub const STATUS_OK: u32 = 0;
pub const STATUS_REJECTED: u32 = 1;

/// Packet metadata shared by both data message kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct DataHeader {
    pub stream_id: String,
    pub scalar_count: u64,
    pub time: PrecisionTime,
    pub eos: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Payload lives in a shared-memory allocation; `window` is the byte
    /// offset from the allocation payload to the first scalar.
    DataShm { header: DataHeader, mem: MemoryRef, window: u64 },
    /// Payload travels inline on the pipe.
    DataInline { header: DataHeader, bytes: Vec<u8> },
    /// Stream metadata announcement.
    Sri { sri: StreamDescriptor },
}

fn decode_error(detail: &str) -> StreamError {
    StreamError::io(
        "decode wire message",
        io::Error::new(io::ErrorKind::InvalidData, detail.to_string()),
    )
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(decode_error("message truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(u16::from_ne_bytes(raw))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_ne_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_ne_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| decode_error("string is not utf-8"))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_ne_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Bool(v) => {
            out.push(0);
            out.push(u8::from(*v));
        }
        Value::Int8(v) => {
            out.push(1);
            out.push(*v as u8);
        }
        Value::UInt8(v) => {
            out.push(2);
            out.push(*v);
        }
        Value::Int16(v) => {
            out.push(3);
            out.extend_from_slice(&v.to_ne_bytes());
        }
        Value::UInt16(v) => {
            out.push(4);
            out.extend_from_slice(&v.to_ne_bytes());
        }
        Value::Int32(v) => {
            out.push(5);
            out.extend_from_slice(&v.to_ne_bytes());
        }
        Value::UInt32(v) => {
            out.push(6);
            out.extend_from_slice(&v.to_ne_bytes());
        }
        Value::Int64(v) => {
            out.push(7);
            out.extend_from_slice(&v.to_ne_bytes());
        }
        Value::UInt64(v) => {
            out.push(8);
            out.extend_from_slice(&v.to_ne_bytes());
        }
        Value::Float32(v) => {
            out.push(9);
            out.extend_from_slice(&v.to_bits().to_ne_bytes());
        }
        Value::Float64(v) => {
            out.push(10);
            out.extend_from_slice(&v.to_bits().to_ne_bytes());
        }
        Value::Str(v) => {
            out.push(11);
            put_string(out, v);
        }
    }
}

fn get_value(cursor: &mut Cursor<'_>) -> Result<Value> {
    match cursor.u8()? {
        0 => Ok(Value::Bool(cursor.u8()? != 0)),
        1 => Ok(Value::Int8(cursor.u8()? as i8)),
        2 => Ok(Value::UInt8(cursor.u8()?)),
        3 => Ok(Value::Int16(cursor.u16()? as i16)),
        4 => Ok(Value::UInt16(cursor.u16()?)),
        5 => Ok(Value::Int32(cursor.u32()? as i32)),
        6 => Ok(Value::UInt32(cursor.u32()?)),
        7 => Ok(Value::Int64(cursor.i64()?)),
        8 => Ok(Value::UInt64(cursor.u64()?)),
        9 => Ok(Value::Float32(f32::from_bits(cursor.u32()?))),
        10 => Ok(Value::Float64(cursor.f64()?)),
        11 => Ok(Value::Str(cursor.string()?)),
        other => Err(decode_error(&format!("unknown value tag {other}"))),
    }
}

fn put_header(out: &mut Vec<u8>, header: &DataHeader) {
    put_string(out, &header.stream_id);
    out.extend_from_slice(&header.scalar_count.to_ne_bytes());
    out.extend_from_slice(&header.time.twsec.to_bits().to_ne_bytes());
    out.extend_from_slice(&header.time.tfsec.to_bits().to_ne_bytes());
    out.push(u8::from(header.eos));
}

fn get_header(cursor: &mut Cursor<'_>) -> Result<DataHeader> {
    Ok(DataHeader {
        stream_id: cursor.string()?,
        scalar_count: cursor.u64()?,
        time: PrecisionTime { twsec: cursor.f64()?, tfsec: cursor.f64()? },
        eos: cursor.u8()? != 0,
    })
}

impl WireMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        match self {
            WireMessage::DataShm { header, mem, window } => {
                body.push(KIND_DATA_SHM);
                put_header(&mut body, header);
                put_string(&mut body, &mem.heap_id);
                body.extend_from_slice(&mem.superblock.to_ne_bytes());
                body.extend_from_slice(&mem.offset.to_ne_bytes());
                body.extend_from_slice(&window.to_ne_bytes());
            }
            WireMessage::DataInline { header, bytes } => {
                body.push(KIND_DATA_INLINE);
                put_header(&mut body, header);
                body.extend_from_slice(&(bytes.len() as u64).to_ne_bytes());
                body.extend_from_slice(bytes);
            }
            WireMessage::Sri { sri } => {
                body.push(KIND_SRI);
                put_string(&mut body, sri.stream_id());
                body.extend_from_slice(&sri.xstart.to_bits().to_ne_bytes());
                body.extend_from_slice(&sri.xdelta.to_bits().to_ne_bytes());
                body.extend_from_slice(&sri.xunits.to_ne_bytes());
                body.extend_from_slice(&(sri.subsize as u64).to_ne_bytes());
                body.extend_from_slice(&sri.ystart.to_bits().to_ne_bytes());
                body.extend_from_slice(&sri.ydelta.to_bits().to_ne_bytes());
                body.extend_from_slice(&sri.yunits.to_ne_bytes());
                body.push(u8::from(sri.complex));
                body.push(u8::from(sri.blocking));
                body.extend_from_slice(&(sri.keywords.len() as u32).to_ne_bytes());
                for (name, value) in &sri.keywords {
                    put_string(&mut body, name);
                    put_value(&mut body, value);
                }
            }
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(body: &[u8]) -> Result<WireMessage> {
        let mut cursor = Cursor { buf: body };
        match cursor.u8()? {
            KIND_DATA_SHM => {
                let header = get_header(&mut cursor)?;
                let mem = MemoryRef {
                    heap_id: cursor.string()?,
                    superblock: cursor.u32()?,
                    offset: cursor.u32()?,
                };
                let window = cursor.u64()?;
                Ok(WireMessage::DataShm { header, mem, window })
            }
            KIND_DATA_INLINE => {
                let header = get_header(&mut cursor)?;
                let bytes = cursor.bytes()?;
                Ok(WireMessage::DataInline { header, bytes })
            }
            KIND_SRI => {
                let mut sri = StreamDescriptor::new(cursor.string()?);
                sri.xstart = cursor.f64()?;
                sri.xdelta = cursor.f64()?;
                sri.xunits = cursor.u16()? as i16;
                sri.subsize = cursor.u64()? as u32;
                sri.ystart = cursor.f64()?;
                sri.ydelta = cursor.f64()?;
                sri.yunits = cursor.u16()? as i16;
                sri.complex = cursor.u8()? != 0;
                sri.blocking = cursor.u8()? != 0;
                let keywords = cursor.u32()? as usize;
                for _ in 0..keywords {
                    let name = cursor.string()?;
                    let value = get_value(&mut cursor)?;
                    sri.set_keyword(name, value);
                }
                Ok(WireMessage::Sri { sri })
            }
            other => Err(decode_error(&format!("unknown message kind {other}"))),
        }
    }
}

/// Read one message. `Ok(None)` signals a clean end of stream (the
/// writer closed the pipe between messages).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<WireMessage>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(StreamError::io("read message length", err)),
    }
    let len = u32::from_ne_bytes(prefix) as usize;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| StreamError::io("read message body", err))?;
    WireMessage::decode(&body).map(Some)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> Result<()> {
    writer
        .write_all(&message.encode())
        .await
        .map_err(|err| StreamError::io("write message", err))
}

pub async fn read_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut raw = [0u8; 4];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(|err| StreamError::io("read ack", err))?;
    Ok(u32::from_ne_bytes(raw))
}

pub async fn write_status<W: AsyncWrite + Unpin>(writer: &mut W, status: u32) -> Result<()> {
    writer
        .write_all(&status.to_ne_bytes())
        .await
        .map_err(|err| StreamError::io("write ack", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_data_survives_a_round_trip() {
        let message = WireMessage::DataInline {
            header: DataHeader {
                stream_id: "alpha".into(),
                scalar_count: 3,
                time: PrecisionTime::new(12.0, 0.25),
                eos: true,
            },
            bytes: vec![1, 2, 3, 4, 5, 6],
        };
        let encoded = message.encode();
        let decoded = WireMessage::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn shm_reference_survives_a_round_trip() {
        let message = WireMessage::DataShm {
            header: DataHeader {
                stream_id: "s".into(),
                scalar_count: 1024,
                time: PrecisionTime::new(0.0, 0.0),
                eos: false,
            },
            mem: MemoryRef { heap_id: "sampleio-42".into(), superblock: 3, offset: 4096 },
            window: 16,
        };
        let encoded = message.encode();
        assert_eq!(
            u32::from_ne_bytes(encoded[..4].try_into().unwrap()) as usize,
            encoded.len() - 4
        );
        let decoded = WireMessage::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn sri_keeps_metadata_and_keywords() {
        let mut sri = StreamDescriptor::new("meta");
        sri.xdelta = 0.001;
        sri.complex = true;
        sri.set_keyword("COL_RF", 101.5);
        sri.set_keyword("SOURCE", "testbench");
        let encoded = WireMessage::Sri { sri: sri.clone() }.encode();
        let WireMessage::Sri { sri: decoded } = WireMessage::decode(&encoded[4..]).unwrap()
        else {
            panic!("wrong message kind");
        };
        assert!(StreamDescriptor::compare_fields(&sri, &decoded).is_empty());
        assert_eq!(decoded.keyword("SOURCE"), Some(&Value::Str("testbench".into())));
    }

    #[test]
    fn truncated_message_is_rejected() {
        let message = WireMessage::DataInline {
            header: DataHeader {
                stream_id: "x".into(),
                scalar_count: 2,
                time: PrecisionTime::new(0.0, 0.0),
                eos: false,
            },
            bytes: vec![9, 9],
        };
        let encoded = message.encode();
        assert!(WireMessage::decode(&encoded[4..encoded.len() - 1]).is_err());
    }
}
