//! [`Value`] 的 MessagePack 子集编码。
//!
//! # 覆盖范围（What）
//! - nil / bool / 整数（正负 fixint、uint8..64、int8..64，总是选择最短编码）/ float64；
//! - str（fixstr、str8/16/32，要求 UTF-8）、bin8/16/32；
//! - array（fixarray、array16/32）、map（fixmap、map16/32）。
//!
//! 解码额外接受 float32 并扩宽为 `f64`；超出 `i64` 范围的 uint64 与其它未覆盖的标记
//! 返回 [`DeserializeError::Decode`]。集合嵌套通过 [`Unpacker::descend`] 限制深度。

use crate::{
    error::{DeserializeError, SerializeError},
    packer::Packer,
    serializer::{Pack, Unpack},
    unpacker::Unpacker,
    value::Value,
};

mod marker {
    pub const NIL: u8 = 0xc0;
    pub const FALSE: u8 = 0xc2;
    pub const TRUE: u8 = 0xc3;
    pub const BIN8: u8 = 0xc4;
    pub const BIN16: u8 = 0xc5;
    pub const BIN32: u8 = 0xc6;
    pub const FLOAT32: u8 = 0xca;
    pub const FLOAT64: u8 = 0xcb;
    pub const UINT8: u8 = 0xcc;
    pub const UINT16: u8 = 0xcd;
    pub const UINT32: u8 = 0xce;
    pub const UINT64: u8 = 0xcf;
    pub const INT8: u8 = 0xd0;
    pub const INT16: u8 = 0xd1;
    pub const INT32: u8 = 0xd2;
    pub const INT64: u8 = 0xd3;
    pub const STR8: u8 = 0xd9;
    pub const STR16: u8 = 0xda;
    pub const STR32: u8 = 0xdb;
    pub const ARRAY16: u8 = 0xdc;
    pub const ARRAY32: u8 = 0xdd;
    pub const MAP16: u8 = 0xde;
    pub const MAP32: u8 = 0xdf;
    pub const FIXMAP: u8 = 0x80;
    pub const FIXARRAY: u8 = 0x90;
    pub const FIXSTR: u8 = 0xa0;
}

impl Pack for Value {
    fn pack(&self, packer: &mut Packer<'_>) -> Result<(), SerializeError> {
        match self {
            Value::Nil => packer.write_u8(marker::NIL),
            Value::Bool(false) => packer.write_u8(marker::FALSE),
            Value::Bool(true) => packer.write_u8(marker::TRUE),
            Value::Integer(v) => pack_integer(packer, *v),
            Value::Double(v) => {
                packer.write_u8(marker::FLOAT64)?;
                packer.write_f64(*v)
            }
            Value::String(s) => {
                pack_header(packer, s.len(), Some(marker::FIXSTR), [
                    marker::STR8,
                    marker::STR16,
                    marker::STR32,
                ])?;
                packer.write(s.as_bytes())
            }
            Value::Bytes(b) => {
                pack_header(packer, b.len(), None, [
                    marker::BIN8,
                    marker::BIN16,
                    marker::BIN32,
                ])?;
                packer.write(b)
            }
            Value::List(items) => {
                pack_collection_header(packer, items.len(), marker::FIXARRAY, [
                    marker::ARRAY16,
                    marker::ARRAY32,
                ])?;
                items.iter().try_for_each(|item| item.pack(packer))
            }
            Value::Map(pairs) => {
                pack_collection_header(packer, pairs.len(), marker::FIXMAP, [
                    marker::MAP16,
                    marker::MAP32,
                ])?;
                pairs.iter().try_for_each(|(k, v)| {
                    k.pack(packer)?;
                    v.pack(packer)
                })
            }
        }
    }
}

fn pack_integer(packer: &mut Packer<'_>, v: i64) -> Result<(), SerializeError> {
    if (0..=0x7f).contains(&v) {
        return packer.write_u8(v as u8);
    }
    if (-32..0).contains(&v) {
        return packer.write_i8(v as i8);
    }
    if v > 0 {
        return match v as u64 {
            n if n <= u8::MAX.into() => {
                packer.write_u8(marker::UINT8)?;
                packer.write_u8(n as u8)
            }
            n if n <= u16::MAX.into() => {
                packer.write_u8(marker::UINT16)?;
                packer.write_u16(n as u16)
            }
            n if n <= u32::MAX.into() => {
                packer.write_u8(marker::UINT32)?;
                packer.write_u32(n as u32)
            }
            n => {
                packer.write_u8(marker::UINT64)?;
                packer.write_u64(n)
            }
        };
    }
    if v >= i8::MIN.into() {
        packer.write_u8(marker::INT8)?;
        packer.write_i8(v as i8)
    } else if v >= i16::MIN.into() {
        packer.write_u8(marker::INT16)?;
        packer.write_i16(v as i16)
    } else if v >= i32::MIN.into() {
        packer.write_u8(marker::INT32)?;
        packer.write_i32(v as i32)
    } else {
        packer.write_u8(marker::INT64)?;
        packer.write_i64(v)
    }
}

/// 写入 str/bin 头部：`fix` 为 fixstr 前缀（bin 没有），`sized` 依次为 8/16/32 位长度标记。
fn pack_header(
    packer: &mut Packer<'_>,
    len: usize,
    fix: Option<u8>,
    sized: [u8; 3],
) -> Result<(), SerializeError> {
    match (fix, len) {
        (Some(prefix), len) if len < 32 => packer.write_u8(prefix | len as u8),
        (_, len) if len <= u8::MAX as usize => {
            packer.write_u8(sized[0])?;
            packer.write_u8(len as u8)
        }
        (_, len) if len <= u16::MAX as usize => {
            packer.write_u8(sized[1])?;
            packer.write_u16(len as u16)
        }
        (_, len) => {
            let len = u32::try_from(len)
                .map_err(|_| SerializeError::encode("payload longer than u32::MAX bytes"))?;
            packer.write_u8(sized[2])?;
            packer.write_u32(len)
        }
    }
}

fn pack_collection_header(
    packer: &mut Packer<'_>,
    len: usize,
    fix: u8,
    sized: [u8; 2],
) -> Result<(), SerializeError> {
    if len < 16 {
        return packer.write_u8(fix | len as u8);
    }
    if len <= u16::MAX as usize {
        packer.write_u8(sized[0])?;
        return packer.write_u16(len as u16);
    }
    let len = u32::try_from(len)
        .map_err(|_| SerializeError::encode("collection longer than u32::MAX entries"))?;
    packer.write_u8(sized[1])?;
    packer.write_u32(len)
}

impl Unpack for Value {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DeserializeError> {
        let offset = unpacker.position();
        let tag = unpacker.read_u8()?;
        let value = match tag {
            0x00..=0x7f => Value::Integer(tag.into()),
            0x80..=0x8f => unpack_map(unpacker, usize::from(tag & 0x0f))?,
            0x90..=0x9f => unpack_list(unpacker, usize::from(tag & 0x0f))?,
            0xa0..=0xbf => unpack_str(unpacker, offset, usize::from(tag & 0x1f))?,
            marker::NIL => Value::Nil,
            marker::FALSE => Value::Bool(false),
            marker::TRUE => Value::Bool(true),
            marker::BIN8 => {
                let len = unpacker.read_u8()?.into();
                Value::Bytes(unpacker.read(len)?.to_vec())
            }
            marker::BIN16 => {
                let len = unpacker.read_u16()?.into();
                Value::Bytes(unpacker.read(len)?.to_vec())
            }
            marker::BIN32 => {
                let len = read_len32(unpacker)?;
                Value::Bytes(unpacker.read(len)?.to_vec())
            }
            marker::FLOAT32 => Value::Double(unpacker.read_f32()?.into()),
            marker::FLOAT64 => Value::Double(unpacker.read_f64()?),
            marker::UINT8 => Value::Integer(unpacker.read_u8()?.into()),
            marker::UINT16 => Value::Integer(unpacker.read_u16()?.into()),
            marker::UINT32 => Value::Integer(unpacker.read_u32()?.into()),
            marker::UINT64 => {
                let n = unpacker.read_u64()?;
                let v = i64::try_from(n)
                    .map_err(|_| DeserializeError::decode(offset, "uint64 exceeds i64 range"))?;
                Value::Integer(v)
            }
            marker::INT8 => Value::Integer(unpacker.read_i8()?.into()),
            marker::INT16 => Value::Integer(unpacker.read_i16()?.into()),
            marker::INT32 => Value::Integer(unpacker.read_i32()?.into()),
            marker::INT64 => Value::Integer(unpacker.read_i64()?),
            marker::STR8 => {
                let len = unpacker.read_u8()?.into();
                unpack_str(unpacker, offset, len)?
            }
            marker::STR16 => {
                let len = unpacker.read_u16()?.into();
                unpack_str(unpacker, offset, len)?
            }
            marker::STR32 => {
                let len = read_len32(unpacker)?;
                unpack_str(unpacker, offset, len)?
            }
            marker::ARRAY16 => {
                let len = unpacker.read_u16()?.into();
                unpack_list(unpacker, len)?
            }
            marker::ARRAY32 => {
                let len = read_len32(unpacker)?;
                unpack_list(unpacker, len)?
            }
            marker::MAP16 => {
                let len = unpacker.read_u16()?.into();
                unpack_map(unpacker, len)?
            }
            marker::MAP32 => {
                let len = read_len32(unpacker)?;
                unpack_map(unpacker, len)?
            }
            0xe0..=0xff => Value::Integer((tag as i8).into()),
            other => {
                return Err(DeserializeError::decode(
                    offset,
                    format!("unsupported marker 0x{other:02x}"),
                ));
            }
        };
        Ok(value)
    }
}

fn read_len32(unpacker: &mut Unpacker<'_>) -> Result<usize, DeserializeError> {
    let offset = unpacker.position();
    let len = unpacker.read_u32()?;
    usize::try_from(len).map_err(|_| DeserializeError::decode(offset, "length exceeds usize"))
}

fn unpack_str(
    unpacker: &mut Unpacker<'_>,
    offset: usize,
    len: usize,
) -> Result<Value, DeserializeError> {
    let bytes = unpacker.read(len)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| DeserializeError::decode(offset, "string is not valid UTF-8"))?;
    Ok(Value::String(s.to_owned()))
}

// 每个元素至少占 1 字节，预分配以剩余字节数封顶，防止伪造的长度字段触发巨量分配。
fn unpack_list(unpacker: &mut Unpacker<'_>, len: usize) -> Result<Value, DeserializeError> {
    unpacker.descend(|u| {
        let mut items = Vec::with_capacity(len.min(u.remaining_len()));
        for _ in 0..len {
            items.push(Value::unpack(u)?);
        }
        Ok(Value::List(items))
    })
}

fn unpack_map(unpacker: &mut Unpacker<'_>, len: usize) -> Result<Value, DeserializeError> {
    unpacker.descend(|u| {
        let mut pairs = Vec::with_capacity(len.min(u.remaining_len() / 2));
        for _ in 0..len {
            let key = Value::unpack(u)?;
            let value = Value::unpack(u)?;
            pairs.push((key, value));
        }
        Ok(Value::Map(pairs))
    })
}
