//! Binary-protocol `COM_STMT_EXECUTE` decoding.
//!
//! The capture stream stores statement payloads as opaque bytes; at replay
//! time the per-connection worker re-prepares the statement on the target and
//! needs the original parameter values back. The null bitmap length depends
//! on the parameter count, which only the prepare response knows, so the
//! caller passes `num_params` in. When the payload carries no type block
//! (`new_params_bound_flag = 0`), the types from the previous execution of
//! the same statement must be supplied.

use nom::bytes::complete::take;
use nom::number::complete::{
    le_i16, le_i32, le_i64, le_i8, le_u16, le_u24, le_u32, le_u64, le_u8,
};
use nom::IResult;

use crate::{Result, WireError};

// Column type bytes from mysql_com.h.
pub const TYPE_DECIMAL: u8 = 0x00;
pub const TYPE_TINY: u8 = 0x01;
pub const TYPE_SHORT: u8 = 0x02;
pub const TYPE_LONG: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_DOUBLE: u8 = 0x05;
pub const TYPE_NULL: u8 = 0x06;
pub const TYPE_TIMESTAMP: u8 = 0x07;
pub const TYPE_LONGLONG: u8 = 0x08;
pub const TYPE_INT24: u8 = 0x09;
pub const TYPE_DATE: u8 = 0x0a;
pub const TYPE_TIME: u8 = 0x0b;
pub const TYPE_DATETIME: u8 = 0x0c;
pub const TYPE_YEAR: u8 = 0x0d;

/// A parameter's declared type: the type byte plus the unsigned flag from
/// the high bit of the flags byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamType {
    pub type_byte: u8,
    pub unsigned: bool,
}

/// A decoded binary-protocol value.
#[derive(Clone, Debug, PartialEq)]
pub enum BinValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micro: u32,
    },
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micro: u32,
    },
}

/// The decoded body of a `COM_STMT_EXECUTE` (without the command byte).
#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteParams {
    pub stmt_id: u32,
    pub flags: u8,
    /// Types seen in this payload (or the cached ones that were applied).
    /// The caller caches these per statement for later executions that set
    /// `new_params_bound_flag = 0`.
    pub types: Vec<ParamType>,
    pub values: Vec<BinValue>,
}

fn lenenc_int(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, first) = le_u8(i)?;
    match first {
        b @ 0x00..=0xfb => Ok((i, b.into())),
        0xfc => le_u16(i).map(|(i, n)| (i, n.into())),
        0xfd => le_u24(i).map(|(i, n)| (i, n.into())),
        0xfe => le_u64(i),
        0xff => Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn lenenc_bytes(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, len) = lenenc_int(i)?;
    take(len as usize)(i)
}

fn temporal(i: &[u8], ty: ParamType) -> IResult<&[u8], BinValue> {
    let (i, len) = le_u8(i)?;
    if ty.type_byte == TYPE_TIME {
        match len {
            0 => Ok((
                i,
                BinValue::Time {
                    negative: false,
                    days: 0,
                    hours: 0,
                    minutes: 0,
                    seconds: 0,
                    micro: 0,
                },
            )),
            8 | 12 => {
                let (i, negative) = le_u8(i)?;
                let (i, days) = le_u32(i)?;
                let (i, hours) = le_u8(i)?;
                let (i, minutes) = le_u8(i)?;
                let (i, seconds) = le_u8(i)?;
                let (i, micro) = if len == 12 { le_u32(i)? } else { (i, 0) };
                Ok((
                    i,
                    BinValue::Time {
                        negative: negative != 0,
                        days,
                        hours,
                        minutes,
                        seconds,
                        micro,
                    },
                ))
            }
            _ => Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::LengthValue,
            ))),
        }
    } else {
        match len {
            0 => Ok((
                i,
                BinValue::Date {
                    year: 0,
                    month: 0,
                    day: 0,
                    hour: 0,
                    minute: 0,
                    second: 0,
                    micro: 0,
                },
            )),
            4 | 7 | 11 => {
                let (i, year) = le_u16(i)?;
                let (i, month) = le_u8(i)?;
                let (i, day) = le_u8(i)?;
                let (i, (hour, minute, second)) = if len >= 7 {
                    let (i, h) = le_u8(i)?;
                    let (i, m) = le_u8(i)?;
                    let (i, s) = le_u8(i)?;
                    (i, (h, m, s))
                } else {
                    (i, (0, 0, 0))
                };
                let (i, micro) = if len == 11 { le_u32(i)? } else { (i, 0) };
                Ok((
                    i,
                    BinValue::Date {
                        year,
                        month,
                        day,
                        hour,
                        minute,
                        second,
                        micro,
                    },
                ))
            }
            _ => Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::LengthValue,
            ))),
        }
    }
}

fn value(i: &[u8], ty: ParamType) -> IResult<&[u8], BinValue> {
    match ty.type_byte {
        TYPE_NULL => Ok((i, BinValue::Null)),
        TYPE_TINY => {
            if ty.unsigned {
                le_u8(i).map(|(i, v)| (i, BinValue::UInt(v.into())))
            } else {
                le_i8(i).map(|(i, v)| (i, BinValue::Int(v.into())))
            }
        }
        TYPE_SHORT | TYPE_YEAR => {
            if ty.unsigned {
                le_u16(i).map(|(i, v)| (i, BinValue::UInt(v.into())))
            } else {
                le_i16(i).map(|(i, v)| (i, BinValue::Int(v.into())))
            }
        }
        TYPE_LONG => {
            if ty.unsigned {
                le_u32(i).map(|(i, v)| (i, BinValue::UInt(v.into())))
            } else {
                le_i32(i).map(|(i, v)| (i, BinValue::Int(v.into())))
            }
        }
        // INT24 occupies 4 bytes on the wire, same as LONG.
        TYPE_INT24 => {
            if ty.unsigned {
                le_u32(i).map(|(i, v)| (i, BinValue::UInt(v.into())))
            } else {
                le_i32(i).map(|(i, v)| (i, BinValue::Int(v.into())))
            }
        }
        TYPE_LONGLONG => {
            if ty.unsigned {
                le_u64(i).map(|(i, v)| (i, BinValue::UInt(v)))
            } else {
                le_i64(i).map(|(i, v)| (i, BinValue::Int(v)))
            }
        }
        TYPE_FLOAT => {
            let (i, bits) = le_u32(i)?;
            Ok((i, BinValue::Float(f32::from_bits(bits))))
        }
        TYPE_DOUBLE => {
            let (i, bits) = le_u64(i)?;
            Ok((i, BinValue::Double(f64::from_bits(bits))))
        }
        TYPE_DATE | TYPE_DATETIME | TYPE_TIMESTAMP => temporal(i, ty),
        TYPE_TIME => temporal(i, ty),
        // Strings, blobs, decimals, bit, enum, set, geometry, json: all
        // length-encoded byte strings in the binary protocol.
        _ => lenenc_bytes(i).map(|(i, b)| (i, BinValue::Bytes(b.to_vec()))),
    }
}

/// Decodes a `COM_STMT_EXECUTE` body.
pub fn parse_execute(
    payload: &[u8],
    num_params: u16,
    cached_types: Option<&[ParamType]>,
) -> Result<ExecuteParams> {
    run(payload, num_params, cached_types)
        .map(|(_, p)| p)
        .map_err(|e| WireError::MalformedStmt(e.to_string()))
}

fn run<'a>(
    i: &'a [u8],
    num_params: u16,
    cached_types: Option<&[ParamType]>,
) -> IResult<&'a [u8], ExecuteParams> {
    let (i, stmt_id) = le_u32(i)?;
    let (i, flags) = le_u8(i)?;
    let (i, _iterations) = le_u32(i)?;

    if num_params == 0 {
        return Ok((
            i,
            ExecuteParams {
                stmt_id,
                flags,
                types: Vec::new(),
                values: Vec::new(),
            },
        ));
    }

    let n = num_params as usize;
    let (i, bitmap) = take((n + 7) / 8)(i)?;
    let null_bitmap = bitmap.to_vec();
    let (mut i, new_params_bound) = le_u8(i)?;

    let types = if new_params_bound == 1 {
        let mut types = Vec::with_capacity(n);
        for _ in 0..n {
            let (rest, type_byte) = le_u8(i)?;
            let (rest, type_flags) = le_u8(rest)?;
            types.push(ParamType {
                type_byte,
                unsigned: type_flags & 0x80 != 0,
            });
            i = rest;
        }
        types
    } else {
        match cached_types {
            Some(t) if t.len() == n => t.to_vec(),
            _ => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    i,
                    nom::error::ErrorKind::Verify,
                )))
            }
        }
    };

    let mut values = Vec::with_capacity(n);
    for (idx, ty) in types.iter().enumerate() {
        if null_bitmap[idx / 8] & (1 << (idx % 8)) != 0 {
            values.push(BinValue::Null);
            continue;
        }
        let (rest, v) = value(i, *ty)?;
        values.push(v);
        i = rest;
    }

    Ok((
        i,
        ExecuteParams {
            stmt_id,
            flags,
            types,
            values,
        },
    ))
}
