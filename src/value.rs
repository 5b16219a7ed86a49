//! Narrow value-encoding interfaces.
//!
//! The full per-type codec registry (numeric, date/time, UUID, JSON, ...) is
//! out of scope for this crate: callers implement [`ToParams`] and
//! [`FromValue`] for their own types, or use the handful of scalar impls
//! below for quick testing. The state machines only ever see raw bytes.

use crate::error::{Error, Result};
use crate::protocol::types::Oid;

/// Encodes a tuple of bound parameters into the binary wire format expected
/// by `Bind`.
pub trait ToParams {
    /// Number of parameters.
    fn param_count(&self) -> usize;

    /// Append each parameter as a 4-byte length prefix followed by its binary
    /// representation (`-1` length for SQL NULL).
    fn to_binary(&self, out: &mut Vec<u8>);
}

impl ToParams for () {
    fn param_count(&self) -> usize {
        0
    }

    fn to_binary(&self, _out: &mut Vec<u8>) {}
}

/// Encodes one parameter value into the wire format used by `Bind`.
pub trait ToValue {
    /// Append this value's binary representation (without the length
    /// prefix).
    fn to_binary(&self, out: &mut Vec<u8>);

    /// Whether this value should be sent as SQL NULL instead.
    fn is_null(&self) -> bool {
        false
    }
}

macro_rules! impl_to_value_int {
    ($t:ty) => {
        impl ToValue for $t {
            fn to_binary(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }
        }
    };
}

impl_to_value_int!(i16);
impl_to_value_int!(i32);
impl_to_value_int!(i64);

impl ToValue for bool {
    fn to_binary(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl ToValue for str {
    fn to_binary(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToValue for &str {
    fn to_binary(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToValue for String {
    fn to_binary(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_binary(&self, out: &mut Vec<u8>) {
        if let Some(value) = self {
            value.to_binary(out);
        }
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }
}

fn write_param(out: &mut Vec<u8>, value: &(impl ToValue + ?Sized)) {
    if value.is_null() {
        out.extend_from_slice(&(-1i32).to_be_bytes());
        return;
    }
    let start = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]);
    value.to_binary(out);
    let len = (out.len() - start - 4) as i32;
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

macro_rules! impl_to_params_tuple {
    ($($idx:tt : $name:ident),+) => {
        impl<$($name: ToValue),+> ToParams for ($($name,)+) {
            fn param_count(&self) -> usize {
                const N: usize = [$($idx),+].len();
                N
            }

            fn to_binary(&self, out: &mut Vec<u8>) {
                $(write_param(out, &self.$idx);)+
            }
        }
    };
}

impl_to_params_tuple!(0: A);
impl_to_params_tuple!(0: A, 1: B);
impl_to_params_tuple!(0: A, 1: B, 2: C);
impl_to_params_tuple!(0: A, 1: B, 2: C, 3: D);

/// Decodes a single column value, either from the text or binary wire
/// format, or from SQL NULL.
pub trait FromValue<'a>: Sized {
    /// Decode from the binary representation.
    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self>;

    /// Decode from the text representation.
    fn from_text(oid: Oid, _text: &'a str) -> Result<Self> {
        Err(Error::Decode(format!(
            "no text decoder for oid {oid}, binary format should have been requested"
        )))
    }

    /// Decode SQL NULL.
    fn from_null(oid: Oid) -> Result<Self> {
        Err(Error::Decode(format!("unexpected NULL for oid {oid}")))
    }
}

impl<'a, T: FromValue<'a>> FromValue<'a> for Option<T> {
    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        T::from_binary(oid, bytes).map(Some)
    }

    fn from_text(oid: Oid, text: &'a str) -> Result<Self> {
        T::from_text(oid, text).map(Some)
    }

    fn from_null(_oid: Oid) -> Result<Self> {
        Ok(None)
    }
}

impl<'a> FromValue<'a> for bool {
    fn from_binary(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        bytes
            .first()
            .map(|&b| b != 0)
            .ok_or_else(|| Error::Decode("bool: empty buffer".into()))
    }
}

macro_rules! impl_from_value_int {
    ($t:ty) => {
        impl<'a> FromValue<'a> for $t {
            fn from_binary(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
                let array = bytes
                    .try_into()
                    .map_err(|_| Error::Decode(concat!(stringify!($t), ": wrong length").into()))?;
                Ok(<$t>::from_be_bytes(array))
            }
        }
    };
}

impl_from_value_int!(i16);
impl_from_value_int!(i32);
impl_from_value_int!(i64);

impl<'a> FromValue<'a> for &'a str {
    fn from_binary(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        std::str::from_utf8(bytes).map_err(|e| Error::Decode(format!("&str: {e}")))
    }
}

impl<'a> FromValue<'a> for String {
    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        <&str>::from_binary(oid, bytes).map(str::to_owned)
    }
}

impl<'a> FromValue<'a> for &'a [u8] {
    fn from_binary(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        Ok(bytes)
    }
}

impl<'a> FromValue<'a> for Vec<u8> {
    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        <&[u8]>::from_binary(oid, bytes).map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_round_trip() {
        let mut buf = Vec::new();
        true.to_binary(&mut buf);
        assert_eq!(bool::from_binary(16, &buf).unwrap(), true);
    }

    #[test]
    fn i32_round_trip() {
        let mut buf = Vec::new();
        42i32.to_binary(&mut buf);
        assert_eq!(i32::from_binary(23, &buf).unwrap(), 42);
    }

    #[test]
    fn option_null_decodes_to_none() {
        assert_eq!(Option::<i32>::from_null(23).unwrap(), None);
    }

    #[test]
    fn params_tuple_encodes_length_prefix() {
        let mut buf = Vec::new();
        (7i32,).to_binary(&mut buf);
        assert_eq!(&buf[0..4], &4i32.to_be_bytes());
        assert_eq!(&buf[4..8], &7i32.to_be_bytes());
    }
}
