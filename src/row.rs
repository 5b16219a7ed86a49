//! Decoded rows and column metadata handed to callers by the row-batch
//! stream.

use crate::error::{Error, Result};
use crate::protocol::types::{FormatCode, Oid};
use crate::value::FromValue;

/// Describes one column of a result set.
///
/// Columns are always reported as [`FormatCode::Binary`]: the core rewrites
/// any server-declared text columns to binary before requesting them in
/// `Bind`, so callers never have to branch on format.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    /// Column name as reported by `RowDescription`.
    pub name: String,
    /// Server type OID.
    pub type_oid: Oid,
    /// Wire format. Always `Binary` once normalized.
    pub format: FormatCode,
}

/// One row of column values, owned so it can be forwarded across the
/// actor/consumer boundary.
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// Column values in positional order. `None` denotes SQL NULL; `Some(&[])`
    /// is distinct from NULL and denotes an empty-but-present value.
    pub columns: Vec<Option<Vec<u8>>>,
}

impl Row {
    /// Decode column `index` as `T`.
    pub fn get<'a, T: FromValue<'a>>(&'a self, index: usize, oid: Oid) -> Result<T> {
        match self.columns.get(index) {
            Some(Some(bytes)) => T::from_binary(oid, bytes),
            Some(None) => T::from_null(oid),
            None => Err(Error::Decode(format!("column index {index} out of range"))),
        }
    }
}

/// Decodes a whole row into a Rust type, given the columns it was produced
/// against.
pub trait FromRow<'a>: Sized {
    /// Decode `row` using `columns` for OIDs (lengths already validated).
    fn from_row(columns: &[ColumnDescriptor], row: &'a Row) -> Result<Self>;
}

macro_rules! impl_from_row_tuple {
    ($n:literal; $($idx:tt : $name:ident),+) => {
        impl<'a, $($name: FromValue<'a>),+> FromRow<'a> for ($($name,)+) {
            fn from_row(columns: &[ColumnDescriptor], row: &'a Row) -> Result<Self> {
                if columns.len() < $n {
                    return Err(Error::Decode(format!(
                        "expected at least {} columns, row has {}",
                        $n,
                        columns.len()
                    )));
                }
                Ok(($(row.get::<$name>($idx, columns[$idx].type_oid)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1; 0: A);
impl_from_row_tuple!(2; 0: A, 1: B);
impl_from_row_tuple!(3; 0: A, 1: B, 2: C);
impl_from_row_tuple!(4; 0: A, 1: B, 2: C, 3: D);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_column_is_none() {
        let row = Row {
            columns: vec![None],
        };
        let value: Option<i32> = row.get(0, 23).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn empty_column_is_distinct_from_null() {
        let row = Row {
            columns: vec![Some(Vec::new())],
        };
        let value: &[u8] = row.get(0, 25).unwrap();
        assert_eq!(value, &[] as &[u8]);
    }

    #[test]
    fn tuple_decodes_in_order() {
        let columns = vec![
            ColumnDescriptor {
                name: "a".into(),
                type_oid: 23,
                format: FormatCode::Binary,
            },
            ColumnDescriptor {
                name: "b".into(),
                type_oid: 25,
                format: FormatCode::Binary,
            },
        ];
        let row = Row {
            columns: vec![Some(7i32.to_be_bytes().to_vec()), Some(b"hi".to_vec())],
        };
        let (a, b): (i32, String) = FromRow::from_row(&columns, &row).unwrap();
        assert_eq!(a, 7);
        assert_eq!(b, "hi");
    }
}
