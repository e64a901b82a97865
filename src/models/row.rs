//! Row results and positional scanning.

use crate::error::{DbError, DbResult};
use crate::models::value::{FromValue, Value};
use serde::Serialize;

/// Outcome of an execute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Populated by MySQL and SQLite; PostgreSQL reports ids through `RETURNING`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
}

/// A single decoded result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at the given column position.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value of the first column with the given name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Fail unless the row has exactly `width` columns.
    fn expect_width(&self, width: usize) -> DbResult<()> {
        if self.values.len() != width {
            return Err(DbError::scan(format!(
                "expected {} destination(s), row has {} column(s)",
                width,
                self.values.len()
            )));
        }
        Ok(())
    }
}

/// Scan target for single-row queries. Columns are assigned by position.
///
/// Implemented for [`Row`] itself and for tuples of up to eight [`FromValue`] types.
pub trait FromRow: Sized {
    fn from_row(row: Row) -> DbResult<Self>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> DbResult<Self> {
        Ok(row)
    }
}

fn take_column<T: FromValue>(
    values: &mut impl Iterator<Item = (usize, Value)>,
) -> DbResult<T> {
    let (idx, value) = values
        .next()
        .ok_or_else(|| DbError::scan("row ended before all destinations were filled"))?;
    T::from_value(value).map_err(|e| DbError::scan(format!("column {}: {}", idx, e)))
}

macro_rules! impl_from_row_for_tuple {
    ($width:expr => $($name:ident),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: Row) -> DbResult<Self> {
                row.expect_width($width)?;
                let mut values = row.into_values().into_iter().enumerate();
                Ok(($(take_column::<$name>(&mut values)?,)+))
            }
        }
    };
}

impl_from_row_for_tuple!(1 => A);
impl_from_row_for_tuple!(2 => A, B);
impl_from_row_for_tuple!(3 => A, B, C);
impl_from_row_for_tuple!(4 => A, B, C, D);
impl_from_row_for_tuple!(5 => A, B, C, D, E);
impl_from_row_for_tuple!(6 => A, B, C, D, E, F);
impl_from_row_for_tuple!(7 => A, B, C, D, E, F, G);
impl_from_row_for_tuple!(8 => A, B, C, D, E, F, G, H);
