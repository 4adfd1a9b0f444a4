/// Result sets
///
/// A `ResultSet` is either buffered (every row fetched up front, seekable)
/// or streaming (forward-only, one pass). Cells are read through typed
/// getters addressed by column position or column name.
use crate::driver::{Column, ColumnType, QueryOutcome, RawRow, RowStream};
use crate::error::{KumoError, KumoResult};
use fnv::FnvHashMap;
use std::fmt;

/// Value category of a column, derived from its server type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
}

impl ValueType {
    pub fn from_column(column: &Column) -> Self {
        match (column.column_type, column.unsigned) {
            (ColumnType::Tiny | ColumnType::Short | ColumnType::Long | ColumnType::Int24, false) => {
                ValueType::Int32
            }
            (ColumnType::Tiny | ColumnType::Short | ColumnType::Long | ColumnType::Int24, true) => {
                ValueType::UInt32
            }
            (ColumnType::LongLong, false) => ValueType::Int64,
            (ColumnType::LongLong, true) => ValueType::UInt64,
            (ColumnType::Float, _) => ValueType::Float,
            (ColumnType::Double | ColumnType::Decimal, _) => ValueType::Double,
            _ => ValueType::String,
        }
    }
}

enum Rows {
    Empty,
    Buffered {
        rows: Vec<RawRow>,
        cursor: usize,
        current: Option<usize>,
    },
    Streaming {
        stream: Box<dyn RowStream>,
        current: Option<RawRow>,
        consumed: usize,
    },
}

/// Anything that addresses a column
pub trait ColumnIndex {
    fn resolve(&self, result: &ResultSet) -> KumoResult<usize>;
}

impl ColumnIndex for usize {
    fn resolve(&self, result: &ResultSet) -> KumoResult<usize> {
        if *self < result.columns.len() {
            Ok(*self)
        } else {
            Err(KumoError::get_value(format!(
                "column index {} out of range ({} columns)",
                self,
                result.columns.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn resolve(&self, result: &ResultSet) -> KumoResult<usize> {
        result
            .name_index
            .get(*self)
            .copied()
            .ok_or_else(|| KumoError::get_value(format!("unknown column '{}'", self)))
    }
}

/// Rows and metadata of one executed statement
pub struct ResultSet {
    columns: Vec<Column>,
    name_index: FnvHashMap<String, usize>,
    rows: Rows,
    affected_rows: u64,
    last_insert_id: u64,
    is_select: bool,
}

impl Default for ResultSet {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            name_index: FnvHashMap::default(),
            rows: Rows::Empty,
            affected_rows: 0,
            last_insert_id: 0,
            is_select: false,
        }
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("columns", &self.columns)
            .field("is_select", &self.is_select)
            .field("seekable", &self.is_seekable())
            .field("row_count", &self.row_count())
            .field("affected_rows", &self.affected_rows)
            .finish()
    }
}

impl ResultSet {
    /// Wrap a driver outcome; `store` drains the stream into memory
    pub fn from_outcome(outcome: QueryOutcome, store: bool) -> Self {
        match outcome {
            QueryOutcome::Affected {
                affected_rows,
                last_insert_id,
            } => ResultSet {
                affected_rows,
                last_insert_id,
                ..Default::default()
            },
            QueryOutcome::Rows { columns, mut stream } => {
                let name_index = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name.clone(), i))
                    .collect();
                let rows = if store {
                    let mut rows = Vec::new();
                    while let Some(row) = stream.next_row() {
                        rows.push(row);
                    }
                    Rows::Buffered {
                        rows,
                        cursor: 0,
                        current: None,
                    }
                } else {
                    Rows::Streaming {
                        stream,
                        current: None,
                        consumed: 0,
                    }
                };
                ResultSet {
                    columns,
                    name_index,
                    rows,
                    affected_rows: 0,
                    last_insert_id: 0,
                    is_select: true,
                }
            }
        }
    }

    /// Advance to the next row; false once the rows are exhausted
    pub fn next(&mut self) -> bool {
        match &mut self.rows {
            Rows::Empty => false,
            Rows::Buffered {
                rows,
                cursor,
                current,
            } => {
                if *cursor < rows.len() {
                    *current = Some(*cursor);
                    *cursor += 1;
                    true
                } else {
                    *current = None;
                    false
                }
            }
            Rows::Streaming {
                stream,
                current,
                consumed,
            } => {
                *current = stream.next_row();
                if current.is_some() {
                    *consumed += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Position so that the following `next()` yields row `row`.
    /// Only buffered results are seekable.
    pub fn seek_row(&mut self, row: usize) -> bool {
        match &mut self.rows {
            Rows::Buffered {
                rows,
                cursor,
                current,
            } if row < rows.len() => {
                *cursor = row;
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Index of the current row
    pub fn tell(&self) -> Option<usize> {
        match &self.rows {
            Rows::Buffered { current, .. } => *current,
            Rows::Streaming {
                current, consumed, ..
            } => current.as_ref().map(|_| consumed - 1),
            Rows::Empty => None,
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.rows, Rows::Buffered { .. })
    }

    pub fn is_select(&self) -> bool {
        self.is_select
    }

    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of rows; only known for buffered results
    pub fn row_count(&self) -> Option<usize> {
        match &self.rows {
            Rows::Buffered { rows, .. } => Some(rows.len()),
            Rows::Empty => Some(0),
            Rows::Streaming { .. } => None,
        }
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn column_type<C: ColumnIndex>(&self, column: C) -> KumoResult<ColumnType> {
        let idx = column.resolve(self)?;
        Ok(self.columns[idx].column_type)
    }

    pub fn value_type<C: ColumnIndex>(&self, column: C) -> KumoResult<ValueType> {
        let idx = column.resolve(self)?;
        Ok(ValueType::from_column(&self.columns[idx]))
    }

    fn current_row(&self) -> Option<&RawRow> {
        match &self.rows {
            Rows::Buffered { rows, current, .. } => current.and_then(|i| rows.get(i)),
            Rows::Streaming { current, .. } => current.as_ref(),
            Rows::Empty => None,
        }
    }

    fn cell<C: ColumnIndex>(&self, column: C) -> KumoResult<(usize, Option<&[u8]>)> {
        let idx = column.resolve(self)?;
        let row = self
            .current_row()
            .ok_or_else(|| KumoError::get_value("no current row"))?;
        let cell = row
            .get(idx)
            .ok_or_else(|| KumoError::get_value(format!("row has no cell {}", idx)))?;
        Ok((idx, cell.as_deref()))
    }

    pub fn is_null<C: ColumnIndex>(&self, column: C) -> KumoResult<bool> {
        Ok(self.cell(column)?.1.is_none())
    }

    /// Raw cell bytes
    pub fn get_value<C: ColumnIndex>(&self, column: C) -> KumoResult<&[u8]> {
        match self.cell(column)? {
            (_, Some(value)) => Ok(value),
            (idx, None) => Err(KumoError::ValueIsNull {
                column: self.columns[idx].name.clone(),
            }),
        }
    }

    pub fn get_string<C: ColumnIndex>(&self, column: C) -> KumoResult<String> {
        Ok(String::from_utf8_lossy(self.get_value(column)?).into_owned())
    }

    pub fn get_i32<C: ColumnIndex>(&self, column: C) -> KumoResult<i32> {
        let value = self.get_value(column)?;
        btoi::btoi::<i32>(value).map_err(|e| parse_error(value, e))
    }

    pub fn get_u32<C: ColumnIndex>(&self, column: C) -> KumoResult<u32> {
        let value = self.get_value(column)?;
        btoi::btou::<u32>(value).map_err(|e| parse_error(value, e))
    }

    pub fn get_i64<C: ColumnIndex>(&self, column: C) -> KumoResult<i64> {
        let value = self.get_value(column)?;
        btoi::btoi::<i64>(value).map_err(|e| parse_error(value, e))
    }

    pub fn get_u64<C: ColumnIndex>(&self, column: C) -> KumoResult<u64> {
        let value = self.get_value(column)?;
        btoi::btou::<u64>(value).map_err(|e| parse_error(value, e))
    }

    pub fn get_f32<C: ColumnIndex>(&self, column: C) -> KumoResult<f32> {
        let value = self.get_value(column)?;
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<f32>().ok())
            .ok_or_else(|| KumoError::get_value(format!("'{}' is not a float", lossy(value))))
    }

    pub fn get_f64<C: ColumnIndex>(&self, column: C) -> KumoResult<f64> {
        let value = self.get_value(column)?;
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| KumoError::get_value(format!("'{}' is not a double", lossy(value))))
    }
}

fn lossy(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

fn parse_error(value: &[u8], err: btoi::ParseIntegerError) -> KumoError {
    KumoError::get_value(format!("'{}': {}", lossy(value), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::VecRowStream;
    use bytes::Bytes;

    fn users(store: bool) -> ResultSet {
        let columns = vec![
            Column::new("id", ColumnType::LongLong).unsigned(),
            Column::new("name", ColumnType::VarChar),
            Column::new("score", ColumnType::Double),
        ];
        let rows = vec![
            vec![
                Some(Bytes::from("1")),
                Some(Bytes::from("alice")),
                Some(Bytes::from("9.5")),
            ],
            vec![Some(Bytes::from("2")), Some(Bytes::from("bob")), None],
        ];
        ResultSet::from_outcome(
            QueryOutcome::Rows {
                columns,
                stream: Box::new(VecRowStream::new(rows)),
            },
            store,
        )
    }

    #[test]
    fn test_buffered_iteration_and_seek() {
        let mut rs = users(true);
        assert!(rs.is_select());
        assert!(rs.is_seekable());
        assert_eq!(rs.row_count(), Some(2));
        assert_eq!(rs.field_count(), 3);

        assert!(rs.next());
        assert_eq!(rs.tell(), Some(0));
        assert_eq!(rs.get_u64(0).unwrap(), 1);
        assert_eq!(rs.get_string("name").unwrap(), "alice");
        assert_eq!(rs.get_f64("score").unwrap(), 9.5);

        assert!(rs.next());
        assert!(matches!(rs.get_f64("score"), Err(KumoError::ValueIsNull { .. })));
        assert!(rs.is_null(2).unwrap());
        assert!(!rs.next());

        assert!(rs.seek_row(1));
        assert!(rs.next());
        assert_eq!(rs.get_string(1).unwrap(), "bob");
        assert!(!rs.seek_row(2));
    }

    #[test]
    fn test_streaming_is_forward_only() {
        let mut rs = users(false);
        assert!(!rs.is_seekable());
        assert_eq!(rs.row_count(), None);
        assert!(!rs.seek_row(0));

        assert!(rs.next());
        assert_eq!(rs.get_i32("id").unwrap(), 1);
        assert!(rs.next());
        assert_eq!(rs.tell(), Some(1));
        assert!(!rs.next());
        assert_eq!(rs.tell(), None);
    }

    #[test]
    fn test_getter_errors() {
        let mut rs = users(true);
        assert!(matches!(rs.get_string(0), Err(KumoError::GetValue { .. })));
        rs.next();
        assert!(matches!(rs.get_string(7), Err(KumoError::GetValue { .. })));
        assert!(matches!(rs.get_string("missing"), Err(KumoError::GetValue { .. })));
        assert!(matches!(rs.get_i64("name"), Err(KumoError::GetValue { .. })));
    }

    #[test]
    fn test_value_types() {
        let rs = users(true);
        assert_eq!(rs.value_type("id").unwrap(), ValueType::UInt64);
        assert_eq!(rs.value_type("name").unwrap(), ValueType::String);
        assert_eq!(rs.value_type(2).unwrap(), ValueType::Double);
        assert_eq!(rs.column_type("id").unwrap(), ColumnType::LongLong);
        assert_eq!(
            ValueType::from_column(&Column::new("t", ColumnType::Tiny)),
            ValueType::Int32
        );
    }

    #[test]
    fn test_affected_outcome() {
        let rs = ResultSet::from_outcome(
            QueryOutcome::Affected {
                affected_rows: 3,
                last_insert_id: 42,
            },
            true,
        );
        assert!(!rs.is_select());
        assert_eq!(rs.affected_rows(), 3);
        assert_eq!(rs.last_insert_id(), 42);
        assert_eq!(rs.row_count(), Some(0));
    }
}
