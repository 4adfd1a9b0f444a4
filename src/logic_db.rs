/// Logic databases and table splits
use crate::config::{ConfigError, LogicDbOption};
use crate::error::{KumoError, KumoResult};
use crate::expr::{ShardEvaluator, SplitExpr};
use fnv::FnvHashMap;

/// One logical table split into `sub_tables` physical tables
#[derive(Debug, Clone)]
pub struct TableSplit {
    pub table: String,
    pub sub_tables: u32,
    pub function: SplitExpr,
}

impl TableSplit {
    /// A table with an empty function is not split
    pub fn is_split(&self) -> bool {
        !self.function.is_empty()
    }
}

/// A named set of table-split rules
#[derive(Debug, Clone, Default)]
pub struct LogicDb {
    name: String,
    splits: FnvHashMap<String, TableSplit>,
}

impl LogicDb {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            splits: FnvHashMap::default(),
        }
    }

    pub fn from_option(option: &LogicDbOption, evaluator: &ShardEvaluator) -> KumoResult<Self> {
        let mut db = LogicDb::new(option.name.clone());
        for split in &option.table_splits {
            db.add_table_split(
                &split.name,
                split.sub_tables,
                &split.table_split_function,
                evaluator,
            )?;
        }
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a split for one table, or several as `"a|b|c"`
    pub fn add_table_split(
        &mut self,
        names: &str,
        sub_tables: u32,
        function: &str,
        evaluator: &ShardEvaluator,
    ) -> KumoResult<()> {
        if sub_tables == 0 {
            return Err(invalid(format!(
                "table '{}' in logic db '{}' must have at least one sub table",
                names, self.name
            )));
        }

        let function = evaluator.parse(function).map_err(|e| {
            invalid(format!(
                "bad split function for '{}' in logic db '{}': {}",
                names, self.name, e
            ))
        })?;
        if sub_tables > 1 && function.is_empty() {
            return Err(invalid(format!(
                "table '{}' has {} sub tables but no split function",
                names, sub_tables
            )));
        }

        let tables: Vec<&str> = names
            .split('|')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if tables.is_empty() {
            return Err(invalid(format!(
                "empty table name in logic db '{}'",
                self.name
            )));
        }

        for table in tables {
            self.splits.insert(
                table.to_string(),
                TableSplit {
                    table: table.to_string(),
                    sub_tables,
                    function: function.clone(),
                },
            );
        }
        Ok(())
    }

    pub fn table_split(&self, table: &str) -> Option<&TableSplit> {
        self.splits.get(table)
    }

    pub fn is_split(&self, table: &str) -> bool {
        self.splits.get(table).map_or(false, TableSplit::is_split)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.splits.keys().map(String::as_str)
    }

    /// Sub-table index of `table` for `key`.
    ///
    /// `Ok(None)` means the table is not split here and keeps its name.
    pub fn table_id(
        &self,
        table: &str,
        key: Option<u32>,
        evaluator: &ShardEvaluator,
    ) -> KumoResult<Option<u32>> {
        let split = match self.splits.get(table) {
            Some(split) if split.is_split() => split,
            _ => return Ok(None),
        };
        let key = key.ok_or_else(|| KumoError::NoPartitionKey {
            table: table.to_string(),
        })?;
        let value = evaluator.eval(&split.function, key)?;
        Ok(Some(value % split.sub_tables))
    }
}

fn invalid(message: String) -> KumoError {
    KumoError::Config(ConfigError::ValidationError(message))
}
