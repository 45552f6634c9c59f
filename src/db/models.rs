//! Rollup rule rows as stored, and the normalized form the engine works with.
//!
//! Rows are written by operators (plain SQL against `rollup_rules`), never by
//! the engine. See `services::rules` for how a row becomes a `RollupRule`.

use diesel::prelude::*;
use std::fmt::{self, Display, Formatter};

use crate::db::query::Ident;
use crate::schema;

/// Number of positional aggregate slots (`aggr1..aggr4`) on a rule.
pub const AGGREGATE_SLOTS: usize = 4;

/// Value column of raw measurement tables.
pub const RAW_VALUE_COLUMN: &str = "value";

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::rollup_rules)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RuleRow {
    pub rank: i64,
    pub src_table: String,
    pub src_delete: String,
    pub dst_table: String,
    pub aggr1: String,
    pub aggr2: String,
    pub aggr3: String,
    pub aggr4: String,
    pub period: i64,
    pub retention: i64,
}

impl RuleRow {
    pub fn aggregate_slots(&self) -> [&str; AGGREGATE_SLOTS] {
        [&self.aggr1, &self.aggr2, &self.aggr3, &self.aggr4]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AggregateFn {
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFn {
    /// Parses a slot value. An empty slot is `Ok(None)`.
    pub fn parse(raw: &str) -> Result<Option<Self>, String> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" => Ok(None),
            "sum" => Ok(Some(AggregateFn::Sum)),
            "min" => Ok(Some(AggregateFn::Min)),
            "max" => Ok(Some(AggregateFn::Max)),
            "avg" => Ok(Some(AggregateFn::Avg)),
            _ => Err(format!("unknown aggregate function {:?}", raw)),
        }
    }

    pub fn sql_function(self) -> &'static str {
        match self {
            AggregateFn::Sum => "SUM",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::Avg => "AVG",
        }
    }

    /// Name of the rollup column holding this aggregate (`vsum`, `vmin`, ...).
    pub fn column_name(self) -> &'static str {
        match self {
            AggregateFn::Sum => "vsum",
            AggregateFn::Min => "vmin",
            AggregateFn::Max => "vmax",
            AggregateFn::Avg => "vavg",
        }
    }
}

impl Display for AggregateFn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFn::Sum => "sum",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Avg => "avg",
        };
        f.write_str(name)
    }
}

/// A validated rule with periods already scaled and floored.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupRule {
    pub rank: i64,
    pub source: Ident,
    pub destination: Ident,
    pub delete_source: bool,
    pub aggregates: [Option<AggregateFn>; AGGREGATE_SLOTS],
    pub period_secs: i64,
    /// Zero disables eviction.
    pub retention_secs: i64,
}

impl RollupRule {
    pub fn has_aggregates(&self) -> bool {
        self.aggregates.iter().any(Option::is_some)
    }

    pub fn describe_aggregates(&self) -> String {
        self.aggregates
            .iter()
            .map(|slot| slot.map(|f| f.to_string()).unwrap_or_else(|| "-".to_string()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slots_case_insensitively() {
        assert_eq!(AggregateFn::parse(""), Ok(None));
        assert_eq!(AggregateFn::parse("  "), Ok(None));
        assert_eq!(AggregateFn::parse("AVG"), Ok(Some(AggregateFn::Avg)));
        assert_eq!(AggregateFn::parse(" max "), Ok(Some(AggregateFn::Max)));
        assert!(AggregateFn::parse("median").is_err());
    }

    #[test]
    fn column_names_follow_function() {
        assert_eq!(AggregateFn::Sum.column_name(), "vsum");
        assert_eq!(AggregateFn::Avg.column_name(), "vavg");
        assert_eq!(AggregateFn::Min.sql_function(), "MIN");
    }
}
