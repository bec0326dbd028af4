//! SQL parsing and classification logic.
//!
//! Uses sqlparser-rs with the PostgreSQL dialect. Anything the parser does not
//! understand is treated as destructive.

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use super::{Classification, SafetyLevel, StatementType};

/// SQL classifier that parses and classifies SQL queries.
#[derive(Debug)]
pub struct SqlClassifier {
    dialect: PostgreSqlDialect,
}

impl Default for SqlClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlClassifier {
    /// Creates a new SQL classifier.
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    /// Classifies a registry entry. Entries must hold exactly one statement.
    pub fn classify(&self, sql: &str) -> Classification {
        let statements = match Parser::parse_sql(&self.dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                return Classification::rejected(
                    SafetyLevel::Destructive,
                    StatementType::Unknown,
                    format!("could not parse SQL: {e}"),
                )
            }
        };

        match statements.as_slice() {
            [] => Classification::rejected(
                SafetyLevel::Destructive,
                StatementType::Unknown,
                "empty SQL statement",
            ),
            [statement] => {
                let (level, stmt_type) = classify_statement(statement);
                if level == SafetyLevel::Safe {
                    Classification::new(level, stmt_type)
                } else {
                    Classification::rejected(
                        level,
                        stmt_type.clone(),
                        format!("{stmt_type} is not allowed in a read-only extraction"),
                    )
                }
            }
            many => {
                let level = many
                    .iter()
                    .map(|s| classify_statement(s).0)
                    .max_by_key(SafetyLevel::priority)
                    .unwrap_or(SafetyLevel::Destructive);
                Classification::rejected(
                    level,
                    StatementType::Multiple(many.len()),
                    "each query must be a single statement producing one table",
                )
            }
        }
    }
}

/// Convenience function to classify SQL without creating a classifier instance.
pub fn classify_sql(sql: &str) -> Classification {
    SqlClassifier::new().classify(sql)
}

/// Picks the more dangerous of two classifications.
fn worst(
    a: (SafetyLevel, StatementType),
    b: (SafetyLevel, StatementType),
) -> (SafetyLevel, StatementType) {
    if b.0.priority() > a.0.priority() {
        b
    } else {
        a
    }
}

/// Classifies a single parsed statement.
fn classify_statement(statement: &Statement) -> (SafetyLevel, StatementType) {
    match statement {
        Statement::Query(query) => {
            let (level, stmt_type) = classify_query(query);
            if level == SafetyLevel::Safe && query.with.is_some() {
                (level, StatementType::With)
            } else {
                (level, stmt_type)
            }
        }
        Statement::Explain {
            analyze, statement, ..
        } => {
            if *analyze {
                // EXPLAIN ANALYZE executes the inner statement
                let (inner_level, _) = classify_statement(statement);
                (inner_level, StatementType::Explain)
            } else {
                (SafetyLevel::Safe, StatementType::Explain)
            }
        }
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. } => (SafetyLevel::Safe, StatementType::Show),

        Statement::Insert(_) => (SafetyLevel::Mutating, StatementType::Insert),
        Statement::Update { .. } => (SafetyLevel::Mutating, StatementType::Update),
        Statement::Merge { .. } => (SafetyLevel::Mutating, StatementType::Merge),

        Statement::Delete(_) => (SafetyLevel::Destructive, StatementType::Delete),
        Statement::Drop { .. }
        | Statement::Truncate { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateFunction { .. } => (SafetyLevel::Destructive, StatementType::Ddl),
        Statement::Grant { .. } | Statement::Revoke { .. } => {
            (SafetyLevel::Destructive, StatementType::Grant)
        }

        _ => (SafetyLevel::Destructive, StatementType::Unknown),
    }
}

/// Classifies a Query, including its CTEs, returning the most dangerous part.
fn classify_query(query: &Query) -> (SafetyLevel, StatementType) {
    let mut result = (SafetyLevel::Safe, StatementType::Select);

    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            result = worst(result, classify_query(&cte.query));
        }
    }

    worst(result, classify_set_expr(&query.body))
}

/// Classifies a SetExpr, detecting data-modifying bodies.
fn classify_set_expr(set_expr: &SetExpr) -> (SafetyLevel, StatementType) {
    match set_expr {
        SetExpr::Select(select) => classify_select(select),
        SetExpr::Query(query) => classify_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            worst(classify_set_expr(left), classify_set_expr(right))
        }
        SetExpr::Values(_) | SetExpr::Table(_) => (SafetyLevel::Safe, StatementType::Select),
        SetExpr::Insert(stmt) | SetExpr::Update(stmt) => classify_statement(stmt),
        // Remaining bodies are data-modifying CTEs (DELETE / MERGE ... RETURNING)
        #[allow(unreachable_patterns)]
        _ => (SafetyLevel::Destructive, StatementType::Delete),
    }
}

/// Classifies a Select by checking its FROM clause for derived tables.
fn classify_select(select: &Select) -> (SafetyLevel, StatementType) {
    select
        .from
        .iter()
        .map(classify_table_with_joins)
        .fold((SafetyLevel::Safe, StatementType::Select), worst)
}

/// Classifies a TableWithJoins, checking the main relation and all joins.
fn classify_table_with_joins(twj: &TableWithJoins) -> (SafetyLevel, StatementType) {
    twj.joins
        .iter()
        .map(|join| classify_table_factor(&join.relation))
        .fold(classify_table_factor(&twj.relation), worst)
}

/// Classifies a TableFactor, recursing into derived tables.
fn classify_table_factor(factor: &TableFactor) -> (SafetyLevel, StatementType) {
    match factor {
        TableFactor::Derived { subquery, .. } => classify_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => classify_table_with_joins(table_with_joins),
        _ => (SafetyLevel::Safe, StatementType::Select),
    }
}
