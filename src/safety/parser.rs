//! SQL parsing and classification.
//!
//! Uses sqlparser-rs with the generic dialect, since the platform fronts
//! many database engines.

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::{Classification, SafetyLevel, StatementType};

type Verdict = (SafetyLevel, StatementType);

/// Parses and classifies SQL.
#[derive(Debug, Default)]
pub struct SqlClassifier {
    dialect: GenericDialect,
}

impl SqlClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `sql`. Unparseable or empty SQL counts as destructive.
    pub fn classify(&self, sql: &str) -> Classification {
        let statements = match Parser::parse_sql(&self.dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                return Classification {
                    level: SafetyLevel::Destructive,
                    statement_type: StatementType::Unknown,
                    parse_error: Some(e.to_string()),
                }
            }
        };

        match statements.as_slice() {
            [] => Classification::new(SafetyLevel::Destructive, StatementType::Unknown),
            [single] => {
                let (level, statement_type) = classify_statement(single);
                Classification::new(level, statement_type)
            }
            many => {
                let (level, statement_type) = many
                    .iter()
                    .map(classify_statement)
                    .fold(read_only(), worse);
                Classification::new(level, StatementType::Multiple(Box::new(statement_type)))
            }
        }
    }
}

/// Classifies SQL without keeping a classifier around.
pub fn classify_sql(sql: &str) -> Classification {
    SqlClassifier::new().classify(sql)
}

fn read_only() -> Verdict {
    (SafetyLevel::ReadOnly, StatementType::Select)
}

/// Keeps the more dangerous verdict; ties keep the first.
fn worse(current: Verdict, candidate: Verdict) -> Verdict {
    if candidate.0 > current.0 {
        candidate
    } else {
        current
    }
}

fn classify_statement(statement: &Statement) -> Verdict {
    match statement {
        Statement::Query(query) => classify_query(query),
        Statement::Explain {
            analyze, statement, ..
        } => {
            // EXPLAIN ANALYZE runs the statement.
            let level = if *analyze {
                classify_statement(statement).0
            } else {
                SafetyLevel::ReadOnly
            };
            (level, StatementType::Explain)
        }
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. } => (SafetyLevel::ReadOnly, StatementType::Show),

        Statement::Insert(_) => (SafetyLevel::Mutating, StatementType::Insert),
        Statement::Update { .. } => (SafetyLevel::Mutating, StatementType::Update),
        Statement::Merge { .. } => (SafetyLevel::Mutating, StatementType::Merge),

        Statement::Delete(_) => (SafetyLevel::Destructive, StatementType::Delete),
        Statement::Drop { .. } => (SafetyLevel::Destructive, StatementType::Drop),
        Statement::Truncate { .. } => (SafetyLevel::Destructive, StatementType::Truncate),
        Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. } => (SafetyLevel::Destructive, StatementType::Alter),
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateRole { .. } => (SafetyLevel::Destructive, StatementType::Create),
        Statement::Grant { .. } => (SafetyLevel::Destructive, StatementType::Grant),
        Statement::Revoke { .. } => (SafetyLevel::Destructive, StatementType::Revoke),

        _ => (SafetyLevel::Destructive, StatementType::Unknown),
    }
}

/// Walks CTEs and the body; data-modifying CTEs make the whole query unsafe.
fn classify_query(query: &Query) -> Verdict {
    let ctes = query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .map(|cte| classify_query(&cte.query));
    let verdict = ctes.fold(read_only(), worse);
    worse(verdict, classify_set_expr(&query.body))
}

fn classify_set_expr(set_expr: &SetExpr) -> Verdict {
    match set_expr {
        SetExpr::Select(select) => classify_select(select),
        SetExpr::Query(query) => classify_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            worse(classify_set_expr(left), classify_set_expr(right))
        }
        SetExpr::Values(_) | SetExpr::Table(_) => read_only(),
        SetExpr::Insert(stmt) | SetExpr::Update(stmt) => classify_statement(stmt),
        #[allow(unreachable_patterns)]
        _ => (SafetyLevel::Destructive, StatementType::Unknown),
    }
}

fn classify_select(select: &Select) -> Verdict {
    select
        .from
        .iter()
        .map(classify_table_with_joins)
        .fold(read_only(), worse)
}

fn classify_table_with_joins(twj: &TableWithJoins) -> Verdict {
    twj.joins
        .iter()
        .map(|join| classify_table_factor(&join.relation))
        .fold(classify_table_factor(&twj.relation), worse)
}

fn classify_table_factor(factor: &TableFactor) -> Verdict {
    match factor {
        TableFactor::Derived { subquery, .. } => classify_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => classify_table_with_joins(table_with_joins),
        _ => read_only(),
    }
}
