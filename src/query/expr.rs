//! Typed SQL expressions rendered in one place.
//!
//! User-supplied values only ever become bound parameters; identifiers are
//! quoted with [`quote_ident`]. Nothing else in the crate writes SQL text
//! containing request data.

use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;
use std::fmt;

use super::types::Aggregation;

#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Number(f64),
}

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Param::Text(value) => value.to_sql(),
            Param::Number(value) => value.to_sql(),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Text(value) => write!(f, "{}", value),
            Param::Number(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
}

impl CompareOp {
    fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::GtEq => ">=",
            CompareOp::LtEq => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    /// `*`, for whole-row projections.
    Wildcard,
    Value(Param),
    /// Best-effort numeric coercion; NULL when the value is not a number.
    TryNumber(Box<Expr>),
    Compare {
        left: Box<Expr>,
        op: CompareOp,
        right: Box<Expr>,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    Contains(Box<Expr>, Param),
    StartsWith(Box<Expr>, Param),
    EndsWith(Box<Expr>, Param),
    /// Neither NULL nor the empty string.
    NotBlank(Box<Expr>),
    Aggregate {
        func: Aggregation,
        expr: Box<Expr>,
    },
}

impl Expr {
    pub fn column(name: &str) -> Self {
        Expr::Column(name.to_string())
    }

    pub fn text(value: &str) -> Self {
        Expr::Value(Param::Text(value.to_string()))
    }

    pub fn number(value: f64) -> Self {
        Expr::Value(Param::Number(value))
    }

    pub fn try_number(self) -> Self {
        Expr::TryNumber(Box::new(self))
    }

    pub fn compare(self, op: CompareOp, right: Expr) -> Self {
        Expr::Compare {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    pub fn between(self, low: Expr, high: Expr) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low),
            high: Box::new(high),
        }
    }

    pub fn not_blank(self) -> Self {
        Expr::NotBlank(Box::new(self))
    }

    pub fn aggregate(func: Aggregation, expr: Expr) -> Self {
        Expr::Aggregate {
            func,
            expr: Box::new(expr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A single-table `SELECT`.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    from: String,
    distinct: bool,
    projections: Vec<(Expr, Option<String>)>,
    filters: Vec<Expr>,
    group_by: Vec<Expr>,
    order_by: Vec<(Expr, Order)>,
    limit: Option<usize>,
}

impl Select {
    pub fn from(table: &str) -> Self {
        Self {
            from: table.to_string(),
            distinct: false,
            projections: Vec::new(),
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn column(mut self, expr: Expr) -> Self {
        self.projections.push((expr, None));
        self
    }

    pub fn column_as(mut self, expr: Expr, alias: &str) -> Self {
        self.projections.push((expr, Some(alias.to_string())));
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filters.push(expr);
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, order: Order) -> Self {
        self.order_by.push((expr, order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn render(&self) -> CompiledQuery {
        let mut w = SqlWriter::default();
        w.push("SELECT ");
        if self.distinct {
            w.push("DISTINCT ");
        }
        if self.projections.is_empty() {
            w.push("*");
        }
        for (i, (expr, alias)) in self.projections.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.expr(expr);
            if let Some(alias) = alias {
                w.push(" AS ");
                w.ident(alias);
            }
        }
        w.push(" FROM ");
        w.ident(&self.from);

        if !self.filters.is_empty() {
            w.push(" WHERE ");
            w.joined(&self.filters, " AND ");
        }
        if !self.group_by.is_empty() {
            w.push(" GROUP BY ");
            w.joined(&self.group_by, ", ");
        }
        for (i, (expr, order)) in self.order_by.iter().enumerate() {
            w.push(if i == 0 { " ORDER BY " } else { ", " });
            w.expr(expr);
            w.push(match order {
                Order::Asc => " ASC",
                Order::Desc => " DESC",
            });
        }
        if let Some(limit) = self.limit {
            w.push(&format!(" LIMIT {}", limit));
        }
        w.finish()
    }
}

/// Rendered statement plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Param>,
}

#[derive(Default)]
struct SqlWriter {
    sql: String,
    params: Vec<Param>,
}

impl SqlWriter {
    fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    fn ident(&mut self, name: &str) {
        self.sql.push_str(&quote_ident(name));
    }

    fn param(&mut self, param: &Param) {
        self.sql.push('?');
        self.params.push(param.clone());
    }

    fn joined(&mut self, exprs: &[Expr], separator: &str) {
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.push(separator);
            }
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Column(name) => self.ident(name),
            Expr::Wildcard => self.push("*"),
            Expr::Value(param) => self.param(param),
            Expr::TryNumber(inner) => {
                self.push("try_number(");
                self.expr(inner);
                self.push(")");
            }
            Expr::Compare { left, op, right } => {
                self.expr(left);
                self.push(" ");
                self.push(op.as_sql());
                self.push(" ");
                self.expr(right);
            }
            Expr::Between { expr, low, high } => {
                self.expr(expr);
                self.push(" BETWEEN ");
                self.expr(low);
                self.push(" AND ");
                self.expr(high);
            }
            // instr() and substr() compare bytes exactly, unlike LIKE.
            Expr::Contains(inner, needle) => {
                self.push("instr(");
                self.expr(inner);
                self.push(", ");
                self.param(needle);
                self.push(") > 0");
            }
            Expr::StartsWith(inner, prefix) => {
                self.push("substr(");
                self.expr(inner);
                self.push(", 1, length(");
                self.param(prefix);
                self.push(")) = ");
                self.param(prefix);
            }
            Expr::EndsWith(inner, suffix) => {
                self.push("substr(");
                self.expr(inner);
                self.push(", -length(");
                self.param(suffix);
                self.push(")) = ");
                self.param(suffix);
            }
            Expr::NotBlank(inner) => {
                self.push("(");
                self.expr(inner);
                self.push(" IS NOT NULL AND ");
                self.expr(inner);
                self.push(" <> '')");
            }
            Expr::Aggregate { func, expr } => {
                let name = match func {
                    Aggregation::Count | Aggregation::CountDistinct => "COUNT",
                    Aggregation::Sum => "SUM",
                    Aggregation::Avg => "AVG",
                    Aggregation::Min => "MIN",
                    Aggregation::Max => "MAX",
                };
                self.push(name);
                self.push("(");
                if *func == Aggregation::CountDistinct {
                    self.push("DISTINCT ");
                }
                self.expr(expr);
                self.push(")");
            }
        }
    }

    fn finish(self) -> CompiledQuery {
        CompiledQuery {
            sql: self.sql,
            params: self.params,
        }
    }
}

/// Double-quotes an identifier, doubling any embedded quote.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
