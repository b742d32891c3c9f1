use log::{debug, warn};

use super::expr::{CompareOp, CompiledQuery, Expr, Order, Param, Select};
use super::types::{Aggregation, FilterOperator, FilterRule, PivotRequest, ValueSpec};
use super::view::ViewHandle;
use crate::error::QueryError;
use crate::registry::IDENTIFIER_FIELD;

/// Output column name of the `index`-th aggregate.
pub fn value_alias(index: usize) -> String {
    format!("value_{}", index)
}

/// Compiles a pivot request into a grouped query against `view`.
///
/// Dimensions are `rows` then `columns`, deduplicated in order. Null or
/// empty dimension values never form a group. Without `values` the query
/// counts distinct identifiers. Rows come back ordered by the first
/// aggregate, descending; ties are returned in engine order.
pub fn compile_pivot(
    request: &PivotRequest,
    view: &ViewHandle,
    limit: usize,
) -> Result<CompiledQuery, QueryError> {
    let dimensions = dimensions(request);
    if dimensions.is_empty() {
        return Err(QueryError::BadRequest(
            "a pivot needs at least one row or column field".to_string(),
        ));
    }

    let values = if request.values.is_empty() {
        vec![ValueSpec {
            field: IDENTIFIER_FIELD.to_string(),
            aggregation: Aggregation::CountDistinct,
        }]
    } else {
        request.values.clone()
    };

    for field in dimensions.iter().copied().chain(values.iter().map(|v| v.field.as_str())) {
        require_column(view, field)?;
    }

    let mut select = Select::from(view.name());

    for rule in &request.filters {
        if rule.is_inert() {
            debug!("Skipping inert filter rule {:?}", rule);
            continue;
        }
        require_column(view, &rule.field)?;
        if let Some(predicate) = filter_predicate(rule)? {
            select = select.filter(predicate);
        }
    }

    for field in &dimensions {
        select = select
            .column(Expr::column(field))
            .filter(Expr::column(field).not_blank())
            .group_by(Expr::column(field));
    }

    for (i, spec) in values.iter().enumerate() {
        let source = if spec.aggregation.is_numeric() {
            Expr::column(&spec.field).try_number()
        } else {
            Expr::column(&spec.field)
        };
        select = select.column_as(Expr::aggregate(spec.aggregation, source), &value_alias(i));
    }

    Ok(select
        .order_by(Expr::column(&value_alias(0)), Order::Desc)
        .limit(limit)
        .render())
}

fn dimensions(request: &PivotRequest) -> Vec<&str> {
    let mut dimensions: Vec<&str> = Vec::new();
    for field in request.rows.iter().chain(request.columns.iter()) {
        let field = field.as_str();
        if !field.trim().is_empty() && !dimensions.contains(&field) {
            dimensions.push(field);
        }
    }
    dimensions
}

pub(crate) fn require_column(view: &ViewHandle, field: &str) -> Result<(), QueryError> {
    if view.has_column(field) {
        Ok(())
    } else {
        Err(QueryError::BadRequest(format!("unknown field: {}", field)))
    }
}

/// Translates one non-inert rule. `Ok(None)` means the rule contributes no
/// predicate, which is the case for `between` without a second bound.
pub fn filter_predicate(rule: &FilterRule) -> Result<Option<Expr>, QueryError> {
    let field = Expr::column(&rule.field);
    let text = || Param::Text(rule.value.clone());

    let predicate = match rule.operator {
        FilterOperator::Equals => field.compare(CompareOp::Eq, Expr::text(&rule.value)),
        FilterOperator::NotEquals => field.compare(CompareOp::NotEq, Expr::text(&rule.value)),
        FilterOperator::GreaterThan => numeric(field, CompareOp::Gt, rule)?,
        FilterOperator::LessThan => numeric(field, CompareOp::Lt, rule)?,
        FilterOperator::GreaterOrEqual => numeric(field, CompareOp::GtEq, rule)?,
        FilterOperator::LessOrEqual => numeric(field, CompareOp::LtEq, rule)?,
        FilterOperator::Between => {
            let Some(upper) = rule.value2.as_deref().filter(|v| !v.trim().is_empty()) else {
                warn!(
                    "between filter on {} has no second bound and is ignored",
                    rule.field
                );
                return Ok(None);
            };
            let low = parse_number(&rule.field, &rule.value)?;
            let high = parse_number(&rule.field, upper)?;
            field
                .try_number()
                .between(Expr::number(low), Expr::number(high))
        }
        FilterOperator::Contains => Expr::Contains(Box::new(field), text()),
        FilterOperator::StartsWith => Expr::StartsWith(Box::new(field), text()),
        FilterOperator::EndsWith => Expr::EndsWith(Box::new(field), text()),
    };
    Ok(Some(predicate))
}

fn numeric(field: Expr, op: CompareOp, rule: &FilterRule) -> Result<Expr, QueryError> {
    let bound = parse_number(&rule.field, &rule.value)?;
    Ok(field.try_number().compare(op, Expr::number(bound)))
}

fn parse_number(field: &str, value: &str) -> Result<f64, QueryError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| {
            QueryError::BadRequest(format!(
                "filter on {} needs a numeric value, got {:?}",
                field, value
            ))
        })
}
