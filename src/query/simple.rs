use super::expr::{CompareOp, CompiledQuery, Expr, Order, Select};
use super::pivot::require_column;
use super::types::{Aggregation, SimpleOperation, SimpleQueryRequest};
use super::view::ViewHandle;
use crate::error::QueryError;
use crate::registry::IDENTIFIER_FIELD;

pub const COUNT_ALIAS: &str = "count";

/// `unique`: distinct non-empty values of `field`, ascending.
/// `count`: vehicles per value (optionally per value pair with
/// `pivot_field`), most frequent first.
pub fn compile_simple(
    request: &SimpleQueryRequest,
    view: &ViewHandle,
    max_rows: usize,
) -> Result<CompiledQuery, QueryError> {
    require_column(view, &request.field)?;
    let limit = match request.limit {
        0 => max_rows,
        n => n.min(max_rows),
    };
    let field = || Expr::column(&request.field);

    let select = match (request.operation, request.pivot_field.as_deref()) {
        (SimpleOperation::Unique, None) => Select::from(view.name())
            .distinct()
            .column(field())
            .filter(field().not_blank())
            .order_by(field(), Order::Asc),
        (SimpleOperation::Unique, Some(_)) => {
            return Err(QueryError::BadRequest(
                "pivotField is only supported by the count operation".to_string(),
            ))
        }
        (SimpleOperation::Count, pivot) => {
            let mut select = Select::from(view.name())
                .column(field())
                .filter(field().not_blank())
                .group_by(field());
            if let Some(pivot) = pivot.filter(|p| !p.trim().is_empty()) {
                require_column(view, pivot)?;
                select = select
                    .column(Expr::column(pivot))
                    .filter(Expr::column(pivot).not_blank())
                    .group_by(Expr::column(pivot));
            }
            select
                .column_as(
                    Expr::aggregate(Aggregation::CountDistinct, Expr::column(IDENTIFIER_FIELD)),
                    COUNT_ALIAS,
                )
                .order_by(Expr::column(COUNT_ALIAS), Order::Desc)
        }
    };

    Ok(select.limit(limit).render())
}

/// Plates are stored uppercase without separators.
pub fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}

pub fn compile_lookup(identifier: &str, view: &ViewHandle) -> Result<CompiledQuery, QueryError> {
    let identifier = normalize_identifier(identifier);
    if identifier.is_empty() {
        return Err(QueryError::BadRequest(format!(
            "{} must not be empty",
            IDENTIFIER_FIELD
        )));
    }
    Ok(Select::from(view.name())
        .column(Expr::Wildcard)
        .filter(Expr::column(IDENTIFIER_FIELD).compare(CompareOp::Eq, Expr::text(&identifier)))
        .limit(1)
        .render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::Param;
    use crate::query::view::{build_unified_view, LoadedTable};

    fn view() -> ViewHandle {
        let table = LoadedTable {
            dataset: "gekentekende_voertuigen".to_string(),
            table: "ds_gekentekende_voertuigen".to_string(),
            priority: 1,
            columns: vec!["kenteken".to_string(), "merk".to_string(), "inrichting".to_string()],
        };
        build_unified_view("gekentekende_voertuigen", &[table]).unwrap()
    }

    fn request(operation: SimpleOperation, limit: usize, pivot: Option<&str>) -> SimpleQueryRequest {
        SimpleQueryRequest {
            field: "merk".to_string(),
            operation,
            limit,
            pivot_field: pivot.map(str::to_string),
        }
    }

    #[test]
    fn unique_lists_distinct_values() {
        let query = compile_simple(&request(SimpleOperation::Unique, 50, None), &view(), 10_000).unwrap();
        assert_eq!(
            query.sql,
            "SELECT DISTINCT \"merk\" FROM \"voertuigen\" \
             WHERE (\"merk\" IS NOT NULL AND \"merk\" <> '') ORDER BY \"merk\" ASC LIMIT 50"
        );
    }

    #[test]
    fn count_with_pivot_groups_by_both_fields() {
        let query = compile_simple(
            &request(SimpleOperation::Count, 20, Some("inrichting")),
            &view(),
            10_000,
        )
        .unwrap();
        assert!(query.sql.contains("GROUP BY \"merk\", \"inrichting\""));
        assert!(query.sql.contains("COUNT(DISTINCT \"kenteken\") AS \"count\""));
    }

    #[test]
    fn limit_is_capped() {
        let query =
            compile_simple(&request(SimpleOperation::Count, 50_000, None), &view(), 10_000).unwrap();
        assert!(query.sql.ends_with("LIMIT 10000"));
    }

    #[test]
    fn unique_rejects_pivot_field() {
        assert!(matches!(
            compile_simple(&request(SimpleOperation::Unique, 5, Some("inrichting")), &view(), 10),
            Err(QueryError::BadRequest(_))
        ));
    }

    #[test]
    fn lookup_normalizes_plate() {
        assert_eq!(normalize_identifier(" ab-12 cd "), "AB12CD");
        let query = compile_lookup("ab-12-cd", &view()).unwrap();
        assert_eq!(query.params, vec![Param::Text("AB12CD".to_string())]);
        assert!(query.sql.starts_with("SELECT * FROM \"voertuigen\""));
    }
}
