//! Analytical queries over the downloaded datasets.

pub mod engine;
pub mod expr;
pub mod pivot;
pub mod simple;
pub mod types;
pub mod view;

pub use engine::{Engine, LoadStamp};
pub use types::{
    Aggregation, FilterOperator, FilterRule, PivotRequest, QueryMetadata, QueryResponse,
    SimpleOperation, SimpleQueryRequest, ValueSpec,
};
pub use view::{ColumnProvenance, ViewHandle, VIEW_NAME};
