// Submodules for separation of concerns
mod eval;
mod parse;
mod pipeline;
mod types;

// Public API re-exports
pub use eval::{apply_update, bson_equal, compare_bson, compare_docs, eval_filter, get_path, project};
pub use parse::{parse_expr, parse_filter, parse_pipeline, parse_projection, parse_sort, parse_update};
pub use pipeline::{eval_expr, run_pipeline};
pub use types::{
    Accumulator, CmpOp, DeleteReport, Expr, Filter, FindSpec, Order, ProjectField, Projection,
    SortSpec, Stage, UpdateDoc, UpdateReport,
};
