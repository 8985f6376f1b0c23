use crate::errors::DbError;
use bson::{Bson, Document};

use super::types::{
    Accumulator, CmpOp, Expr, Filter, MAX_IN_SET, MAX_PIPELINE_STAGES, MAX_PROJECTION_FIELDS,
    MAX_SORT_FIELDS, MAX_UPDATE_FIELDS, Order, ProjectField, Projection, SortSpec, Stage,
    UpdateDoc,
};

fn query_err(msg: impl Into<String>) -> DbError {
    DbError::QueryError(msg.into())
}

fn is_operator_doc(d: &Document) -> bool {
    !d.is_empty() && d.keys().all(|k| k.starts_with('$'))
}

fn clause_list(op: &str, v: &Bson) -> Result<Vec<Filter>, DbError> {
    let Bson::Array(items) = v else {
        return Err(query_err(format!("{op} must be an array")));
    };
    if items.is_empty() {
        return Err(query_err(format!("{op} must be a nonempty array")));
    }
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => parse_filter(d),
            _ => Err(query_err(format!("{op} entries must be objects"))),
        })
        .collect()
}

fn in_values(op: &str, v: &Bson) -> Result<Vec<Bson>, DbError> {
    match v {
        Bson::Array(items) if items.len() > MAX_IN_SET => {
            Err(query_err(format!("{op} list too long: {}", items.len())))
        }
        Bson::Array(items) => Ok(items.clone()),
        _ => Err(query_err(format!("{op} needs an array"))),
    }
}

fn field_operators(path: &str, ops: &Document) -> Result<Vec<Filter>, DbError> {
    let mut out = Vec::with_capacity(ops.len());
    for (op, v) in ops {
        let cmp = |op| Filter::Cmp { path: path.to_string(), op, value: v.clone() };
        out.push(match op.as_str() {
            "$eq" => cmp(CmpOp::Eq),
            "$ne" => cmp(CmpOp::Ne),
            "$gt" => cmp(CmpOp::Gt),
            "$gte" => cmp(CmpOp::Gte),
            "$lt" => cmp(CmpOp::Lt),
            "$lte" => cmp(CmpOp::Lte),
            "$in" => Filter::In { path: path.to_string(), values: in_values(op, v)? },
            "$nin" => Filter::Nin { path: path.to_string(), values: in_values(op, v)? },
            "$exists" => Filter::Exists { path: path.to_string(), exists: truthy(v) },
            "$not" => match v {
                Bson::Document(inner) if is_operator_doc(inner) => {
                    Filter::Not(Box::new(conjoin(field_operators(path, inner)?)))
                }
                _ => return Err(query_err("$not needs an operator expression")),
            },
            other => return Err(query_err(format!("unknown operator: {other}"))),
        });
    }
    Ok(out)
}

fn conjoin(mut clauses: Vec<Filter>) -> Filter {
    match clauses.len() {
        0 => Filter::True,
        1 => clauses.remove(0),
        _ => Filter::And(clauses),
    }
}

fn truthy(v: &Bson) -> bool {
    match v {
        Bson::Boolean(b) => *b,
        Bson::Int32(i) => *i != 0,
        Bson::Int64(i) => *i != 0,
        Bson::Double(f) => *f != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

/// Parses a query document (`{field: value}`, `{field: {$op: value}}`,
/// `$and`/`$or`/`$nor`). Top-level clauses are implicitly AND-ed.
///
/// # Errors
/// Returns `DbError::QueryError` on unknown operators or malformed clauses.
pub fn parse_filter(doc: &Document) -> Result<Filter, DbError> {
    let mut clauses = Vec::with_capacity(doc.len());
    for (key, v) in doc {
        match key.as_str() {
            "$and" => clauses.push(Filter::And(clause_list(key, v)?)),
            "$or" => clauses.push(Filter::Or(clause_list(key, v)?)),
            "$nor" => clauses.push(Filter::Nor(clause_list(key, v)?)),
            k if k.starts_with('$') => {
                return Err(query_err(format!("unknown top level operator: {k}")));
            }
            path => match v {
                Bson::Document(ops) if is_operator_doc(ops) => {
                    clauses.extend(field_operators(path, ops)?);
                }
                _ => clauses.push(Filter::Cmp {
                    path: path.to_string(),
                    op: CmpOp::Eq,
                    value: v.clone(),
                }),
            },
        }
    }
    Ok(conjoin(clauses))
}

/// # Errors
/// Returns an error if the update is not made of `$set`/`$inc`/`$unset` operators.
pub fn parse_update(doc: &Document) -> Result<UpdateDoc, DbError> {
    if doc.is_empty() {
        return Err(query_err("update document must not be empty"));
    }
    let mut out = UpdateDoc::default();
    for (op, v) in doc {
        let Bson::Document(fields) = v else {
            return Err(query_err(format!("modifier {op} expects an object")));
        };
        if fields.len() > MAX_UPDATE_FIELDS {
            return Err(query_err(format!("{op} names too many fields: {}", fields.len())));
        }
        match op.as_str() {
            "$set" => {
                out.set.extend(
                    fields.iter().map(|(k, v)| (k.clone(), v.clone())),
                );
            }
            "$inc" => {
                for (k, v) in fields {
                    if !matches!(v, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
                        return Err(query_err("$inc requires numeric"));
                    }
                    out.inc.push((k.clone(), v.clone()));
                }
            }
            "$unset" => out.unset.extend(fields.keys().cloned()),
            k if k.starts_with('$') => return Err(query_err(format!("unknown modifier: {k}"))),
            _ => return Err(query_err("update document requires atomic operators")),
        }
    }
    Ok(out)
}

fn direction(field: &str, v: &Bson) -> Result<Order, DbError> {
    #[allow(clippy::cast_possible_truncation)]
    let n = match v {
        Bson::Int32(i) => i64::from(*i),
        Bson::Int64(i) => *i,
        Bson::Double(f) => *f as i64,
        _ => return Err(query_err(format!("invalid sort direction for {field}"))),
    };
    match n {
        1 => Ok(Order::Asc),
        -1 => Ok(Order::Desc),
        _ => Err(query_err(format!("sort direction for {field} must be 1 or -1"))),
    }
}

/// # Errors
/// Returns an error for directions other than `1` / `-1`.
pub fn parse_sort(doc: &Document) -> Result<Vec<SortSpec>, DbError> {
    if doc.len() > MAX_SORT_FIELDS {
        return Err(query_err(format!("sort spec too long: {}", doc.len())));
    }
    doc.iter()
        .map(|(field, v)| Ok(SortSpec { field: field.clone(), order: direction(field, v)? }))
        .collect()
}

/// First pair of paths where one is a prefix of the other, e.g. `a` and `a.b`.
fn overlapping_path<'a>(paths: &[&'a str]) -> Option<(&'a str, &'a str)> {
    paths.iter().find_map(|a| {
        paths
            .iter()
            .find(|b| b.len() > a.len() && b.starts_with(*a) && b.as_bytes()[a.len()] == b'.')
            .map(|b| (*a, *b))
    })
}

/// # Errors
/// Returns an error when inclusion and exclusion are mixed (other than `_id`).
/// Also rejects overlapping paths and oversized projections.
pub fn parse_projection(doc: &Document) -> Result<Projection, DbError> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut keep_id = true;
    if doc.len() > MAX_PROJECTION_FIELDS {
        return Err(query_err(format!("projection too long: {}", doc.len())));
    }
    let paths: Vec<&str> = doc.keys().map(String::as_str).collect();
    if let Some((a, b)) = overlapping_path(&paths) {
        return Err(query_err(format!("path collision at {b} (remainder of {a})")));
    }
    for (field, v) in doc {
        let on = truthy(v);
        if field == "_id" {
            keep_id = on;
        } else if on {
            include.push(field.clone());
        } else {
            exclude.push(field.clone());
        }
    }
    match (include.is_empty(), exclude.is_empty()) {
        (false, false) => Err(query_err("cannot mix inclusion and exclusion in projection")),
        (false, true) => Ok(Projection::Include { fields: include, keep_id }),
        (true, _) if !keep_id => {
            exclude.push("_id".to_string());
            Ok(Projection::Exclude(exclude))
        }
        (true, _) => Ok(Projection::Exclude(exclude)),
    }
}

fn expr_pair(op: &str, v: &Bson) -> Result<(Box<Expr>, Box<Expr>), DbError> {
    match v {
        Bson::Array(args) if args.len() == 2 => {
            Ok((Box::new(parse_expr(&args[0])?), Box::new(parse_expr(&args[1])?)))
        }
        _ => Err(query_err(format!("{op} takes exactly 2 arguments"))),
    }
}

fn expr_list(op: &str, v: &Bson) -> Result<Vec<Expr>, DbError> {
    match v {
        Bson::Array(args) => args.iter().map(parse_expr).collect(),
        _ => Err(query_err(format!("{op} takes an array of arguments"))),
    }
}

/// Parses an aggregation expression: `"$field"`, literal, operator object
/// or an object of named sub-expressions.
///
/// # Errors
/// Returns an error on unknown expression operators.
pub fn parse_expr(v: &Bson) -> Result<Expr, DbError> {
    match v {
        Bson::String(s) if s.starts_with('$') && s.len() > 1 => Ok(Expr::Field(s[1..].to_string())),
        Bson::Document(d) if d.len() == 1 && is_operator_doc(d) => {
            let Some((op, arg)) = d.iter().next() else {
                return Err(query_err("empty expression"));
            };
            Ok(match op.as_str() {
                "$literal" => Expr::Literal(arg.clone()),
                "$add" => Expr::Add(expr_list(op, arg)?),
                "$multiply" => Expr::Multiply(expr_list(op, arg)?),
                "$subtract" => {
                    let (a, b) = expr_pair(op, arg)?;
                    Expr::Subtract(a, b)
                }
                "$divide" => {
                    let (a, b) = expr_pair(op, arg)?;
                    Expr::Divide(a, b)
                }
                "$mod" => {
                    let (a, b) = expr_pair(op, arg)?;
                    Expr::Mod(a, b)
                }
                "$floor" => match arg {
                    Bson::Array(args) if args.len() == 1 => Expr::Floor(Box::new(parse_expr(&args[0])?)),
                    other => Expr::Floor(Box::new(parse_expr(other)?)),
                },
                other => return Err(query_err(format!("unrecognized expression operator: {other}"))),
            })
        }
        Bson::Document(d) => {
            if d.keys().any(|k| k.starts_with('$')) {
                return Err(query_err("expression objects cannot mix operators and fields"));
            }
            let fields = d
                .iter()
                .map(|(k, v)| Ok((k.clone(), parse_expr(v)?)))
                .collect::<Result<Vec<_>, DbError>>()?;
            Ok(Expr::Object(fields))
        }
        other => Ok(Expr::Literal(other.clone())),
    }
}

fn parse_accumulator(field: &str, v: &Bson) -> Result<Accumulator, DbError> {
    let Bson::Document(d) = v else {
        return Err(query_err(format!("group field {field} must be an accumulator object")));
    };
    let Some((op, arg)) = d.iter().next().filter(|_| d.len() == 1) else {
        return Err(query_err(format!("group field {field} must specify one accumulator")));
    };
    Ok(match op.as_str() {
        "$sum" => Accumulator::Sum(parse_expr(arg)?),
        "$avg" => Accumulator::Avg(parse_expr(arg)?),
        "$min" => Accumulator::Min(parse_expr(arg)?),
        "$max" => Accumulator::Max(parse_expr(arg)?),
        "$first" => Accumulator::First(parse_expr(arg)?),
        "$count" => Accumulator::Count,
        other => return Err(query_err(format!("unknown group operator: {other}"))),
    })
}

fn usize_arg(stage: &str, v: &Bson) -> Result<usize, DbError> {
    let n = match v {
        Bson::Int32(i) => i64::from(*i),
        Bson::Int64(i) => *i,
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(f) if f.fract() == 0.0 => *f as i64,
        _ => return Err(query_err(format!("{stage} requires an integer"))),
    };
    usize::try_from(n).map_err(|_| query_err(format!("{stage} must be non-negative")))
}

fn parse_stage(stage: &Document) -> Result<Stage, DbError> {
    let Some((name, arg)) = stage.iter().next().filter(|_| stage.len() == 1) else {
        return Err(query_err("a pipeline stage must have exactly one field"));
    };
    let arg_doc = || match arg {
        Bson::Document(d) => Ok(d),
        _ => Err(query_err(format!("{name} specification must be an object"))),
    };
    Ok(match name.as_str() {
        "$match" => Stage::Match(parse_filter(arg_doc()?)?),
        "$sort" => Stage::Sort(parse_sort(arg_doc()?)?),
        "$skip" => Stage::Skip(usize_arg(name, arg)?),
        "$limit" => match usize_arg(name, arg)? {
            0 => return Err(query_err("the limit must be positive")),
            n => Stage::Limit(n),
        },
        "$group" => {
            let spec = arg_doc()?;
            let id = spec
                .get("_id")
                .ok_or_else(|| query_err("a group specification must include an _id"))?;
            let fields = spec
                .iter()
                .filter(|(k, _)| k.as_str() != "_id")
                .map(|(k, v)| Ok((k.clone(), parse_accumulator(k, v)?)))
                .collect::<Result<Vec<_>, DbError>>()?;
            Stage::Group { id: parse_expr(id)?, fields }
        }
        "$project" => {
            let spec = arg_doc()?;
            if spec.is_empty() {
                return Err(query_err("$project requires at least one output field"));
            }
            let fields = spec
                .iter()
                .map(|(k, v)| {
                    let f = match v {
                        Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
                            if truthy(v) { ProjectField::Include } else { ProjectField::Exclude }
                        }
                        other => ProjectField::Computed(parse_expr(other)?),
                    };
                    Ok((k.clone(), f))
                })
                .collect::<Result<Vec<_>, DbError>>()?;
            Stage::Project(fields)
        }
        other => return Err(query_err(format!("unrecognized pipeline stage name: {other}"))),
    })
}

/// # Errors
/// Returns an error on the first malformed or unsupported stage.
pub fn parse_pipeline(stages: &[Document]) -> Result<Vec<Stage>, DbError> {
    if stages.len() > MAX_PIPELINE_STAGES {
        return Err(query_err(format!("pipeline too long: {}", stages.len())));
    }
    stages.iter().map(parse_stage).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn implicit_and_of_fields() {
        let f = parse_filter(&doc! {"in_stock": true, "published_year": {"$gt": 2010}}).unwrap();
        let Filter::And(parts) = f else { panic!("expected And") };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], Filter::Cmp { path, op: CmpOp::Gt, .. } if path == "published_year"));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert_eq!(parse_filter(&doc! {}).unwrap(), Filter::True);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = parse_filter(&doc! {"price": {"$near": 3}}).unwrap_err();
        assert!(matches!(err, DbError::QueryError(m) if m.contains("$near")));
    }

    #[test]
    fn update_requires_operators() {
        assert!(parse_update(&doc! {"price": 1}).is_err());
        let u = parse_update(&doc! {"$set": {"price": 15.99}}).unwrap();
        assert_eq!(u.set, vec![("price".to_string(), Bson::Double(15.99))]);
    }

    #[test]
    fn projection_keeps_id_by_default() {
        let p = parse_projection(&doc! {"title": 1, "author": 1}).unwrap();
        assert_eq!(
            p,
            Projection::Include { fields: vec!["title".into(), "author".into()], keep_id: true }
        );
        assert!(parse_projection(&doc! {"title": 1, "price": 0}).is_err());
    }

    #[test]
    fn decade_stage_parses_nested_arithmetic() {
        let stages = parse_pipeline(&[doc! {
            "$project": {"decade": {"$subtract": [
                {"$divide": ["$published_year", 10]},
                {"$mod": [{"$divide": ["$published_year", 10]}, 1]},
            ]}}
        }])
        .unwrap();
        let Stage::Project(fields) = &stages[0] else { panic!("expected project") };
        assert!(matches!(&fields[0].1, ProjectField::Computed(Expr::Subtract(..))));
    }

    #[test]
    fn sort_direction_must_be_unit() {
        assert!(parse_sort(&doc! {"price": 2}).is_err());
        assert_eq!(parse_sort(&doc! {"price": -1}).unwrap()[0].order, Order::Desc);
    }

    #[test]
    fn oversized_lists_are_rejected_not_truncated() {
        let many: Vec<Bson> = (0..=i32::try_from(MAX_IN_SET).unwrap()).map(Bson::Int32).collect();
        assert!(parse_filter(&doc! {"published_year": {"$in": many}}).is_err());

        let mut set = Document::new();
        for i in 0..=MAX_UPDATE_FIELDS {
            set.insert(format!("f{i}"), 1);
        }
        assert!(parse_update(&doc! {"$set": set}).is_err());

        let mut proj = Document::new();
        for i in 0..=MAX_PROJECTION_FIELDS {
            proj.insert(format!("f{i}"), 1);
        }
        assert!(parse_projection(&proj).is_err());
    }

    #[test]
    fn overlapping_projection_paths_are_rejected() {
        assert!(parse_projection(&doc! {"stock": 1, "stock.count": 1}).is_err());
        assert!(parse_projection(&doc! {"stock": 1, "stockist": 1}).is_ok());
    }
}
