//! In-memory evaluation of aggregation pipelines.
//!
//! Groups are emitted in the order their key was first seen and `$sort` is
//! stable, so ties keep that first-seen order.

use crate::errors::DbError;
use bson::{Bson, Document};

use super::eval::{add_numbers, as_f64, bson_equal, compare_bson, compare_docs, eval_filter, get_path};
use super::types::{Accumulator, Expr, ProjectField, Stage};

fn query_err(msg: impl Into<String>) -> DbError {
    DbError::QueryError(msg.into())
}

fn is_nullish(v: &Bson) -> bool {
    matches!(v, Bson::Null | Bson::Undefined)
}

fn int_of(v: &Bson) -> Option<i64> {
    match v {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        _ => None,
    }
}

fn number(op: &str, v: &Bson) -> Result<f64, DbError> {
    as_f64(v).ok_or_else(|| query_err(format!("{op} only supports numeric types, not {v}")))
}

fn narrow(n: i64) -> Bson {
    i32::try_from(n).map_or(Bson::Int64(n), Bson::Int32)
}

/// Evaluates an expression against one document. Missing fields evaluate
/// to `null`, and arithmetic on `null` yields `null`.
///
/// # Errors
/// Returns an error for non-numeric arithmetic operands or division by zero.
#[allow(clippy::cast_precision_loss)]
pub fn eval_expr(doc: &Document, expr: &Expr) -> Result<Bson, DbError> {
    Ok(match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Field(path) => get_path(doc, path).cloned().unwrap_or(Bson::Null),
        Expr::Object(fields) => {
            let mut out = Document::new();
            for (k, e) in fields {
                out.insert(k.clone(), eval_expr(doc, e)?);
            }
            Bson::Document(out)
        }
        Expr::Add(args) => {
            let mut acc = Bson::Int32(0);
            for a in args {
                let v = eval_expr(doc, a)?;
                if is_nullish(&v) {
                    return Ok(Bson::Null);
                }
                number("$add", &v)?;
                acc = add_numbers(&acc, &v).unwrap_or(Bson::Null);
            }
            acc
        }
        Expr::Multiply(args) => {
            let mut int_acc = Some(1i64);
            let mut float_acc = 1.0f64;
            for a in args {
                let v = eval_expr(doc, a)?;
                if is_nullish(&v) {
                    return Ok(Bson::Null);
                }
                float_acc *= number("$multiply", &v)?;
                int_acc = int_acc.zip(int_of(&v)).and_then(|(x, y)| x.checked_mul(y));
            }
            int_acc.map_or(Bson::Double(float_acc), narrow)
        }
        Expr::Subtract(a, b) => {
            let (x, y) = (eval_expr(doc, a)?, eval_expr(doc, b)?);
            if is_nullish(&x) || is_nullish(&y) {
                return Ok(Bson::Null);
            }
            match (int_of(&x), int_of(&y)) {
                (Some(p), Some(q)) => p.checked_sub(q).map_or(Bson::Double(p as f64 - q as f64), narrow),
                _ => Bson::Double(number("$subtract", &x)? - number("$subtract", &y)?),
            }
        }
        Expr::Divide(a, b) => {
            let (x, y) = (eval_expr(doc, a)?, eval_expr(doc, b)?);
            if is_nullish(&x) || is_nullish(&y) {
                return Ok(Bson::Null);
            }
            let (p, q) = (number("$divide", &x)?, number("$divide", &y)?);
            if q == 0.0 {
                return Err(query_err("can't $divide by zero"));
            }
            Bson::Double(p / q)
        }
        Expr::Mod(a, b) => {
            let (x, y) = (eval_expr(doc, a)?, eval_expr(doc, b)?);
            if is_nullish(&x) || is_nullish(&y) {
                return Ok(Bson::Null);
            }
            match (int_of(&x), int_of(&y)) {
                (Some(_), Some(0)) => return Err(query_err("can't $mod by zero")),
                (Some(p), Some(q)) => narrow(p.wrapping_rem(q)),
                _ => {
                    let (p, q) = (number("$mod", &x)?, number("$mod", &y)?);
                    if q == 0.0 {
                        return Err(query_err("can't $mod by zero"));
                    }
                    // `%` truncates toward zero, which keeps the dividend's sign
                    Bson::Double(p % q)
                }
            }
        }
        Expr::Floor(a) => {
            let v = eval_expr(doc, a)?;
            match v {
                Bson::Null | Bson::Undefined => Bson::Null,
                Bson::Int32(_) | Bson::Int64(_) => v,
                other => Bson::Double(number("$floor", &other)?.floor()),
            }
        }
    })
}

enum AccState {
    Sum(Bson),
    Avg { total: f64, n: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Count(i64),
}

impl AccState {
    fn start(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::Sum(_) => Self::Sum(Bson::Int32(0)),
            Accumulator::Avg(_) => Self::Avg { total: 0.0, n: 0 },
            Accumulator::Min(_) => Self::Min(None),
            Accumulator::Max(_) => Self::Max(None),
            Accumulator::First(_) => Self::First(None),
            Accumulator::Count => Self::Count(0),
        }
    }

    fn feed(&mut self, doc: &Document, acc: &Accumulator) -> Result<(), DbError> {
        let value = match acc {
            Accumulator::Sum(e)
            | Accumulator::Avg(e)
            | Accumulator::Min(e)
            | Accumulator::Max(e)
            | Accumulator::First(e) => eval_expr(doc, e)?,
            Accumulator::Count => Bson::Null,
        };
        match self {
            // non-numeric values are ignored by $sum and $avg
            Self::Sum(total) => {
                if as_f64(&value).is_some()
                    && let Some(next) = add_numbers(total, &value)
                {
                    *total = next;
                }
            }
            Self::Avg { total, n } => {
                if let Some(f) = as_f64(&value) {
                    *total += f;
                    *n += 1;
                }
            }
            Self::Min(cur) => {
                if !is_nullish(&value)
                    && cur.as_ref().is_none_or(|c| compare_bson(&value, c).is_lt())
                {
                    *cur = Some(value);
                }
            }
            Self::Max(cur) => {
                if !is_nullish(&value)
                    && cur.as_ref().is_none_or(|c| compare_bson(&value, c).is_gt())
                {
                    *cur = Some(value);
                }
            }
            Self::First(cur) => {
                if cur.is_none() {
                    *cur = Some(value);
                }
            }
            Self::Count(n) => *n += 1,
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> Bson {
        match self {
            Self::Sum(total) => total,
            Self::Avg { n: 0, .. } => Bson::Null,
            Self::Avg { total, n } => Bson::Double(total / n as f64),
            Self::Min(v) | Self::Max(v) | Self::First(v) => v.unwrap_or(Bson::Null),
            Self::Count(n) => narrow(n),
        }
    }
}

fn group(docs: Vec<Document>, id: &Expr, fields: &[(String, Accumulator)]) -> Result<Vec<Document>, DbError> {
    let mut groups: Vec<(Bson, Vec<AccState>)> = Vec::new();
    for doc in &docs {
        let key = eval_expr(doc, id)?;
        let slot = match groups.iter().position(|(k, _)| bson_equal(k, &key)) {
            Some(i) => i,
            None => {
                groups.push((key, fields.iter().map(|(_, a)| AccState::start(a)).collect()));
                groups.len() - 1
            }
        };
        for (state, (_, acc)) in groups[slot].1.iter_mut().zip(fields) {
            state.feed(doc, acc)?;
        }
    }
    Ok(groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for (state, (name, _)) in states.into_iter().zip(fields) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect())
}

fn project_one(doc: &Document, fields: &[(String, ProjectField)]) -> Result<Document, DbError> {
    let inclusive = fields
        .iter()
        .any(|(k, f)| k != "_id" && !matches!(f, ProjectField::Exclude));
    if !inclusive {
        let mut out = doc.clone();
        for (k, _) in fields {
            out.remove(k);
        }
        return Ok(out);
    }
    let mut out = Document::new();
    let id_excluded = fields.iter().any(|(k, f)| k == "_id" && matches!(f, ProjectField::Exclude));
    if !id_excluded && let Some(id) = doc.get("_id") {
        out.insert("_id", id.clone());
    }
    for (k, f) in fields {
        match f {
            ProjectField::Include => {
                if let Some(v) = get_path(doc, k) {
                    out.insert(k.clone(), v.clone());
                }
            }
            ProjectField::Computed(e) => {
                out.insert(k.clone(), eval_expr(doc, e)?);
            }
            ProjectField::Exclude if k == "_id" => {}
            ProjectField::Exclude => {
                return Err(query_err(format!("cannot do exclusion on field {k} in inclusion projection")));
            }
        }
    }
    Ok(out)
}

/// Runs parsed stages over a snapshot of documents.
///
/// # Errors
/// Returns the first expression error raised by any stage.
pub fn run_pipeline(mut docs: Vec<Document>, stages: &[Stage]) -> Result<Vec<Document>, DbError> {
    for stage in stages {
        docs = match stage {
            Stage::Match(f) => docs.into_iter().filter(|d| eval_filter(d, f)).collect(),
            Stage::Group { id, fields } => group(docs, id, fields)?,
            Stage::Sort(spec) => {
                docs.sort_by(|a, b| compare_docs(a, b, spec));
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n).collect(),
            Stage::Project(fields) => {
                docs.iter().map(|d| project_one(d, fields)).collect::<Result<_, _>>()?
            }
        };
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse::{parse_expr, parse_pipeline};
    use bson::doc;

    fn decade_expr() -> Expr {
        parse_expr(&Bson::Document(doc! {"$subtract": [
            {"$divide": ["$published_year", 10]},
            {"$mod": [{"$divide": ["$published_year", 10]}, 1]},
        ]}))
        .unwrap()
    }

    #[test]
    fn decade_expression_floors_the_tenth() {
        let v = eval_expr(&doc! {"published_year": 1949}, &decade_expr()).unwrap();
        let Bson::Double(d) = v else { panic!("expected double, got {v:?}") };
        assert!((d - 194.0).abs() < 1e-9);
    }

    #[test]
    fn divide_by_zero_is_an_error() {
        let e = parse_expr(&Bson::Document(doc! {"$divide": ["$price", 0]})).unwrap();
        assert!(eval_expr(&doc! {"price": 3.0}, &e).is_err());
    }

    #[test]
    fn arithmetic_on_missing_field_is_null() {
        let e = parse_expr(&Bson::Document(doc! {"$subtract": ["$nope", 1]})).unwrap();
        assert_eq!(eval_expr(&doc! {}, &e).unwrap(), Bson::Null);
    }

    #[test]
    fn sum_of_ones_counts_and_keeps_first_seen_order() {
        let docs = vec![
            doc! {"author": "B"},
            doc! {"author": "A"},
            doc! {"author": "B"},
        ];
        let stages = parse_pipeline(&[doc! {"$group": {"_id": "$author", "n": {"$sum": 1}}}]).unwrap();
        let out = run_pipeline(docs, &stages).unwrap();
        assert_eq!(out, vec![doc! {"_id": "B", "n": 2}, doc! {"_id": "A", "n": 1}]);
    }

    #[test]
    fn avg_ignores_non_numeric_values() {
        let docs = vec![doc! {"g": 1, "p": 10.0}, doc! {"g": 1, "p": "n/a"}, doc! {"g": 1, "p": 20}];
        let stages = parse_pipeline(&[doc! {"$group": {"_id": "$g", "avg": {"$avg": "$p"}}}]).unwrap();
        let out = run_pipeline(docs, &stages).unwrap();
        assert_eq!(out[0].get_f64("avg").unwrap(), 15.0);
    }
}
