use crate::errors::DbError;
use bson::{Bson, Document};
use std::cmp::Ordering;

use super::types::{
    CmpOp, Filter, MAX_PATH_DEPTH, MAX_SORT_FIELDS, Order, Projection, SortSpec, UpdateDoc,
};

#[must_use]
pub fn eval_filter(doc: &Document, filter: &Filter) -> bool {
    match filter {
        Filter::True => true,
        Filter::And(fs) => fs.iter().all(|f| eval_filter(doc, f)),
        Filter::Or(fs) => fs.iter().any(|f| eval_filter(doc, f)),
        Filter::Nor(fs) => !fs.iter().any(|f| eval_filter(doc, f)),
        Filter::Not(f) => !eval_filter(doc, f),
        Filter::Exists { path, exists } => get_path(doc, path).is_some() == *exists,
        Filter::In { path, values } => match get_path(doc, path) {
            Some(v) => candidates(v).any(|c| is_in_set(c, values)),
            None => values.iter().any(|x| matches!(x, Bson::Null)),
        },
        Filter::Nin { path, values } => {
            let inside = Filter::In { path: path.clone(), values: values.clone() };
            !eval_filter(doc, &inside)
        }
        Filter::Cmp { path, op: CmpOp::Ne, value } => {
            let eq = Filter::Cmp { path: path.clone(), op: CmpOp::Eq, value: value.clone() };
            !eval_filter(doc, &eq)
        }
        Filter::Cmp { path, op, value } => match get_path(doc, path) {
            Some(v) => candidates(v).any(|c| cmp_matches(c, *op, value)),
            // `{field: null}` also selects documents without the field
            None => *op == CmpOp::Eq && matches!(value, Bson::Null),
        },
    }
}

/// The value itself plus, for arrays, each element.
fn candidates(v: &Bson) -> Box<dyn Iterator<Item = &Bson> + '_> {
    match v {
        Bson::Array(items) => Box::new(std::iter::once(v).chain(items.iter())),
        _ => Box::new(std::iter::once(v)),
    }
}

fn cmp_matches(v: &Bson, op: CmpOp, value: &Bson) -> bool {
    match op {
        CmpOp::Eq => bson_equal(v, value),
        CmpOp::Ne => !bson_equal(v, value),
        // Range operators only compare within the same type bracket
        _ if !comparable(v, value) => false,
        CmpOp::Gt => compare_bson(v, value) == Ordering::Greater,
        CmpOp::Gte => compare_bson(v, value) != Ordering::Less,
        CmpOp::Lt => compare_bson(v, value) == Ordering::Less,
        CmpOp::Lte => compare_bson(v, value) != Ordering::Greater,
    }
}

fn comparable(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

fn is_in_set(v: &Bson, set: &[Bson]) -> bool {
    set.iter().any(|x| bson_equal(v, x))
}

#[must_use]
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    if path.is_empty() || path.len() > 1024 {
        return None;
    }
    let mut cur = doc;
    let mut parts = path.split('.').enumerate().peekable();
    while let Some((depth, part)) = parts.next() {
        if depth >= MAX_PATH_DEPTH {
            return None;
        }
        let v = cur.get(part)?;
        if parts.peek().is_none() {
            return Some(v);
        }
        match v {
            Bson::Document(d) => cur = d,
            _ => return None,
        }
    }
    None
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        Bson::Decimal128(d) => d.to_string().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_num(v: &Bson) -> bool {
    matches!(v, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_))
}

#[allow(clippy::float_cmp)]
#[must_use]
pub fn bson_equal(a: &Bson, b: &Bson) -> bool {
    if is_num(a) && is_num(b) {
        return match (a, b) {
            (Bson::Int32(x), Bson::Int64(y)) => i64::from(*x) == *y,
            (Bson::Int64(x), Bson::Int32(y)) => *x == i64::from(*y),
            _ => as_f64(a) == as_f64(b),
        };
    }
    a == b
}

/// Total order over BSON values: numbers compare by value across types,
/// values of different types compare by their canonical type bracket.
#[must_use]
pub fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    if is_num(a) && is_num(b) {
        return match (a, b) {
            (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
            (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
            _ => compare_f64(as_f64(a).unwrap_or(f64::NAN), as_f64(b).unwrap_or(f64::NAN)),
        };
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Array(x), Bson::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(p, q)| compare_bson(p, q))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Bson::Document(x), Bson::Document(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| compare_bson(va, vb)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// NaN sorts below every number; `-0.0` and `0.0` are equal.
fn compare_f64(x: f64, y: f64) -> Ordering {
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn type_rank(v: &Bson) -> u8 {
    use bson::Bson as T;
    match v {
        T::MinKey => 0,
        T::Null | T::Undefined => 1,
        T::Int32(_) | T::Int64(_) | T::Double(_) | T::Decimal128(_) => 2,
        T::String(_) | T::Symbol(_) => 3,
        T::Document(_) => 4,
        T::Array(_) => 5,
        T::Binary(_) => 6,
        T::ObjectId(_) => 7,
        T::Boolean(_) => 8,
        T::DateTime(_) => 9,
        T::Timestamp(_) => 10,
        T::RegularExpression(_) => 11,
        T::DbPointer(_) | T::JavaScriptCode(_) | T::JavaScriptCodeWithScope(_) => 12,
        T::MaxKey => 255,
    }
}

/// Compares two documents by a sort specification; missing fields sort
/// as `null`, i.e. before any number or string.
#[must_use]
pub fn compare_docs(a: &Document, b: &Document, sort: &[SortSpec]) -> Ordering {
    for s in sort.iter().take(MAX_SORT_FIELDS) {
        let va = get_path(a, &s.field).unwrap_or(&Bson::Null);
        let vb = get_path(b, &s.field).unwrap_or(&Bson::Null);
        let ord = compare_bson(va, vb);
        if ord != Ordering::Equal {
            return if s.order == Order::Asc { ord } else { ord.reverse() };
        }
    }
    Ordering::Equal
}

#[must_use]
pub fn project(doc: &Document, projection: &Projection) -> Document {
    match projection {
        Projection::Include { fields, keep_id } => {
            let mut out = Document::new();
            if *keep_id && let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
            for f in fields {
                // parse_projection rejects overlapping paths, so this cannot collide
                if let Some(v) = get_path(doc, f)
                    && let Err(e) = set_path(&mut out, f, v.clone())
                {
                    log::debug!("projection skipped {f}: {e}");
                }
            }
            out
        }
        Projection::Exclude(fields) => {
            let mut out = doc.clone();
            for f in fields {
                unset_path(&mut out, f);
            }
            out
        }
    }
}

fn path_err(path: &str, seg: &str, found: &Bson) -> DbError {
    DbError::QueryError(format!("cannot create field in element {{{seg}: {found}}} while updating {path}"))
}

fn ensure_subdoc<'a>(root: &'a mut Document, key: &str, path: &str) -> Result<&'a mut Document, DbError> {
    if root.get(key).is_none() {
        root.insert(key.to_string(), Bson::Document(Document::new()));
    }
    match root.get_mut(key) {
        Some(Bson::Document(d)) => Ok(d),
        Some(other) => Err(path_err(path, key, other)),
        None => Err(DbError::QueryError(format!("cannot traverse {path}"))),
    }
}

fn traverse_to_parent<'a>(root: &'a mut Document, path: &str) -> Result<(&'a mut Document, String), DbError> {
    let mut cur = root;
    let mut iter = path.split('.').peekable();
    while let Some(seg) = iter.next() {
        if iter.peek().is_none() {
            return Ok((cur, seg.to_string()));
        }
        cur = ensure_subdoc(cur, seg, path)?;
    }
    Err(DbError::QueryError("empty update path".into()))
}

fn set_path(root: &mut Document, path: &str, value: Bson) -> Result<bool, DbError> {
    let (parent, last) = traverse_to_parent(root, path)?;
    let changed = parent.get(&last).is_none_or(|old| old != &value);
    parent.insert(last, value);
    Ok(changed)
}

fn unset_path(root: &mut Document, path: &str) -> bool {
    let mut cur = root;
    let mut iter = path.split('.').peekable();
    while let Some(seg) = iter.next() {
        if iter.peek().is_none() {
            return cur.remove(seg).is_some();
        }
        match cur.get_mut(seg) {
            Some(Bson::Document(d)) => cur = d,
            _ => return false,
        }
    }
    false
}

fn as_i64(v: &Bson) -> Option<i64> {
    match v {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        _ => None,
    }
}

/// Adds two numbers keeping integer width when both sides are integers.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn add_numbers(a: &Bson, b: &Bson) -> Option<Bson> {
    if let (Bson::Int32(x), Bson::Int32(y)) = (a, b) {
        return Some(
            x.checked_add(*y).map_or_else(|| Bson::Int64(i64::from(*x) + i64::from(*y)), Bson::Int32),
        );
    }
    if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
        return Some(x.checked_add(y).map_or_else(|| Bson::Double(x as f64 + y as f64), Bson::Int64));
    }
    Some(Bson::Double(as_f64(a)? + as_f64(b)?))
}

/// Applies `$set`, `$inc` and `$unset`. Returns whether the document changed.
///
/// # Errors
/// Returns `DbError::QueryError` when `$inc` targets a non-numeric value or a
/// path runs through a non-document value. `doc` may be partially updated
/// on error; callers apply updates to a copy.
pub fn apply_update(doc: &mut Document, upd: &UpdateDoc) -> Result<bool, DbError> {
    let mut changed = false;
    for (k, v) in &upd.set {
        changed |= set_path(doc, k, v.clone())?;
    }
    for (k, by) in &upd.inc {
        let cur = get_path(doc, k).cloned().unwrap_or(Bson::Int32(0));
        let next = add_numbers(&cur, by).ok_or_else(|| {
            DbError::QueryError(format!("cannot apply $inc to {k}: value {cur} is not numeric"))
        })?;
        changed |= set_path(doc, k, next)?;
    }
    for k in &upd.unset {
        changed |= unset_path(doc, k);
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn gt_excludes_boundary() {
        let f = Filter::Cmp { path: "published_year".into(), op: CmpOp::Gt, value: 2000.into() };
        assert!(!eval_filter(&doc! {"published_year": 2000}, &f));
        assert!(eval_filter(&doc! {"published_year": 2001}, &f));
        assert!(!eval_filter(&doc! {"published_year": "2001"}, &f));
    }

    #[test]
    fn eq_matches_array_elements_and_missing_null() {
        let f = Filter::Cmp { path: "tags".into(), op: CmpOp::Eq, value: "classic".into() };
        assert!(eval_filter(&doc! {"tags": ["classic", "novel"]}, &f));
        let f_null = Filter::Cmp { path: "isbn".into(), op: CmpOp::Eq, value: Bson::Null };
        assert!(eval_filter(&doc! {"title": "x"}, &f_null));
    }

    #[test]
    fn numeric_equality_crosses_widths() {
        assert!(bson_equal(&Bson::Int32(7), &Bson::Double(7.0)));
        assert!(bson_equal(&Bson::Int64(7), &Bson::Int32(7)));
        assert!(!bson_equal(&Bson::Int32(7), &Bson::String("7".into())));
    }

    #[test]
    fn set_reports_unchanged_value() {
        let mut d = doc! {"title": "1984", "price": 15.99};
        let upd = UpdateDoc { set: vec![("price".into(), Bson::Double(15.99))], ..UpdateDoc::default() };
        assert!(!apply_update(&mut d, &upd).unwrap());
    }

    #[test]
    fn update_set_inc_unset_nested() {
        let mut d = doc! {"stock": {"count": 2}, "old": 1};
        let upd = UpdateDoc {
            set: vec![("meta.shelf".into(), "B3".into())],
            inc: vec![("stock.count".into(), Bson::Int32(3))],
            unset: vec!["old".into()],
        };
        assert!(apply_update(&mut d, &upd).unwrap());
        assert_eq!(d.get_document("meta").unwrap().get_str("shelf").unwrap(), "B3");
        assert_eq!(d.get_document("stock").unwrap().get_i32("count").unwrap(), 5);
        assert!(d.get("old").is_none());
    }

    #[test]
    fn missing_sort_key_orders_first() {
        let sort = vec![SortSpec { field: "price".into(), order: Order::Asc }];
        assert_eq!(compare_docs(&doc! {}, &doc! {"price": 1.0}, &sort), Ordering::Less);
    }

    #[test]
    fn signed_zero_sorts_as_equal_and_nan_first() {
        assert_eq!(compare_bson(&Bson::Double(-0.0), &Bson::Double(0.0)), Ordering::Equal);
        assert!(bson_equal(&Bson::Double(-0.0), &Bson::Int32(0)));
        assert_eq!(compare_bson(&Bson::Double(f64::NAN), &Bson::Int32(i32::MIN)), Ordering::Less);
        assert_eq!(compare_bson(&Bson::Double(f64::NAN), &Bson::Double(f64::NAN)), Ordering::Equal);
    }

    #[test]
    fn inc_on_text_is_rejected() {
        let mut d = doc! {"title": "1984"};
        let upd = UpdateDoc { inc: vec![("title".into(), Bson::Int32(1))], ..UpdateDoc::default() };
        assert!(matches!(apply_update(&mut d, &upd), Err(DbError::QueryError(_))));
        assert_eq!(d.get_str("title").unwrap(), "1984");
    }

    #[test]
    fn set_through_scalar_is_rejected() {
        let mut d = doc! {"price": 9.99};
        let upd = UpdateDoc { set: vec![("price.currency".into(), "EUR".into())], ..UpdateDoc::default() };
        assert!(matches!(apply_update(&mut d, &upd), Err(DbError::QueryError(_))));
        assert_eq!(d.get_f64("price").unwrap(), 9.99);
    }
}
