//! Query, update, sort and projection semantics of the in-memory server.

use bson::{Bson, Document};
use std::cmp::Ordering;

/// A server-side failure: code, code name and message.
pub(crate) type ServerError = (i32, &'static str, String);

fn bad_value(message: impl Into<String>) -> ServerError {
    (2, "BadValue", message.into())
}

/// Value at a dotted path.
pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = document.get(first)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set the value at a dotted path, creating intermediate documents.
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> Result<(), ServerError> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err((
                    28,
                    "PathNotViable",
                    format!("cannot create field '{rest}' in element {{{head}}}"),
                )),
            }
        }
    }
}

fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Rank of a value's type in the server's comparison order.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

/// Total order used for sorting.
pub(crate) fn compare(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => (x.time, x.increment).cmp(&(y.time, y.increment)),
        (Bson::Document(x), Bson::Document(y)) => {
            let left: Vec<_> = x.iter().collect();
            let right: Vec<_> = y.iter().collect();
            for ((lk, lv), (rk, rv)) in left.iter().zip(right.iter()) {
                let ordering = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            left.len().cmp(&right.len())
        }
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ordering = compare(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Equality as queries see it: an array field also matches any element.
fn field_equals(field: Option<&Bson>, value: &Bson) -> bool {
    match field {
        Some(Bson::Array(items)) if !matches!(value, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, value))
        }
        Some(field) => values_equal(field, value),
        None => matches!(value, Bson::Null),
    }
}

fn field_compares(field: Option<&Bson>, value: &Bson, accept: fn(Ordering) -> bool) -> bool {
    let check = |candidate: &Bson| type_rank(candidate) == type_rank(value) && accept(compare(candidate, value));
    match field {
        Some(Bson::Array(items)) => items.iter().any(check),
        Some(field) => check(field),
        None => false,
    }
}

fn is_operator_document(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(inner) if inner.keys().next().is_some_and(|k| k.starts_with('$')) => Some(inner),
        _ => None,
    }
}

fn sub_filters(value: &Bson, operator: &str) -> Result<Vec<Document>, ServerError> {
    match value {
        Bson::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| match item {
                Bson::Document(inner) => Ok(inner.clone()),
                _ => Err(bad_value(format!("{operator} entries need to be full objects"))),
            })
            .collect(),
        _ => Err(bad_value(format!("{operator} must be a nonempty array"))),
    }
}

/// Whether `document` matches `filter`.
pub(crate) fn matches(document: &Document, filter: &Document) -> Result<bool, ServerError> {
    for (key, value) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_filters(value, "$and")? {
                    all &= matches(document, &sub)?;
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in sub_filters(value, "$or")? {
                    any |= matches(document, &sub)?;
                }
                any
            }
            other if other.starts_with('$') => {
                return Err(bad_value(format!("unknown top level operator: {other}")));
            }
            path => {
                let field = get_path(document, path);
                match is_operator_document(value) {
                    Some(operators) => field_matches(field, operators)?,
                    None => field_equals(field, value),
                }
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn field_matches(field: Option<&Bson>, operators: &Document) -> Result<bool, ServerError> {
    for (operator, operand) in operators {
        let matched = match operator.as_str() {
            "$eq" => field_equals(field, operand),
            "$ne" => !field_equals(field, operand),
            "$gt" => field_compares(field, operand, Ordering::is_gt),
            "$gte" => field_compares(field, operand, Ordering::is_ge),
            "$lt" => field_compares(field, operand, Ordering::is_lt),
            "$lte" => field_compares(field, operand, Ordering::is_le),
            "$in" | "$nin" => {
                let Bson::Array(candidates) = operand else {
                    return Err(bad_value(format!("{operator} needs an array")));
                };
                let found = candidates.iter().any(|candidate| field_equals(field, candidate));
                if operator == "$in" {
                    found
                } else {
                    !found
                }
            }
            "$exists" => {
                let wanted = match operand {
                    Bson::Boolean(b) => *b,
                    other => as_f64(other).map_or(true, |n| n != 0.0),
                };
                field.is_some() == wanted
            }
            other => return Err(bad_value(format!("unknown operator: {other}"))),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Apply update operators, or a replacement document, in place.
///
/// Returns whether the document changed.
pub(crate) fn apply_update(document: &mut Document, update: &Document) -> Result<bool, ServerError> {
    let before = document.clone();

    if !update.keys().next().is_some_and(|k| k.starts_with('$')) {
        let id = document.get("_id").cloned();
        let mut replacement = Document::new();
        if let Some(id) = id {
            replacement.insert("_id", id);
        }
        for (key, value) in update {
            if key != "_id" {
                replacement.insert(key.clone(), value.clone());
            }
        }
        *document = replacement;
        return Ok(*document != before);
    }

    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err((9, "FailedToParse", format!("modifier {operator} expects a document")));
        };
        for (path, value) in fields {
            match operator.as_str() {
                "$set" => set_path(document, path, value.clone())?,
                "$unset" => remove_path(document, path),
                "$inc" => {
                    let increment = as_f64(value).ok_or_else(|| {
                        (14, "TypeMismatch", format!("cannot increment with non-numeric argument: {path}"))
                    })?;
                    let updated = match get_path(document, path) {
                        None => value.clone(),
                        Some(Bson::Int32(current)) => match value {
                            Bson::Int32(by) => current
                                .checked_add(*by)
                                .map_or(Bson::Int64(i64::from(*current) + i64::from(*by)), Bson::Int32),
                            Bson::Int64(by) => Bson::Int64(i64::from(*current) + by),
                            _ => Bson::Double(f64::from(*current) + increment),
                        },
                        Some(Bson::Int64(current)) => match value {
                            Bson::Double(_) => Bson::Double(*current as f64 + increment),
                            _ => Bson::Int64(current + increment as i64),
                        },
                        Some(Bson::Double(current)) => Bson::Double(current + increment),
                        Some(_) => {
                            return Err((
                                14,
                                "TypeMismatch",
                                format!("cannot apply $inc to a value of non-numeric type: {path}"),
                            ))
                        }
                    };
                    set_path(document, path, updated)?;
                }
                other => return Err((9, "FailedToParse", format!("Unknown modifier: {other}"))),
            }
        }
    }
    Ok(*document != before)
}

/// The document an upsert starts from: the equality fields of the filter.
pub(crate) fn upsert_seed(filter: &Document) -> Result<Document, ServerError> {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        match is_operator_document(value) {
            Some(operators) => {
                if let Some(eq) = operators.get("$eq") {
                    set_path(&mut seed, key, eq.clone())?;
                }
            }
            None => set_path(&mut seed, key, value.clone())?,
        }
    }
    Ok(seed)
}

/// Sort by a `{field: 1 | -1}` specification.
pub(crate) fn sort(documents: &mut [Document], keys: &Document) {
    documents.sort_by(|a, b| {
        for (path, direction) in keys {
            let descending = as_f64(direction).is_some_and(|d| d < 0.0);
            let left = get_path(a, path).unwrap_or(&Bson::Null);
            let right = get_path(b, path).unwrap_or(&Bson::Null);
            let ordering = compare(left, right);
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Apply an inclusion or exclusion projection on top-level fields.
pub(crate) fn project(document: &Document, projection: &Document) -> Document {
    let truthy = |value: &Bson| match value {
        Bson::Boolean(b) => *b,
        other => as_f64(other).map_or(true, |n| n != 0.0),
    };
    let inclusion = projection.iter().any(|(key, value)| key != "_id" && truthy(value));
    let keep_id = projection.get("_id").map_or(true, truthy);

    if inclusion {
        let mut projected = Document::new();
        if keep_id {
            if let Some(id) = document.get("_id") {
                projected.insert("_id", id.clone());
            }
        }
        for (key, value) in projection {
            if key != "_id" && truthy(value) {
                if let Some(field) = document.get(key) {
                    projected.insert(key.clone(), field.clone());
                }
            }
        }
        projected
    } else {
        document
            .iter()
            .filter(|(key, _)| match projection.get(key.as_str()) {
                Some(value) => truthy(value),
                None => true,
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}
