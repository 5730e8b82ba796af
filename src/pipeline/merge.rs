use serde_json::{Number, Value};
use std::collections::{HashMap, HashSet};

const GROUP_KEY_SEPARATOR: char = '\u{1f}';

/// How a merge field combines the accumulated value with an incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldReducer {
    Sum,
    Concat,
    Overwrite,
}

impl FieldReducer {
    /// Pick the rule from the type of the value already accumulated
    pub fn for_value(value: &Value) -> Self {
        match value {
            Value::Number(_) => FieldReducer::Sum,
            Value::Array(_) => FieldReducer::Concat,
            _ => FieldReducer::Overwrite,
        }
    }

    fn reduce(self, accumulated: &mut Value, incoming: Value) {
        if incoming.is_null() {
            return;
        }
        match accumulated {
            Value::Number(current) if self == FieldReducer::Sum => {
                if let Value::Number(n) = &incoming {
                    let sum = add_numbers(current, n);
                    *accumulated = sum;
                    return;
                }
            }
            Value::Array(items) if self == FieldReducer::Concat => {
                match incoming {
                    Value::Array(more) => items.extend(more),
                    scalar => items.push(scalar),
                }
                return;
            }
            _ => {}
        }
        *accumulated = incoming;
    }
}

fn add_numbers(a: &Number, b: &Number) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
}

/// Folds per-chunk result records into one result set.
///
/// Without merge fields the records are concatenated in arrival order. With
/// merge fields, records sharing a group key are combined: the group key is
/// built from every field that is neither a merge nor an ignored field, merge
/// fields are reduced with their [`FieldReducer`], and every other field keeps
/// its first-seen value. Groups come out in first-seen order.
#[derive(Debug, Default)]
pub struct MergeReducer {
    merge_fields: Vec<String>,
    ignore_fields: HashSet<String>,
    reducers: HashMap<String, FieldReducer>,
    groups: HashMap<String, usize>,
    output: Vec<Value>,
}

impl MergeReducer {
    pub fn new(merge_fields: &[String], ignore_fields: &[String]) -> Self {
        Self {
            merge_fields: merge_fields.to_vec(),
            ignore_fields: ignore_fields.iter().cloned().collect(),
            ..Self::default()
        }
    }

    pub fn is_merging(&self) -> bool {
        !self.merge_fields.is_empty()
    }

    pub fn accept(&mut self, records: Vec<Value>) {
        if !self.is_merging() {
            self.output.extend(records);
            return;
        }
        for record in records {
            self.fold(record);
        }
    }

    fn fold(&mut self, record: Value) {
        let Value::Object(mut fields) = record else {
            // Nothing to group on
            self.output.push(record);
            return;
        };

        let key = self.group_key(&fields);
        let Some(&index) = self.groups.get(&key) else {
            for name in &self.merge_fields {
                if let Some(value) = fields.get(name).filter(|v| !v.is_null()) {
                    self.reducers
                        .entry(name.clone())
                        .or_insert_with(|| FieldReducer::for_value(value));
                }
            }
            self.groups.insert(key, self.output.len());
            self.output.push(Value::Object(fields));
            return;
        };

        let Some(Value::Object(merged)) = self.output.get_mut(index) else {
            return;
        };
        for name in &self.merge_fields {
            let Some(incoming) = fields.remove(name) else {
                continue;
            };
            let slot = merged.entry(name.clone()).or_insert(Value::Null);
            let reducer = match self.reducers.get(name) {
                Some(reducer) => *reducer,
                None if slot.is_null() => {
                    if !incoming.is_null() {
                        self.reducers
                            .insert(name.clone(), FieldReducer::for_value(&incoming));
                    }
                    FieldReducer::Overwrite
                }
                None => FieldReducer::for_value(slot),
            };
            reducer.reduce(slot, incoming);
        }
    }

    fn group_key(&self, fields: &serde_json::Map<String, Value>) -> String {
        let mut key = String::new();
        for (name, value) in fields {
            if self.merge_fields.contains(name) || self.ignore_fields.contains(name) {
                continue;
            }
            if !key.is_empty() {
                key.push(GROUP_KEY_SEPARATOR);
            }
            key.push_str(name);
            key.push('=');
            match value {
                Value::String(s) => key.push_str(s),
                other => key.push_str(&other.to_string()),
            }
        }
        key
    }

    pub fn len(&self) -> usize {
        self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    pub fn finish(self) -> Vec<Value> {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_numeric_sum() {
        let mut reducer = MergeReducer::new(&fields(&["b"]), &[]);
        reducer.accept(vec![json!({"a": 1, "b": 5}), json!({"a": 1, "b": 7})]);
        reducer.accept(vec![json!({"a": 2, "b": 1})]);
        assert_eq!(
            reducer.finish(),
            vec![json!({"a": 1, "b": 12}), json!({"a": 2, "b": 1})]
        );
    }

    #[test]
    fn test_array_concat() {
        let mut reducer = MergeReducer::new(&fields(&["tags"]), &[]);
        reducer.accept(vec![json!({"a": "x", "tags": ["p"]})]);
        reducer.accept(vec![json!({"a": "x", "tags": ["q"]})]);
        assert_eq!(reducer.finish(), vec![json!({"a": "x", "tags": ["p", "q"]})]);
    }

    #[test]
    fn test_scalar_pushed_onto_array() {
        let mut reducer = MergeReducer::new(&fields(&["tags"]), &[]);
        reducer.accept(vec![
            json!({"a": "x", "tags": ["p"]}),
            json!({"a": "x", "tags": "q"}),
        ]);
        assert_eq!(reducer.finish(), vec![json!({"a": "x", "tags": ["p", "q"]})]);
    }

    #[test]
    fn test_overwrite_for_other_types() {
        let mut reducer = MergeReducer::new(&fields(&["last"]), &[]);
        reducer.accept(vec![
            json!({"a": 1, "last": "first"}),
            json!({"a": 1, "last": "second"}),
        ]);
        assert_eq!(reducer.finish(), vec![json!({"a": 1, "last": "second"})]);
    }

    #[test]
    fn test_ignored_fields_do_not_split_groups() {
        let mut reducer = MergeReducer::new(&fields(&["n"]), &fields(&["seen_at"]));
        reducer.accept(vec![
            json!({"k": "a", "n": 1, "seen_at": "09:00"}),
            json!({"k": "a", "n": 2, "seen_at": "10:00"}),
        ]);
        assert_eq!(
            reducer.finish(),
            vec![json!({"k": "a", "n": 3, "seen_at": "09:00"})]
        );
    }

    #[test]
    fn test_null_or_missing_value_keeps_accumulated() {
        let mut reducer = MergeReducer::new(&fields(&["n"]), &[]);
        reducer.accept(vec![
            json!({"k": "a", "n": 4}),
            json!({"k": "a", "n": null}),
            json!({"k": "a"}),
            json!({"k": "a", "n": 1}),
        ]);
        assert_eq!(reducer.finish(), vec![json!({"k": "a", "n": 5})]);
    }

    #[test]
    fn test_first_value_null_then_sum() {
        let mut reducer = MergeReducer::new(&fields(&["n"]), &[]);
        reducer.accept(vec![
            json!({"k": "a", "n": null}),
            json!({"k": "a", "n": 2}),
            json!({"k": "a", "n": 3}),
        ]);
        assert_eq!(reducer.finish(), vec![json!({"k": "a", "n": 5})]);
    }

    #[test]
    fn test_float_sum() {
        let mut reducer = MergeReducer::new(&fields(&["n"]), &[]);
        reducer.accept(vec![json!({"k": 1, "n": 1.5}), json!({"k": 1, "n": 2})]);
        assert_eq!(reducer.finish(), vec![json!({"k": 1, "n": 3.5})]);
    }

    #[test]
    fn test_flat_mode_keeps_encounter_order() {
        let mut reducer = MergeReducer::new(&[], &[]);
        reducer.accept(vec![json!({"a": 2}), json!({"a": 1})]);
        reducer.accept(vec![json!({"a": 2})]);
        assert!(!reducer.is_merging());
        assert_eq!(
            reducer.finish(),
            vec![json!({"a": 2}), json!({"a": 1}), json!({"a": 2})]
        );
    }

    #[test]
    fn test_group_key_uses_string_form() {
        let mut reducer = MergeReducer::new(&fields(&["n"]), &[]);
        reducer.accept(vec![json!({"k": 1, "n": 1}), json!({"k": "1", "n": 1})]);
        // String "1" and number 1 render the same, so they share a group
        assert_eq!(reducer.len(), 1);
    }

    #[test]
    fn test_merged_record_keeps_field_order() {
        let mut reducer = MergeReducer::new(&fields(&["n"]), &[]);
        reducer.accept(vec![
            json!({"z": "x", "a": 1, "n": 1}),
            json!({"z": "x", "a": 1, "n": 2}),
        ]);
        let merged = reducer.finish();
        let keys: Vec<&String> = merged[0].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "n"]);
        assert_eq!(merged[0]["n"], json!(3));
    }

    #[test]
    fn test_group_key_follows_record_key_order() {
        let mut reducer = MergeReducer::new(&fields(&["n"]), &[]);
        reducer.accept(vec![
            json!({"a": 1, "b": 2, "n": 1}),
            json!({"b": 2, "a": 1, "n": 1}),
        ]);
        assert_eq!(reducer.len(), 2);
    }
}
