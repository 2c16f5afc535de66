// Matrix expansion: cartesian product of the declared rows, exclude
// filtering, then include merging. Key declaration order is preserved all
// the way into the `matrix` expression context.

use serde_json::Value;

/// A strategy matrix: declared rows plus include/exclude combinations.
#[derive(Debug, Clone, Default)]
pub struct Matrix {
    /// Rows in declaration order: key -> declared values.
    pub rows: Vec<(String, Vec<Value>)>,
    pub includes: Vec<MatrixAssignment>,
    pub excludes: Vec<MatrixAssignment>,
}

/// One concrete point of a matrix: ordered key/value assignments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatrixAssignment {
    entries: Vec<(String, Value)>,
}

impl MatrixAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(String, Value)>) -> Self {
        let mut assignment = Self::new();
        for (key, value) in entries {
            assignment.insert(key, value);
        }
        assignment
    }

    /// Set a key, keeping the position of an existing key.
    pub fn insert(&mut self, key: String, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The `matrix` context object for expression evaluation.
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (key, value) in &self.entries {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }

    /// `k=v, k2=v2`, used in run display names and summaries.
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, value_to_plain_string(v)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Render a matrix cell for display (strings without quotes).
fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Matrix {
    /// Expand to the concrete assignment set:
    /// 1. cartesian product of rows (declaration order, last key fastest);
    /// 2. drop every entry all of whose keys shared with an exclude match;
    /// 3. merge each include into every surviving entry whose overlapping
    ///    row keys all match, or append it as a new entry.
    pub fn expand(&self) -> Vec<MatrixAssignment> {
        let mut base = cartesian_product(&self.rows);

        base.retain(|assignment| {
            !self
                .excludes
                .iter()
                .any(|exclude| common_keys_match(assignment, exclude))
        });

        let row_keys: Vec<&str> = self.rows.iter().map(|(k, _)| k.as_str()).collect();
        for include in &self.includes {
            let overlap: Vec<&str> = include
                .keys()
                .filter(|k| row_keys.contains(k))
                .collect();

            let mut merged = false;
            if !overlap.is_empty() {
                for assignment in base.iter_mut() {
                    if overlap
                        .iter()
                        .all(|key| assignment.get(key) == include.get(key))
                    {
                        for (key, value) in include.iter() {
                            assignment.insert(key.clone(), value.clone());
                        }
                        merged = true;
                    }
                }
            }
            if !merged {
                base.push(include.clone());
            }
        }

        base
    }
}

/// Cartesian product over the declared rows; the last row varies fastest so
/// output order follows declaration order.
fn cartesian_product(rows: &[(String, Vec<Value>)]) -> Vec<MatrixAssignment> {
    if rows.is_empty() {
        return Vec::new();
    }
    let mut count = 1usize;
    for (_, values) in rows {
        count *= values.len();
    }
    if count == 0 {
        return Vec::new();
    }

    let mut product = Vec::with_capacity(count);
    let mut indices = vec![0usize; rows.len()];
    loop {
        let mut assignment = MatrixAssignment::new();
        for (row, &index) in rows.iter().zip(indices.iter()) {
            assignment.insert(row.0.clone(), row.1[index].clone());
        }
        product.push(assignment);

        // Advance odometer-style, last position fastest.
        let mut position = rows.len();
        loop {
            if position == 0 {
                return product;
            }
            position -= 1;
            indices[position] += 1;
            if indices[position] < rows[position].1.len() {
                break;
            }
            indices[position] = 0;
        }
    }
}

/// True when every key the two assignments share has an equal value. Keys
/// present on only one side do not disqualify a match.
fn common_keys_match(a: &MatrixAssignment, b: &MatrixAssignment) -> bool {
    b.iter().all(|(key, value)| match a.get(key) {
        Some(existing) => existing == value,
        None => true,
    })
}
