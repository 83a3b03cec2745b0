//! Bonification line renumbering.
//!
//! Some source rows are promotional bonus lines pointing at a regular
//! article. The destination schema wants every line sequentially numbered
//! per order, and every bonus line carrying the line number of the regular
//! article it references -- the source only provides the article code.

use std::collections::{HashMap, HashSet};

use ferry_db::models::BonificationConfig;
use ferry_db::value::{SqlRow, SqlValue};

/// Marker written into the reference field of a bonus row whose referenced
/// article does not exist in the order.
pub const ORPHAN_MARKER: &str = "REFERENCIA_NO_ENCONTRADA";

/// Per-row diagnostic for an unresolved bonus reference.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanDiagnostic {
    pub order: String,
    pub line_number: i64,
    pub referenced_code: String,
}

/// Counters and diagnostics from one processing run.
#[derive(Debug, Clone, Default)]
pub struct BonificationOutcome {
    pub orders_processed: u64,
    pub regular_lines: u64,
    pub bonus_lines: u64,
    pub orphans: Vec<OrphanDiagnostic>,
}

impl BonificationOutcome {
    pub fn orphan_count(&self) -> u64 {
        self.orphans.len() as u64
    }

    fn merge(&mut self, other: BonificationOutcome) {
        self.orders_processed += other.orders_processed;
        self.regular_lines += other.regular_lines;
        self.bonus_lines += other.bonus_lines;
        self.orphans.extend(other.orphans);
    }
}

/// Stateful processor scoped to a single execution.
///
/// The processed-orders set guards against renumbering an order twice
/// when it appears in more than one batch; rows of an already-processed
/// order pass through untouched.
pub struct BonificationProcessor {
    config: BonificationConfig,
    processed_orders: HashSet<String>,
}

impl BonificationProcessor {
    pub fn new(config: BonificationConfig) -> Self {
        Self {
            config,
            processed_orders: HashSet::new(),
        }
    }

    /// Process a batch of rows, grouping by order.
    ///
    /// Rows come back in order-grouped, line-sorted sequence.
    pub fn process(&mut self, rows: Vec<SqlRow>) -> (Vec<SqlRow>, BonificationOutcome) {
        let mut outcome = BonificationOutcome::default();

        // Group by order, preserving first-appearance order of the groups.
        let mut order_keys: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<SqlRow>> = HashMap::new();
        for row in rows {
            let key = row
                .get(&self.config.order_field)
                .and_then(SqlValue::key_string)
                .unwrap_or_default();
            if !groups.contains_key(&key) {
                order_keys.push(key.clone());
            }
            groups.entry(key).or_default().push(row);
        }

        let mut output = Vec::new();
        for key in order_keys {
            let group = groups.remove(&key).unwrap_or_default();
            if !self.processed_orders.insert(key.clone()) {
                tracing::debug!(order = %key, "order already processed, passing rows through");
                output.extend(group);
                continue;
            }
            let (rows, group_outcome) = self.process_order(&key, group);
            output.extend(rows);
            outcome.merge(group_outcome);
        }

        (output, outcome)
    }

    /// Renumber one order.
    ///
    /// First pass records each regular article's final line number; the
    /// second pass assigns line numbers to every row and resolves bonus
    /// references against the mapping.
    fn process_order(
        &self,
        order_key: &str,
        mut rows: Vec<SqlRow>,
    ) -> (Vec<SqlRow>, BonificationOutcome) {
        let cfg = &self.config;
        let mut outcome = BonificationOutcome {
            orders_processed: 1,
            ..BonificationOutcome::default()
        };

        rows.sort_by(|a, b| {
            let ka = line_order_key(a, &cfg.line_order_field);
            let kb = line_order_key(b, &cfg.line_order_field);
            ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut article_lines: HashMap<String, i64> = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            if !self.is_bonus(row) {
                if let Some(code) = row
                    .get(&cfg.regular_article_field)
                    .and_then(SqlValue::key_string)
                {
                    article_lines.entry(code).or_insert(idx as i64 + 1);
                }
            }
        }

        for (idx, row) in rows.iter_mut().enumerate() {
            let line_number = idx as i64 + 1;
            row.set(&cfg.line_number_field, SqlValue::Int(line_number));

            if self.is_bonus(row) {
                outcome.bonus_lines += 1;
                let referenced = row
                    .get(&cfg.reference_field)
                    .and_then(SqlValue::key_string)
                    .unwrap_or_default();

                match article_lines.get(&referenced) {
                    Some(regular_line) => {
                        row.set(&cfg.line_reference_field, SqlValue::Int(*regular_line));
                        row.set(&cfg.reference_field, SqlValue::Null);
                    }
                    None => {
                        row.set(&cfg.line_reference_field, SqlValue::Null);
                        row.set(
                            &cfg.reference_field,
                            SqlValue::Text(format!("{ORPHAN_MARKER}:{referenced}")),
                        );
                        outcome.orphans.push(OrphanDiagnostic {
                            order: order_key.to_owned(),
                            line_number,
                            referenced_code: referenced,
                        });
                    }
                }
            } else {
                outcome.regular_lines += 1;
                row.set(&cfg.line_reference_field, SqlValue::Null);
            }

            sanitize_quantity(row, &cfg.quantity_field);
        }

        (rows, outcome)
    }

    fn is_bonus(&self, row: &SqlRow) -> bool {
        row.get(&self.config.indicator_field)
            .and_then(SqlValue::key_string)
            .is_some_and(|v| v == self.config.indicator_value)
    }
}

fn line_order_key(row: &SqlRow, field: &str) -> f64 {
    row.get(field)
        .and_then(SqlValue::as_numeric)
        .unwrap_or(f64::MAX)
}

/// Force the quantity column to a number: numeric values (including
/// negatives) are kept, anything else becomes 0.
fn sanitize_quantity(row: &mut SqlRow, field: &str) {
    let sanitized = match row.get(field) {
        Some(v @ (SqlValue::Int(_) | SqlValue::Float(_) | SqlValue::Decimal(_))) => v.clone(),
        Some(SqlValue::Text(s)) => match s.trim().parse::<f64>() {
            Ok(n) => SqlValue::Float(n),
            Err(_) => SqlValue::Int(0),
        },
        _ => SqlValue::Int(0),
    };
    row.set(field, sanitized);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BonificationConfig {
        BonificationConfig {
            source_table: "LINEAS_PEDIDO".to_owned(),
            order_field: "pedido".to_owned(),
            line_order_field: "linea".to_owned(),
            indicator_field: "tipo".to_owned(),
            indicator_value: "B".to_owned(),
            regular_article_field: "articulo".to_owned(),
            reference_field: "articulo_ref".to_owned(),
            line_number_field: "num_linea".to_owned(),
            line_reference_field: "linea_ref".to_owned(),
            quantity_field: "cantidad".to_owned(),
        }
    }

    fn line(
        order: i64,
        line_order: i64,
        article: &str,
        kind: &str,
        reference: Option<&str>,
        quantity: SqlValue,
    ) -> SqlRow {
        let mut row = SqlRow::new();
        row.set("pedido", SqlValue::Int(order));
        row.set("linea", SqlValue::Int(line_order));
        row.set("articulo", SqlValue::Text(article.to_owned()));
        row.set("tipo", SqlValue::Text(kind.to_owned()));
        row.set(
            "articulo_ref",
            reference
                .map(|r| SqlValue::Text(r.to_owned()))
                .unwrap_or(SqlValue::Null),
        );
        row.set("cantidad", quantity);
        row
    }

    fn get_int(row: &SqlRow, field: &str) -> Option<i64> {
        match row.get(field) {
            Some(SqlValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    #[test]
    fn renumbers_and_links_bonus_lines() {
        // S3: two regular lines, two bonus lines referencing them.
        let rows = vec![
            line(1001, 10, "A", "R", None, SqlValue::Int(5)),
            line(1001, 20, "B", "R", None, SqlValue::Int(3)),
            line(1001, 30, "X", "B", Some("A"), SqlValue::Int(1)),
            line(1001, 40, "Y", "B", Some("B"), SqlValue::Int(1)),
        ];

        let mut processor = BonificationProcessor::new(config());
        let (out, outcome) = processor.process(rows);

        assert_eq!(out.len(), 4);
        assert_eq!(get_int(&out[0], "num_linea"), Some(1));
        assert_eq!(out[0].get("linea_ref"), Some(&SqlValue::Null));
        assert_eq!(get_int(&out[1], "num_linea"), Some(2));
        assert_eq!(out[1].get("linea_ref"), Some(&SqlValue::Null));

        assert_eq!(get_int(&out[2], "num_linea"), Some(3));
        assert_eq!(get_int(&out[2], "linea_ref"), Some(1));
        assert_eq!(out[2].get("articulo_ref"), Some(&SqlValue::Null));

        assert_eq!(get_int(&out[3], "num_linea"), Some(4));
        assert_eq!(get_int(&out[3], "linea_ref"), Some(2));

        assert_eq!(outcome.orders_processed, 1);
        assert_eq!(outcome.regular_lines, 2);
        assert_eq!(outcome.bonus_lines, 2);
        assert!(outcome.orphans.is_empty());
    }

    #[test]
    fn orphan_reference_is_flagged_not_dropped() {
        // S4: X references an article that is not in the order.
        let rows = vec![
            line(1001, 10, "A", "R", None, SqlValue::Int(5)),
            line(1001, 20, "B", "R", None, SqlValue::Int(3)),
            line(1001, 30, "X", "B", Some("Z"), SqlValue::Int(1)),
        ];

        let mut processor = BonificationProcessor::new(config());
        let (out, outcome) = processor.process(rows);

        assert_eq!(out.len(), 3);
        assert_eq!(get_int(&out[2], "num_linea"), Some(3));
        assert_eq!(out[2].get("linea_ref"), Some(&SqlValue::Null));
        assert_eq!(
            out[2].get("articulo_ref"),
            Some(&SqlValue::Text("REFERENCIA_NO_ENCONTRADA:Z".to_owned()))
        );

        assert_eq!(outcome.orphan_count(), 1);
        assert_eq!(outcome.orphans[0].referenced_code, "Z");
        assert_eq!(outcome.orphans[0].order, "1001");
    }

    #[test]
    fn reference_points_to_smaller_line_in_same_order() {
        let rows = vec![
            line(7, 1, "A", "R", None, SqlValue::Int(1)),
            line(7, 2, "X", "B", Some("A"), SqlValue::Int(1)),
            line(8, 1, "A", "R", None, SqlValue::Int(1)),
            line(8, 2, "Y", "B", Some("A"), SqlValue::Int(1)),
        ];

        let mut processor = BonificationProcessor::new(config());
        let (out, _) = processor.process(rows);

        // Each order renumbers from 1; references stay within the order.
        for row in &out {
            if let Some(line_ref) = get_int(row, "linea_ref") {
                let line_number = get_int(row, "num_linea").unwrap();
                assert!(line_ref < line_number);
            }
        }
        assert_eq!(get_int(&out[2], "num_linea"), Some(1));
        assert_eq!(get_int(&out[3], "linea_ref"), Some(1));
    }

    #[test]
    fn rows_sorted_by_line_order_before_numbering() {
        let rows = vec![
            line(1, 30, "C", "R", None, SqlValue::Int(1)),
            line(1, 10, "A", "R", None, SqlValue::Int(1)),
            line(1, 20, "B", "R", None, SqlValue::Int(1)),
        ];

        let mut processor = BonificationProcessor::new(config());
        let (out, _) = processor.process(rows);

        let articles: Vec<&str> = out
            .iter()
            .map(|r| r.get("articulo").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(articles, vec!["A", "B", "C"]);
        assert_eq!(get_int(&out[0], "num_linea"), Some(1));
        assert_eq!(get_int(&out[2], "num_linea"), Some(3));
    }

    #[test]
    fn processed_orders_guard_is_idempotent() {
        let make_rows = || {
            vec![
                line(5, 1, "A", "R", None, SqlValue::Int(2)),
                line(5, 2, "X", "B", Some("A"), SqlValue::Int(1)),
            ]
        };

        let mut processor = BonificationProcessor::new(config());
        let (first, outcome1) = processor.process(make_rows());
        // Same order again within the same execution: untouched passthrough.
        let (second, outcome2) = processor.process(first.clone());

        assert_eq!(first, second);
        assert_eq!(outcome1.orders_processed, 1);
        assert_eq!(outcome2.orders_processed, 0);
        assert_eq!(outcome2.bonus_lines, 0);
    }

    #[test]
    fn quantity_sanitization() {
        let rows = vec![
            line(2, 1, "A", "R", None, SqlValue::Text("not-a-number".to_owned())),
            line(2, 2, "B", "R", None, SqlValue::Null),
            line(2, 3, "C", "R", None, SqlValue::Int(-4)),
            line(2, 4, "D", "R", None, SqlValue::Text(" 2.5 ".to_owned())),
        ];

        let mut processor = BonificationProcessor::new(config());
        let (out, _) = processor.process(rows);

        assert_eq!(out[0].get("cantidad"), Some(&SqlValue::Int(0)));
        assert_eq!(out[1].get("cantidad"), Some(&SqlValue::Int(0)));
        assert_eq!(out[2].get("cantidad"), Some(&SqlValue::Int(-4)));
        assert_eq!(out[3].get("cantidad"), Some(&SqlValue::Float(2.5)));
    }

    #[test]
    fn bonus_with_null_reference_is_orphan() {
        let rows = vec![
            line(3, 1, "A", "R", None, SqlValue::Int(1)),
            line(3, 2, "X", "B", None, SqlValue::Int(1)),
        ];

        let mut processor = BonificationProcessor::new(config());
        let (out, outcome) = processor.process(rows);

        assert_eq!(out[1].get("linea_ref"), Some(&SqlValue::Null));
        assert_eq!(outcome.orphan_count(), 1);
        assert_eq!(outcome.orphans[0].referenced_code, "");
    }

    #[test]
    fn multiple_orders_in_one_batch() {
        let rows = vec![
            line(10, 1, "A", "R", None, SqlValue::Int(1)),
            line(11, 1, "B", "R", None, SqlValue::Int(1)),
            line(10, 2, "X", "B", Some("A"), SqlValue::Int(1)),
        ];

        let mut processor = BonificationProcessor::new(config());
        let (out, outcome) = processor.process(rows);

        assert_eq!(outcome.orders_processed, 2);
        // Groups come back in first-appearance order: order 10 then 11.
        assert_eq!(get_int(&out[0], "num_linea"), Some(1));
        assert_eq!(get_int(&out[1], "num_linea"), Some(2));
        assert_eq!(get_int(&out[1], "linea_ref"), Some(1));
        assert_eq!(get_int(&out[2], "num_linea"), Some(1));
    }
}
