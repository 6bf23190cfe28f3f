// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request filter matching.
//!
//! Label filters and release-type filters are evaluated server-side against
//! materialized records and against live event payloads; both transports use
//! the same semantics.

use std::collections::{HashMap, HashSet};

use crate::controller::label_filter::expression::Op;
use crate::controller::{LabelFilter, ReleaseType};

/// Returns true iff the labels match the filter list.
///
/// Expressions within one filter AND together; filters OR together; an empty
/// filter list matches everything.
pub fn match_label_filters(labels: &HashMap<String, String>, filters: &[LabelFilter]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|filter| {
        filter
            .expressions
            .iter()
            .all(|expr| match expr.op() {
                Op::Eq => labels
                    .get(&expr.key)
                    .is_some_and(|v| expr.values.contains(v)),
                Op::NotEq => labels
                    .get(&expr.key)
                    .is_none_or(|v| !expr.values.contains(v)),
                Op::Exists => labels.contains_key(&expr.key),
                Op::NotExists => !labels.contains_key(&expr.key),
            })
    })
}

/// Matcher over the closed set of release-type tags.
///
/// An empty filter list accepts every type; `RELEASE_TYPE_ANY` in the filter
/// list likewise accepts every type.
pub struct ReleaseTypeMatcher {
    types: HashSet<i32>,
    any: bool,
}

impl ReleaseTypeMatcher {
    /// Build a matcher from the raw filter values of a request.
    pub fn new(type_filters: &[i32]) -> Self {
        let types: HashSet<i32> = type_filters.iter().copied().collect();
        let any = types.is_empty() || types.contains(&(ReleaseType::Any as i32));
        Self { types, any }
    }

    /// Returns true iff the given release type passes the filter.
    pub fn matches(&self, release_type: ReleaseType) -> bool {
        self.any || self.types.contains(&(release_type as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::label_filter::Expression;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn filter(exprs: Vec<Expression>) -> LabelFilter {
        LabelFilter { expressions: exprs }
    }

    fn expr(key: &str, op: Op, values: &[&str]) -> Expression {
        Expression {
            key: key.to_string(),
            op: op as i32,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn empty_filter_list_matches_everything() {
        assert!(match_label_filters(&labels(&[]), &[]));
        assert!(match_label_filters(&labels(&[("a", "1")]), &[]));
    }

    #[test]
    fn eq_matches_value_in_set() {
        let filters = vec![filter(vec![expr("env", Op::Eq, &["prod", "staging"])])];
        assert!(match_label_filters(&labels(&[("env", "prod")]), &filters));
        assert!(!match_label_filters(&labels(&[("env", "dev")]), &filters));
        assert!(!match_label_filters(&labels(&[]), &filters));
    }

    #[test]
    fn not_eq_matches_absent_key() {
        let filters = vec![filter(vec![expr("env", Op::NotEq, &["prod"])])];
        assert!(match_label_filters(&labels(&[("env", "dev")]), &filters));
        assert!(match_label_filters(&labels(&[]), &filters));
        assert!(!match_label_filters(&labels(&[("env", "prod")]), &filters));
    }

    #[test]
    fn exists_and_not_exists() {
        let exists = vec![filter(vec![expr("owner", Op::Exists, &[])])];
        assert!(match_label_filters(&labels(&[("owner", "x")]), &exists));
        assert!(!match_label_filters(&labels(&[]), &exists));

        let not_exists = vec![filter(vec![expr("owner", Op::NotExists, &[])])];
        assert!(!match_label_filters(&labels(&[("owner", "x")]), &not_exists));
        assert!(match_label_filters(&labels(&[]), &not_exists));
    }

    #[test]
    fn expressions_and_filters_or() {
        // Expressions within a filter AND together.
        let strict = vec![filter(vec![
            expr("env", Op::Eq, &["prod"]),
            expr("owner", Op::Exists, &[]),
        ])];
        assert!(match_label_filters(
            &labels(&[("env", "prod"), ("owner", "x")]),
            &strict
        ));
        assert!(!match_label_filters(&labels(&[("env", "prod")]), &strict));

        // Filters OR together.
        let either = vec![
            filter(vec![expr("env", Op::Eq, &["prod"])]),
            filter(vec![expr("env", Op::Eq, &["dev"])]),
        ];
        assert!(match_label_filters(&labels(&[("env", "dev")]), &either));
        assert!(!match_label_filters(&labels(&[("env", "qa")]), &either));
    }

    #[test]
    fn release_type_matcher() {
        let all = ReleaseTypeMatcher::new(&[]);
        assert!(all.matches(ReleaseType::Code));
        assert!(all.matches(ReleaseType::Config));

        let code_only = ReleaseTypeMatcher::new(&[ReleaseType::Code as i32]);
        assert!(code_only.matches(ReleaseType::Code));
        assert!(!code_only.matches(ReleaseType::Config));

        let any = ReleaseTypeMatcher::new(&[ReleaseType::Any as i32]);
        assert!(any.matches(ReleaseType::Config));
    }
}
