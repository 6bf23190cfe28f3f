// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource names and page tokens.
//!
//! Entities are identified by hierarchical resource names of the form
//! `type/id(/type/id)*`, e.g. `apps/a1/releases/r1/scale/s1`. Helpers here
//! parse a single id out of such a name by keyword and format names back.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

/// Parse the id following `keyword` out of a resource name.
///
/// Returns `None` when the keyword is absent or has no id segment.
pub fn parse_id_from_name<'a>(name: &'a str, keyword: &str) -> Option<&'a str> {
    let mut segments = name.split('/');
    while let Some(segment) = segments.next() {
        let id = segments.next()?;
        if segment == keyword && !id.is_empty() {
            return Some(id);
        }
    }
    None
}

/// Collect the distinct ids for `keyword` across a list of name filters,
/// preserving first-seen order.
pub fn parse_ids_from_name_filters(name_filters: &[String], keyword: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for name in name_filters {
        if let Some(id) = parse_id_from_name(name, keyword) {
            if seen.insert(id.to_string()) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

/// Collect the distinct app ids across a list of name filters.
pub fn parse_app_ids_from_name_filters(name_filters: &[String]) -> Vec<String> {
    parse_ids_from_name_filters(name_filters, "apps")
}

pub fn app_name(app_id: &str) -> String {
    format!("apps/{app_id}")
}

pub fn release_name(app_id: &str, release_id: &str) -> String {
    format!("apps/{app_id}/releases/{release_id}")
}

pub fn scale_request_name(app_id: &str, release_id: &str, scale_request_id: &str) -> String {
    format!("apps/{app_id}/releases/{release_id}/scale/{scale_request_id}")
}

pub fn deployment_name(app_id: &str, deployment_id: &str) -> String {
    format!("apps/{app_id}/deployments/{deployment_id}")
}

/// Opaque pagination cursor.
///
/// The string form is `"<before_id>:<size>"` with an empty cursor slot
/// allowed; the zero token formats to the empty string and the empty string
/// parses to the zero token, so `parse(format(parse(s)))` equals `parse(s)`
/// for every valid token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageToken {
    pub before_id: Option<i64>,
    pub size: i32,
}

/// Error produced by [`PageToken::parse`] on malformed input.
#[derive(Debug, Error)]
#[error("malformed page token {0:?}")]
pub struct MalformedPageToken(pub String);

impl PageToken {
    /// Parse a page token from its string form.
    pub fn parse(s: &str) -> Result<Self, MalformedPageToken> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let (cursor, size) = s
            .split_once(':')
            .ok_or_else(|| MalformedPageToken(s.to_string()))?;
        let before_id = if cursor.is_empty() {
            None
        } else {
            Some(
                cursor
                    .parse::<i64>()
                    .map_err(|_| MalformedPageToken(s.to_string()))?,
            )
        };
        let size = size
            .parse::<i32>()
            .map_err(|_| MalformedPageToken(s.to_string()))?;
        if size < 0 {
            return Err(MalformedPageToken(s.to_string()));
        }
        Ok(Self { before_id, size })
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.before_id.is_none() && self.size == 0 {
            return Ok(());
        }
        match self.before_id {
            Some(id) => write!(f, "{}:{}", id, self.size),
            None => write!(f, ":{}", self.size),
        }
    }
}
