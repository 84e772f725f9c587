// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Ranged attribute retrieval.
//!
//! Servers that cap the number of values per attribute return
//! `member;range=0-1499` instead of `member`. The remaining fragments are
//! fetched with base-scoped searches until a fragment ends in `*`, and all
//! values are merged back under the plain attribute name.

use tracing::{debug, warn};

use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result};
use crate::message::{Attribute, ProtocolOp, Request, SearchEntry};
use crate::ops;

/// `attr;range=low-high` split into its parts. `high` is `None` for `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeOption {
    pub attribute: String,
    pub low: u64,
    pub high: Option<u64>,
}

impl RangeOption {
    pub fn parse(description: &str) -> Option<Self> {
        let mut options = Vec::new();
        let mut range = None;
        for (i, part) in description.split(';').enumerate() {
            let bounds = part
                .get(..6)
                .filter(|prefix| i > 0 && prefix.eq_ignore_ascii_case("range="))
                .and_then(|_| part.get(6..))
                .filter(|bounds| !bounds.is_empty());
            match bounds {
                Some(bounds) => range = Some(bounds),
                None => options.push(part),
            }
        }
        let (low, high) = range?.split_once('-')?;
        Some(Self {
            attribute: options.join(";"),
            low: low.parse().ok()?,
            high: match high {
                "*" => None,
                n => Some(n.parse().ok()?),
            },
        })
    }

    /// Description asking for everything after a fragment ending at `high`
    fn next_request(&self, dn: &str, high: u64) -> Result<String> {
        let from = high.checked_add(1).ok_or_else(|| {
            LdapError::operation_failed(format!(
                "range for {} on {dn} ends at {high} and cannot be continued",
                self.attribute
            ))
        })?;
        Ok(format!("{};range={from}-*", self.attribute))
    }
}

/// Fetch the missing fragments of every ranged attribute in `bundle`.
///
/// `fetch` runs one follow-up search and returns its bundle.
pub(crate) fn resolve_ranges<F>(bundle: ResponseBundle, mut fetch: F) -> Result<ResponseBundle>
where
    F: FnMut(Request) -> Result<ResponseBundle>,
{
    let has_ranges = bundle
        .entries()
        .any(|entry| entry.attributes.iter().any(|a| RangeOption::parse(&a.name).is_some()));
    if !has_ranges {
        return Ok(bundle);
    }

    let message_id = bundle.message_id();
    let (mut interim, terminal) = bundle.into_parts();
    for message in interim.iter_mut() {
        if let ProtocolOp::SearchResultEntry(entry) = &mut message.op {
            resolve_entry(entry, &mut fetch)?;
        }
    }
    ResponseBundle::from_parts(message_id, interim, terminal)
}

fn resolve_entry<F>(entry: &mut SearchEntry, fetch: &mut F) -> Result<()>
where
    F: FnMut(Request) -> Result<ResponseBundle>,
{
    let (ranged, mut plain): (Vec<Attribute>, Vec<Attribute>) = std::mem::take(&mut entry.attributes)
        .into_iter()
        .partition(|a| RangeOption::parse(&a.name).is_some());

    for attribute in ranged {
        let Some(range) = RangeOption::parse(&attribute.name) else {
            continue;
        };
        let mut values = attribute.values;
        let mut upper = range.high;

        while let Some(high) = upper {
            let next_description = range.next_request(&entry.dn, high)?;
            debug!(dn = %entry.dn, attribute = %next_description, "fetching attribute range");
            let response = fetch(ops::read_entry(entry.dn.clone(), [next_description]))?;
            let fragment = response.entries().find_map(|found| {
                found.attributes.iter().find_map(|a| {
                    RangeOption::parse(&a.name)
                        .filter(|r| r.attribute.eq_ignore_ascii_case(&range.attribute))
                        .map(|r| (r, a.values.clone()))
                })
            });
            let Some((next, more)) = fragment else {
                warn!(dn = %entry.dn, attribute = %range.attribute, "server returned no further range");
                break;
            };
            if next.high.is_some_and(|next_high| next_high <= high) {
                return Err(LdapError::operation_failed(format!(
                    "range for {} on {} did not advance past {}",
                    range.attribute, entry.dn, high
                )));
            }
            values.extend(more);
            upper = next.high;
        }

        match plain
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(&range.attribute))
        {
            Some(existing) => existing.values.extend(values),
            None => plain.push(Attribute {
                name: range.attribute,
                values,
            }),
        }
    }

    entry.attributes = plain;
    Ok(())
}
