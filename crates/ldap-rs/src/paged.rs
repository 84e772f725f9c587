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

use std::time::Duration;

use tracing::debug;

use crate::codec::{tag, BerReader, BerWriter};
use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result};
use crate::message::{Control, ProtocolOp, Request, SearchRequest};
use crate::strategy::Strategy;

/// Simple paged results control (RFC 2696)
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Request control asking for `size` entries after `cookie`.
pub fn paged_control(size: u32, cookie: &[u8], criticality: bool) -> Control {
    let mut w = BerWriter::new();
    w.write_constructed(tag::SEQUENCE, |w| {
        w.write_integer(tag::INTEGER, i64::from(size));
        w.write_octets(tag::OCTET_STRING, cookie);
    });
    Control::new(PAGED_RESULTS_OID, criticality, Some(w.into_bytes()))
}

/// Decode the value of a paged results control into `(size, cookie)`.
///
/// In a response, `size` is the server's estimate of the total result set.
pub fn decode_paged_control(control: &Control) -> Result<(u32, Vec<u8>)> {
    if control.oid != PAGED_RESULTS_OID {
        return Err(LdapError::operation_failed(format!(
            "control {} is not a paged results control",
            control.oid
        )));
    }
    let value = control
        .value
        .as_deref()
        .ok_or_else(|| LdapError::operation_failed("paged results control without a value"))?;

    let mut outer = BerReader::new(value);
    let mut body = outer.expect(tag::SEQUENCE, "paged results value")?.reader();
    outer.finish("paged results value")?;
    let size = body.read_unsigned("page size")?;
    let cookie = body.read_octets("page cookie")?.to_vec();
    body.finish("paged results value")?;
    Ok((size, cookie))
}

/// The cookie of the paged results control on `bundle`'s final message.
pub fn page_cookie(bundle: &ResponseBundle) -> Result<Option<Vec<u8>>> {
    bundle
        .controls()
        .iter()
        .find(|control| control.oid == PAGED_RESULTS_OID)
        .map(|control| decode_paged_control(control).map(|(_, cookie)| cookie))
        .transpose()
}

/// Iterates a search one page at a time.
///
/// Each item is one complete page. Iteration ends after the page whose
/// cookie is empty, or after the first error. Start over with a new
/// `PagedSearch` to re-run the search.
pub struct PagedSearch<'a> {
    strategy: &'a dyn Strategy,
    search: SearchRequest,
    controls: Vec<Control>,
    page_size: u32,
    criticality: bool,
    timeout: Option<Duration>,
    cookie: Vec<u8>,
    pages: usize,
    finished: bool,
}

impl<'a> PagedSearch<'a> {
    pub fn new(strategy: &'a dyn Strategy, search: SearchRequest, page_size: u32) -> Self {
        Self {
            strategy,
            search,
            controls: Vec::new(),
            page_size,
            criticality: false,
            timeout: None,
            cookie: Vec::new(),
            pages: 0,
            finished: false,
        }
    }

    /// Extra controls sent with every page request.
    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    /// Mark the paging control critical, so servers without paging support
    /// refuse instead of returning everything at once.
    pub fn critical(mut self) -> Self {
        self.criticality = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pages returned so far
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn next_page(&mut self) -> Option<Result<ResponseBundle>> {
        if self.finished {
            return None;
        }

        let mut request = Request::new(ProtocolOp::SearchRequest(self.search.clone()));
        request.controls = self.controls.clone();
        request
            .controls
            .push(paged_control(self.page_size, &self.cookie, self.criticality));

        let page = self
            .strategy
            .execute(request, self.timeout)
            .and_then(|bundle| page_cookie(&bundle).map(|cookie| (bundle, cookie)));
        match page {
            Ok((bundle, cookie)) => {
                self.pages += 1;
                match cookie {
                    Some(cookie) if !cookie.is_empty() => self.cookie = cookie,
                    _ => self.finished = true,
                }
                debug!(page = self.pages, entries = bundle.entries().count(), last = self.finished, "search page");
                Some(Ok(bundle))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl Iterator for PagedSearch<'_> {
    type Item = Result<ResponseBundle>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_page()
    }
}
