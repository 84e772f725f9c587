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

/// State of one LDAP session.
///
/// Only strategies change it, in response to open, bind, StartTLS and
/// close. The correlator never touches it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub struct SessionState {
    pub open: bool,
    pub bound: bool,
    pub tls_active: bool,
}

impl SessionState {
    pub(crate) fn opened(tls_active: bool) -> Self {
        Self {
            open: true,
            bound: false,
            tls_active,
        }
    }

    pub fn closed() -> Self {
        Self::default()
    }
}
