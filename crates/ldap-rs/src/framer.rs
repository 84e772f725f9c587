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

//! Splits a receive buffer into complete BER messages.
//!
//! Only the tag and length octets are inspected. Payloads are left for the
//! codec, and incomplete messages stay in the remainder so the next receive
//! can be appended to them.

use crate::error::FramingError;

/// Slice every complete message off the front of `buffer`.
///
/// Returns the message spans in arrival order and the unconsumed tail. A
/// buffer of two bytes or fewer never yields a message.
pub fn extract_messages(buffer: &[u8]) -> Result<(Vec<&[u8]>, &[u8]), FramingError> {
    extract_messages_with_limit(buffer, usize::MAX)
}

/// Like [`extract_messages`], refusing any message whose declared value
/// length exceeds `limit`.
pub fn extract_messages_with_limit(
    buffer: &[u8],
    limit: usize,
) -> Result<(Vec<&[u8]>, &[u8]), FramingError> {
    let mut messages = Vec::new();
    let mut offset = 0;

    loop {
        let rest = &buffer[offset..];
        match frame_length(rest, offset, limit)? {
            Some(total) if total <= rest.len() => {
                messages.push(&rest[..total]);
                offset += total;
            }
            _ => break,
        }
    }

    Ok((messages, &buffer[offset..]))
}

/// Total length (header included) of the message at the start of `data`,
/// or `None` if the header itself is still incomplete.
fn frame_length(data: &[u8], position: usize, limit: usize) -> Result<Option<usize>, FramingError> {
    if data.len() <= 2 {
        return Ok(None);
    }

    let first = data[1];
    if first <= 0x7F {
        return Ok(Some(first as usize + 2));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 {
        return Err(FramingError::IndefiniteLength {
            position: position + 1,
        });
    }
    if count > std::mem::size_of::<usize>() {
        return Err(FramingError::LengthOverflow { octets: count });
    }
    let Some(octets) = data.get(2..2 + count) else {
        return Ok(None);
    };

    let length = octets.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if length > limit {
        return Err(FramingError::MessageTooLarge { length, limit });
    }
    length
        .checked_add(2 + count)
        .map(Some)
        .ok_or(FramingError::LengthOverflow { octets: count })
}
