// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

use byteorder::{BigEndian, ByteOrder};

use crate::error::DecodeError;
use crate::utils;

/// A read-only cursor over a decoded packet's bytes.
///
/// Every packet field is read through one of these accessors so that a
/// short buffer always fails with [`DecodeError::Incomplete`] instead of
/// panicking mid-decode.
pub struct ByteArray<'a> {
    offset: usize,
    data: &'a [u8],
}

impl<'a> ByteArray<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { offset: 0, data }
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    pub fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.data.get(self.offset).ok_or(DecodeError::Incomplete)?;
        self.offset += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(BigEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(DecodeError::Incomplete)?;
        if end > self.data.len() {
            return Err(DecodeError::Incomplete);
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Read a two-byte-length-prefixed UTF-8 string, validating it per
    /// §4.1's disallowed code point rules.
    pub fn read_utf8_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8String)?;
        utils::validate_utf8_string(s)?;
        Ok(s.to_string())
    }

    /// Read a two-byte-length-prefixed binary blob (no UTF-8 constraint).
    pub fn read_binary(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// The unread tail, without consuming it. Used to peek ahead (e.g. to
    /// read CONNECT's protocol name/level before picking a v3 or v5 decode
    /// path) without cloning the cursor's position by hand.
    #[must_use]
    pub fn peek_remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}
