//! Ordered, typed message container.
//!
//! Fields are little-endian and padded to 4 bytes. Readers must consume
//! fields in exactly the order the writer produced them; every read is
//! bounds-checked and fails closed.
//!
//! Remote-object handles do not live in the byte stream. The stream holds
//! a marker and a slot index into an out-of-band object table, so a parcel
//! with objects can only cross an in-process transport.

use std::fmt;

use super::RemoteHandle;

const OBJECT_MARKER: u32 = 0x6f62_6a21;
const NULL_OBJECT_MARKER: u32 = 0x6e75_6c6c;
const ALIGN: usize = 4;

/// Codec errors. Any of these at a stub boundary rejects the transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParcelError {
    #[error("read of {needed} bytes past end of parcel ({remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("declared length {len} exceeds bound {max}")]
    LengthOutOfBounds { len: usize, max: usize },

    #[error("invalid bool encoding {0}")]
    InvalidBool(u32),

    #[error("unexpected object marker {0:#x}")]
    BadObjectMarker(u32),

    #[error("object slot {0} missing from object table")]
    MissingObject(u32),

    #[error("required field `{0}` was null")]
    NullField(&'static str),

    #[error("value {value} is not a valid {name}")]
    InvalidEnum { name: &'static str, value: u32 },
}

/// A value that can be written into and read back from a parcel.
pub trait Parcelable: Sized {
    fn marshal(&self, parcel: &mut Parcel);
    fn unmarshal(parcel: &mut Parcel) -> Result<Self, ParcelError>;
}

/// Request or reply payload.
#[derive(Clone, Default)]
pub struct Parcel {
    data: Vec<u8>,
    read_pos: usize,
    objects: Vec<RemoteHandle>,
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("len", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a data-only parcel from its wire bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            read_pos: 0,
            objects: Vec::new(),
        }
    }

    /// Wire bytes. Object handles are not included; check
    /// [`has_objects`](Self::has_objects) before sending out of process.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn has_objects(&self) -> bool {
        !self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes not yet consumed by reads.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    // ── Writers ──────────────────────────────────────────────────────

    fn write_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        let pad = (ALIGN - self.data.len() % ALIGN) % ALIGN;
        self.data.extend(std::iter::repeat(0).take(pad));
    }

    pub fn write_interface_token(&mut self, descriptor: &str) {
        self.write_string(descriptor);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u32(u32::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_raw(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_raw(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_raw(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_raw(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_raw(&value.to_le_bytes());
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_i32(value.len() as i32);
        self.write_raw(value.as_bytes());
    }

    pub fn write_optional_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => self.write_string(s),
            None => self.write_i32(-1),
        }
    }

    pub fn write_i32_vec(&mut self, values: &[i32]) {
        self.write_u32(values.len() as u32);
        for v in values {
            self.write_i32(*v);
        }
    }

    pub fn write_remote_object(&mut self, object: Option<&RemoteHandle>) {
        match object {
            Some(obj) => {
                let slot = self.objects.len() as u32;
                self.objects.push(RemoteHandle::clone(obj));
                self.write_u32(OBJECT_MARKER);
                self.write_u32(slot);
            },
            None => self.write_u32(NULL_OBJECT_MARKER),
        }
    }

    /// Presence flag followed by the value.
    pub fn write_parcelable<T: Parcelable>(&mut self, value: Option<&T>) {
        self.write_bool(value.is_some());
        if let Some(v) = value {
            v.marshal(self);
        }
    }

    // ── Readers ──────────────────────────────────────────────────────

    fn read_raw(&mut self, len: usize) -> Result<&[u8], ParcelError> {
        let padded = len + (ALIGN - len % ALIGN) % ALIGN;
        let remaining = self.remaining();
        if padded > remaining {
            return Err(ParcelError::Truncated {
                needed: padded,
                remaining,
            });
        }
        let start = self.read_pos;
        self.read_pos += padded;
        Ok(&self.data[start..start + len])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ParcelError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    pub fn read_interface_token(&mut self) -> Result<String, ParcelError> {
        self.read_string()
    }

    pub fn read_bool(&mut self) -> Result<bool, ParcelError> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ParcelError::InvalidBool(other)),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32, ParcelError> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, ParcelError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, ParcelError> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, ParcelError> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, ParcelError> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_optional_string(&mut self) -> Result<Option<String>, ParcelError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        let remaining = self.remaining();
        if len > remaining {
            return Err(ParcelError::LengthOutOfBounds {
                len,
                max: remaining,
            });
        }
        let bytes = self.read_raw(len)?.to_vec();
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| ParcelError::InvalidUtf8)
    }

    pub fn read_string(&mut self) -> Result<String, ParcelError> {
        self.read_optional_string()?
            .ok_or(ParcelError::NullField("string"))
    }

    /// Read a length prefix and check it against `max` and the bytes left,
    /// given `elem_size` bytes per element.
    pub fn read_len(&mut self, max: usize, elem_size: usize) -> Result<usize, ParcelError> {
        let len = self.read_u32()? as usize;
        if len > max {
            return Err(ParcelError::LengthOutOfBounds { len, max });
        }
        let remaining = self.remaining();
        if len.saturating_mul(elem_size) > remaining {
            return Err(ParcelError::Truncated {
                needed: len.saturating_mul(elem_size),
                remaining,
            });
        }
        Ok(len)
    }

    pub fn read_i32_vec(&mut self, max: usize) -> Result<Vec<i32>, ParcelError> {
        let len = self.read_len(max, ALIGN)?;
        (0..len).map(|_| self.read_i32()).collect()
    }

    pub fn read_remote_object(&mut self) -> Result<Option<RemoteHandle>, ParcelError> {
        match self.read_u32()? {
            NULL_OBJECT_MARKER => Ok(None),
            OBJECT_MARKER => {
                let slot = self.read_u32()?;
                self.objects
                    .get(slot as usize)
                    .cloned()
                    .map(Some)
                    .ok_or(ParcelError::MissingObject(slot))
            },
            other => Err(ParcelError::BadObjectMarker(other)),
        }
    }

    /// Read a handle that the protocol requires to be present.
    pub fn read_required_object(&mut self, field: &'static str) -> Result<RemoteHandle, ParcelError> {
        self.read_remote_object()?
            .ok_or(ParcelError::NullField(field))
    }

    pub fn read_parcelable<T: Parcelable>(&mut self) -> Result<Option<T>, ParcelError> {
        if self.read_bool()? {
            T::unmarshal(self).map(Some)
        } else {
            Ok(None)
        }
    }
}
