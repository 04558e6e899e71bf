use bytes::Bytes;
use std::collections::BTreeMap;

/// Object creation behavior within a write op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Fail with `AlreadyExists` if the object is present.
    Exclusive,
    /// Create if absent, leave an existing object alone.
    Idempotent,
}

/// A batched read applied atomically by [`crate::ObjectStore::read`].
///
/// Builders accumulate into an owned op which the store consumes; there is
/// nothing to release on early-return paths.
#[derive(Debug, Default)]
pub struct ReadOp {
    pub(crate) read: Option<(u64, usize)>,
    pub(crate) get_keys: Option<(String, u32)>,
    pub(crate) get_vals: Option<(String, u32)>,
    pub(crate) get_vals_by_keys: Vec<String>,
}

impl ReadOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `len` data bytes starting at `off`. Short objects yield short
    /// reads, not errors.
    pub fn read(mut self, off: u64, len: usize) -> Self {
        self.read = Some((off, len));
        self
    }

    /// Fetch up to `max` omap keys greater than `after`, setting
    /// [`ReadResult::more`] when keys remain. Values are left empty.
    pub fn omap_get_keys(mut self, after: &str, max: u32) -> Self {
        self.get_keys = Some((after.to_owned(), max));
        self
    }

    /// Fetch up to `max` omap key/value pairs greater than `after`, setting
    /// [`ReadResult::more`] when entries remain.
    pub fn omap_get_vals(mut self, after: &str, max: u32) -> Self {
        self.get_vals = Some((after.to_owned(), max));
        self
    }

    /// Fetch the values of exactly the named keys. Absent keys are simply
    /// absent from the result.
    pub fn omap_get_vals_by_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.get_vals_by_keys
            .extend(keys.into_iter().map(Into::into));
        self
    }
}

/// Results of a [`ReadOp`], including the object version token observed by
/// the atomic read.
#[derive(Debug, Default)]
pub struct ReadResult {
    /// Data bytes, present when the op requested a data read.
    pub data: Option<Bytes>,
    /// Omap entries from whichever omap reads the op requested.
    pub omap: BTreeMap<String, Bytes>,
    /// True when a bounded omap read stopped short of the full map.
    pub more: bool,
    /// Version token for a subsequent `assert_version` write.
    pub version: u64,
}

/// A batched write applied atomically by [`crate::ObjectStore::write`].
#[derive(Debug, Default)]
pub struct WriteOp {
    pub(crate) assert_version: Option<u64>,
    pub(crate) create: Option<CreateMode>,
    pub(crate) write_full: Option<Bytes>,
    pub(crate) omap_clear: bool,
    pub(crate) omap_set: Vec<(String, Bytes)>,
    pub(crate) omap_rm_keys: Vec<String>,
    pub(crate) remove: bool,
}

impl WriteOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard the whole op on the object still being at `version`.
    pub fn assert_version(mut self, version: u64) -> Self {
        self.assert_version = Some(version);
        self
    }

    pub fn create(mut self, mode: CreateMode) -> Self {
        self.create = Some(mode);
        self
    }

    /// Replace the object's data bytes.
    pub fn write_full(mut self, data: Bytes) -> Self {
        self.write_full = Some(data);
        self
    }

    pub fn omap_clear(mut self) -> Self {
        self.omap_clear = true;
        self
    }

    pub fn omap_set<I, K>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Bytes)>,
        K: Into<String>,
    {
        self.omap_set
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    pub fn omap_rm_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.omap_rm_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Delete the object outright.
    pub fn remove(mut self) -> Self {
        self.remove = true;
        self
    }
}
