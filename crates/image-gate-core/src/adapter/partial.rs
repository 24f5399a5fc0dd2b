//! Incremental JSON readers that keep whatever was decoded before an error.
//!
//! Tool output can be truncated (killed process, full disk, crashed writer). A
//! plain `serde_json::from_str` throws away every element in that case; these
//! seeds push each element into a caller-owned buffer as soon as it is complete.

use std::fmt;

use serde::de::{DeserializeSeed, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;

/// Run `seed` over `raw`, requiring the document to end cleanly.
pub(crate) fn deserialize_partial<'de, S>(raw: &'de str, seed: S) -> Result<(), serde_json::Error>
where
    S: DeserializeSeed<'de, Value = ()>,
{
    let mut de = serde_json::Deserializer::from_str(raw);
    seed.deserialize(&mut de)?;
    de.end()
}

/// Appends each element of a JSON array to `out`. `null` counts as an empty array.
pub(crate) struct CollectSeq<'a, T> {
    out: &'a mut Vec<T>,
}

impl<'a, T> CollectSeq<'a, T> {
    pub(crate) fn new(out: &'a mut Vec<T>) -> Self {
        Self { out }
    }
}

impl<'de, 'a, T> DeserializeSeed<'de> for CollectSeq<'a, T>
where
    T: Deserialize<'de>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de, 'a, T> Visitor<'de> for CollectSeq<'a, T>
where
    T: Deserialize<'de>,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array or null")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(item) = seq.next_element::<T>()? {
            self.out.push(item);
        }
        Ok(())
    }
}
