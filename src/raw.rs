//! Borrowed, order-preserving view over one JSON object.
//!
//! Keys are decoded, values stay as raw slices of the input so large
//! subtrees (base64 media in particular) are never copied or re-encoded.
//! Only values replaced through [`RawObject::set`] are owned.

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::value::RawValue;
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Default)]
pub struct RawObject<'a> {
    entries: Vec<(String, Cow<'a, RawValue>)>,
}

impl<'a> RawObject<'a> {
    pub fn parse(input: &'a [u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(input)
    }

    pub fn parse_raw(value: &'a RawValue) -> serde_json::Result<Self> {
        serde_json::from_str(value.get())
    }

    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| &**v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Replace in place, or append when the key is new.
    pub fn set(&mut self, key: &str, value: Box<RawValue>) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = Cow::Owned(value),
            None => self.entries.push((key.to_string(), Cow::Owned(value))),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), &**v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_raw(&self) -> serde_json::Result<Box<RawValue>> {
        serde_json::value::to_raw_value(self)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Whether a raw value is JSON `null`.
pub fn is_null(value: &RawValue) -> bool {
    value.get().trim() == "null"
}

pub fn is_object(value: &RawValue) -> bool {
    value.get().trim_start().starts_with('{')
}

/// Borrow the elements of a raw JSON array.
pub fn parse_array(value: &RawValue) -> serde_json::Result<Vec<&RawValue>> {
    serde_json::from_str(value.get())
}

/// Re-encode a list of raw elements as one array.
pub fn to_raw_array<'v>(
    items: impl IntoIterator<Item = &'v RawValue>,
) -> serde_json::Result<Box<RawValue>> {
    let borrowed: Vec<&RawValue> = items.into_iter().collect();
    serde_json::value::to_raw_value(&borrowed)
}

impl<'de> Deserialize<'de> for RawObject<'de> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ObjectVisitor;

        impl<'de> Visitor<'de> for ObjectVisitor {
            type Value = RawObject<'de>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(8));
                while let Some((key, value)) = map.next_entry::<String, &'de RawValue>()? {
                    entries.push((key, Cow::Borrowed(value)));
                }
                Ok(RawObject { entries })
            }
        }

        deserializer.deserialize_map(ObjectVisitor)
    }
}

impl Serialize for RawObject<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, &**value)?;
        }
        map.end()
    }
}
