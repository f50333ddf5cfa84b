use std::borrow::Cow;

pub(crate) mod serde_helper {
    use core::fmt;
    use serde::de::{Error, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::ops::Deref;

    pub(crate) mod optional_offset_date_time {
        use serde::{self, Deserializer, Serializer};
        use std::option::Option;
        use time::serde::rfc3339;
        use time::OffsetDateTime;

        pub fn serialize<S>(
            input: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match input {
                None => serializer.serialize_none(),
                Some(time) => rfc3339::serialize(time, serializer),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            rfc3339::deserialize(deserializer).map(Some)
        }
    }

    /// PassthroughBytes is a serde-deserializable type that simply takes in a byte array as input
    /// and deserializes it unchanged.
    #[derive(Debug)]
    pub struct PassthroughBytes {
        inner: Vec<u8>,
    }

    pub(crate) struct PassthroughBytesVisitor;

    impl<'de> Visitor<'de> for PassthroughBytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a byte array")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(v)
        }
    }

    impl<'de> Deserialize<'de> for PassthroughBytes {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let bytes: Vec<u8> = deserializer.deserialize_byte_buf(PassthroughBytesVisitor)?;
            Ok(Self { inner: bytes })
        }
    }

    impl PassthroughBytes {
        pub fn into_inner(self) -> Vec<u8> {
            self.inner
        }
    }

    impl Deref for PassthroughBytes {
        type Target = Vec<u8>;

        fn deref(&self) -> &Self::Target {
            &self.inner
        }
    }
}

/// Makes `name` safe for use as a file name or cache key: every run of characters other than
/// ASCII letters and digits becomes a single `_`. With `wildcard`, a leading `*` is spelled out
/// as `_wildcard` first, so `*.example.com` and `_.example.com` stay distinct.
pub fn sanitize(name: &str, wildcard: bool) -> String {
    let name = match name.strip_prefix('*') {
        Some(rest) if wildcard => Cow::Owned(format!("_wildcard{rest}")),
        _ => Cow::Borrowed(name),
    };
    let mut sanitized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
            in_separator = false;
        } else if !in_separator {
            sanitized.push('_');
            in_separator = true;
        }
    }
    sanitized
}
