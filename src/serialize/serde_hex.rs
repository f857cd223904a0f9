//! Serialize addresses as `"0x..."` strings, which is how anyone reading a
//! census will want to see them. Deserialization also accepts plain integers.

use std::{fmt, marker::PhantomData};

use serde::{de::Visitor, Deserializer, Serializer};

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

pub trait FromUsize: Copy {
    fn from_usize(value: usize) -> Self;
}

impl AsUsize for usize {
    fn as_usize(self) -> usize {
        self
    }
}

impl FromUsize for usize {
    fn from_usize(value: usize) -> Self {
        value
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsUsize,
{
    serializer.collect_str(&format_args!("{:#x}", value.as_usize()))
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromUsize,
{
    struct V<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for V<T>
    where
        T: FromUsize,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an address, as a hex string or an integer")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            usize::try_from(v)
                .map(T::from_usize)
                .map_err(|_| E::custom("address does not fit in usize"))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v
                .strip_prefix("0x")
                .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(v), &self))?;
            usize::from_str_radix(digits, 16)
                .map(T::from_usize)
                .map_err(E::custom)
        }
    }

    deserializer.deserialize_any(V::<T>(PhantomData))
}
