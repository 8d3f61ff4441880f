use serde::{ser, Serializer};

pub(crate) fn serialize_i64_as_bson_int<S: Serializer>(
    val: &i64,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    if let Ok(i) = i32::try_from(*val) {
        serializer.serialize_i32(i)
    } else {
        serializer.serialize_i64(*val)
    }
}

pub(crate) mod duration_option_as_int_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        val: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match val {
            Some(duration) if duration.as_secs() <= i32::MAX as u64 => {
                serializer.serialize_i32(duration.as_secs() as i32)
            }
            Some(duration) => serializer.serialize_i64(
                i64::try_from(duration.as_secs()).map_err(ser::Error::custom)?,
            ),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds: Option<u64> = Deserialize::deserialize(deserializer)?;
        Ok(seconds.map(Duration::from_secs))
    }
}
