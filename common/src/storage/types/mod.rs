use serde::{Deserialize, Serialize};

pub mod causal_link;
pub mod chunk;
pub mod source_record;

pub trait StoredObject: Serialize + for<'de> Deserialize<'de> {
    fn table_name() -> &'static str;
    fn get_id(&self) -> &str;
}

/// Serde helpers bridging our types and SurrealDB's value forms.
///
/// Record ids come back either as plain strings or as `Thing`s depending on
/// the query shape; datetimes must round-trip through `surrealdb::sql::Datetime`
/// so range filters stay typed on the database side.
pub mod surreal_serde {
    use chrono::{DateTime, Utc};
    use serde::de::{self, Visitor};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::fmt;
    use surrealdb::sql::Thing;

    struct FlexibleIdVisitor;

    impl<'de> Visitor<'de> for FlexibleIdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a Thing")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(map))?;
            Ok(thing.id.to_raw())
        }
    }

    pub fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(FlexibleIdVisitor)
    }

    /// A datetime is usually a typed `surrealdb::sql::Datetime`, but payload
    /// patches (`set_payload` MERGEs) may have written an RFC-3339 string.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlexibleDatetime {
        Typed(surrealdb::sql::Datetime),
        Text(String),
    }

    impl FlexibleDatetime {
        fn into_utc<E: de::Error>(self) -> Result<DateTime<Utc>, E> {
            match self {
                Self::Typed(dt) => Ok(DateTime::<Utc>::from(dt)),
                Self::Text(raw) => DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|err| E::custom(format!("invalid datetime {raw}: {err}"))),
            }
        }
    }

    pub mod datetime {
        use super::*;

        pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            Into::<surrealdb::sql::Datetime>::into(*date).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
        where
            D: Deserializer<'de>,
        {
            FlexibleDatetime::deserialize(deserializer)?.into_utc()
        }
    }

    pub mod option_datetime {
        use super::*;

        pub fn serialize<S>(
            date: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match date {
                Some(dt) => {
                    serializer.serialize_some(&Into::<surrealdb::sql::Datetime>::into(*dt))
                }
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let value = Option::<FlexibleDatetime>::deserialize(deserializer)?;
            value.map(FlexibleDatetime::into_utc).transpose()
        }
    }
}
