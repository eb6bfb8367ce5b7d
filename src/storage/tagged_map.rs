//! Serde adapter writing maps as `{"dataType":"Map","value":[[k, v], ...]}`
//!
//! Used with `#[serde(with = "tagged_map")]` on `IndexMap` fields. The
//! tagged shape keeps key order and non-string keys intact, and is what
//! older state files contain.

use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::hash::Hash;

const MAP_TAG: &str = "Map";

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TaggedRef<'a, K, V> {
    data_type: &'static str,
    value: Vec<(&'a K, &'a V)>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tagged<K, V> {
    data_type: String,
    value: Vec<(K, V)>,
}

pub fn serialize<S, K, V>(map: &IndexMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    K: Serialize,
    V: Serialize,
{
    TaggedRef {
        data_type: MAP_TAG,
        value: map.iter().collect(),
    }
    .serialize(serializer)
}

pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<IndexMap<K, V>, D::Error>
where
    D: Deserializer<'de>,
    K: Deserialize<'de> + Hash + Eq,
    V: Deserialize<'de>,
{
    let tagged = Tagged::<K, V>::deserialize(deserializer)?;
    if tagged.data_type != MAP_TAG {
        return Err(de::Error::custom(format!(
            "expected dataType \"{}\", found \"{}\"",
            MAP_TAG, tagged.data_type
        )));
    }
    Ok(tagged.value.into_iter().collect())
}
