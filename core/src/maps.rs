//! Helpers for `KEY=VALUE` string maps

use std::collections::BTreeMap;

/// Merge maps left to right; later maps win on key collision.
pub fn merge_maps<'a, I>(maps: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    let mut merged = BTreeMap::new();
    for map in maps {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Parse `KEY=VALUE` entries, splitting on the first `=`.
///
/// Empty entries and entries without `=` are dropped.
pub fn list_to_map<S: AsRef<str>>(entries: &[S]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(AsRef::as_ref)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Split `data` on `sep` and parse the pieces with [`list_to_map`].
pub fn string_to_map(data: &str, sep: &str) -> BTreeMap<String, String> {
    let entries: Vec<&str> = data.split(sep).collect();
    list_to_map(&entries)
}

/// Render a map as `k=v` pairs joined by `sep`, keys sorted.
pub fn map_to_string(data: &BTreeMap<String, String>, sep: &str) -> String {
    data.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn later_maps_win_on_collision() {
        let image = map(&[("VIP", "10.103.97.2"), ("MODE", "ipvs")]);
        let host = map(&[("VIP", "10.0.0.5")]);
        let merged = merge_maps([&image, &host]);
        assert_eq!(merged["VIP"], "10.0.0.5");
        assert_eq!(merged["MODE"], "ipvs");
    }

    #[test]
    fn list_to_map_splits_on_first_equals_only() {
        let parsed = list_to_map(&["A=1", "B=x=y", "", "broken", "C="]);
        assert_eq!(parsed, map(&[("A", "1"), ("B", "x=y"), ("C", "")]));
    }

    #[test]
    fn string_to_map_and_back_sorts_keys() {
        let parsed = string_to_map("b=2,a=1", ",");
        assert_eq!(map_to_string(&parsed, ","), "a=1,b=2");
    }
}
