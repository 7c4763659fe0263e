use std::collections::BTreeSet;

use spill_map::SpillMap;
use tempfile::TempDir;

fn int_map(
    dir: &TempDir,
    spill_threshold: usize,
    spill_proportion: f64,
) -> SpillMap<i64, fn(i64, i64) -> i64> {
    SpillMap::open(
        dir.path().join("spill.sqlite"),
        spill_threshold,
        spill_proportion,
        (|a, b| a + b) as fn(i64, i64) -> i64,
    )
    .unwrap()
}

#[test]
fn test_cache_only_behavior() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 5, 0.5);
    map.put("a", 1)?;
    map.put("b", 2)?;

    // Still below threshold, all in cache.
    assert!(map.contains("a")?);
    assert!(map.contains("b")?);
    assert_eq!(map.len()?, 2);
    assert_eq!(map.cache_len(), 2);
    assert_eq!(map.spilled_len()?, 0);
    assert_eq!(map.get("a")?, Some(1));
    assert_eq!(map.get("b")?, Some(2));
    Ok(())
}

#[test]
fn test_spill_occurs_after_threshold() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 3, 0.5);
    for i in 0..6 {
        map.put(format!("k{i}"), i)?;
    }

    assert_eq!(map.len()?, 6);
    assert_eq!(map.spilled_len()?, 4);

    for i in 0..6 {
        let key = format!("k{i}");
        assert!(map.contains(&key)?);
        assert_eq!(map.get(&key)?, Some(i));
    }
    Ok(())
}

#[test]
fn test_conflict_merging_across_layers() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 3, 0.5);

    // Preload and force a spill.
    for i in 1..4 {
        map.put(format!("k{i}"), i)?;
    }
    map.put("extra1", 10)?;
    map.put("extra2", 20)?;

    // k1 was evicted oldest-first.
    assert!(map.spilled_len()? > 0);
    assert_eq!(map.get("k1")?, Some(1));

    // Re-adding the spilled key merges at read time...
    map.put("k1", 500)?;
    assert_eq!(map.get("k1")?, Some(501));

    // ...and later evictions merge it into the spilled row.
    map.put("another1", 30)?;
    map.put("another2", 40)?;
    assert_eq!(map.get("k1")?, Some(501));
    Ok(())
}

#[test]
fn test_spill_then_put_then_get_merges() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 1, 1.0);
    map.put("k", 1)?;
    map.put("k", 2)?;
    // Force the whole cache (k=3) onto disk.
    map.put("other", 0)?;
    assert!(map.spilled_len()? >= 1);
    map.put("k", 5)?;
    assert_eq!(map.get("k")?, Some(8));
    Ok(())
}

#[test]
fn test_pop_removes_from_both_layers() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 2, 0.5);
    map.put("x", 1)?;
    map.put("y", 2)?;
    map.put("z", 3)?;
    assert_eq!(map.len()?, 3);

    assert_eq!(map.pop("x")?, Some(1));
    assert!(!map.contains("x")?);
    assert_eq!(map.pop("y")?, Some(2));
    assert!(!map.contains("y")?);
    assert_eq!(map.pop("z")?, Some(3));
    assert!(!map.contains("z")?);
    assert_eq!(map.pop("z")?, None);
    assert_eq!(map.len()?, 0);
    Ok(())
}

#[test]
fn test_iter_yields_each_key_once_with_merged_value() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 3, 1.0);
    map.put("x", 1)?;
    map.put("y", 2)?;
    map.put("z", 3)?;
    // Crossing the threshold evicts the whole cache (proportion 1.0).
    map.put("w", 4)?;
    assert_eq!(map.spilled_len()?, 4);
    assert_eq!(map.cache_len(), 0);
    // Overlap two spilled keys and add a cache-only key.
    map.put("y", 20)?;
    map.put("z", 30)?;
    map.put("a", 40)?;

    let mut items: Vec<(String, i64)> = map.iter().collect::<anyhow::Result<_>>()?;
    items.sort();
    assert_eq!(
        items,
        vec![
            ("a".to_string(), 40),
            ("w".to_string(), 4),
            ("x".to_string(), 1),
            ("y".to_string(), 22),
            ("z".to_string(), 33),
        ]
    );
    assert_eq!(map.len()?, 5);
    Ok(())
}

#[test]
fn test_put_many_get_many_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 10, 0.5);
    map.put_many((0..25).map(|i| (format!("k{i}"), i)))?;
    let keys: Vec<String> = (0..25).map(|i| format!("k{i}")).collect();
    let values = map.get_many(keys.iter().map(String::as_str))?;
    for (i, value) in values.into_iter().enumerate() {
        assert_eq!(value, Some(i as i64));
    }
    Ok(())
}

#[test]
fn test_merge_fold_equivalence() -> anyhow::Result<()> {
    // For any put sequence with an associative merge, reads yield the fold of
    // merge over the sequence, regardless of where spills landed.
    let dir = tempfile::tempdir()?;
    let mut map = int_map(&dir, 4, 0.5);
    let puts: Vec<(&str, i64)> = vec![
        ("a", 1),
        ("b", 2),
        ("a", 3),
        ("c", 4),
        ("d", 5),
        ("e", 6),
        ("a", 7),
        ("b", 8),
        ("f", 9),
        ("g", 10),
        ("a", 11),
    ];
    for (key, value) in &puts {
        map.put(*key, *value)?;
    }
    let mut expected: std::collections::BTreeMap<&str, i64> = Default::default();
    for (key, value) in &puts {
        *expected.entry(key).or_insert(0) += value;
    }
    for (key, total) in expected {
        assert_eq!(map.get(key)?, Some(total), "key {key:?}");
    }
    Ok(())
}

#[test]
fn test_set_union_merge() -> anyhow::Result<()> {
    // The ancestry sweeper's merge shape: sets of strings, unioned.
    let dir = tempfile::tempdir()?;
    let mut map: SpillMap<BTreeSet<String>, _> = SpillMap::open(
        dir.path().join("spill.sqlite"),
        2,
        0.5,
        |mut a: BTreeSet<String>, b: BTreeSet<String>| {
            a.extend(b);
            a
        },
    )?;
    map.put("p", BTreeSet::from(["col::1.0".to_string()]))?;
    map.put("q", BTreeSet::from(["col::1.0".to_string()]))?;
    map.put("r", BTreeSet::from(["col::2.0".to_string()]))?;
    map.put("p", BTreeSet::from(["col::2.0".to_string()]))?;
    assert_eq!(
        map.get("p")?,
        Some(BTreeSet::from([
            "col::1.0".to_string(),
            "col::2.0".to_string()
        ]))
    );
    Ok(())
}

#[test]
fn test_close_removes_spill_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("spill.sqlite");
    let mut map: SpillMap<i64, fn(i64, i64) -> i64> =
        SpillMap::open(&path, 1, 1.0, (|a, b| a + b) as fn(i64, i64) -> i64)?;
    map.put("a", 1)?;
    map.put("b", 2)?;
    assert!(path.exists());
    map.close()?;
    assert!(!path.exists());
    Ok(())
}
