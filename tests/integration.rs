//! End-to-end coverage against a real `Db` on a temp directory: ordering,
//! compaction equivalence, transactional rollback, auto-compact thresholds,
//! and reopen idempotence.

use std::collections::HashMap;
use std::ops::Bound;
use std::time::Duration;

use cubdb::config::AutoCompact;
use cubdb::coordinator::Event;
use cubdb::db::Db;
use rand::Rng;

fn open<K: cubdb::btree::Key>(order: usize, auto_compact: AutoCompact) -> (tempfile::TempDir, Db<K, i64>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open_with(dir.path(), order, auto_compact).unwrap();
    (dir, db)
}

#[test]
fn select_respects_inclusive_and_exclusive_bounds() {
    let (_dir, db) = open::<String>(32, AutoCompact::Off);
    db.put("a".into(), 1).unwrap();
    db.put("b".into(), 2).unwrap();
    db.put("c".into(), 3).unwrap();

    let inclusive = db
        .select(
            Bound::Included("a".to_string()),
            Bound::Included("c".to_string()),
            false,
            |s| s.collect_vec(),
        )
        .unwrap();
    assert_eq!(inclusive, vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)]);

    let exclusive_max = db
        .select(
            Bound::Included("a".to_string()),
            Bound::Excluded("c".to_string()),
            false,
            |s| s.collect_vec(),
        )
        .unwrap();
    assert_eq!(exclusive_max, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
}

#[test]
fn select_reverse_walks_descending() {
    let (_dir, db) = open::<String>(32, AutoCompact::Off);
    for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
        db.put(k.to_string(), v).unwrap();
    }
    let descending = db.select(Bound::Unbounded, Bound::Unbounded, true, |s| s.collect_vec()).unwrap();
    assert_eq!(descending, vec![("c".to_string(), 3), ("b".to_string(), 2), ("a".to_string(), 1)]);
}

#[test]
fn compaction_preserves_lookups_and_size_and_clears_dirt() {
    let (_dir, db) = open::<i64>(16, AutoCompact::Off);
    let mut rng = rand::thread_rng();
    let mut expected: HashMap<i64, i64> = HashMap::new();
    for i in 0..1000i64 {
        let key = rng.gen_range(0..500);
        db.put(key, i).unwrap();
        expected.insert(key, i);
    }
    let size_before = db.size().unwrap();
    assert!(db.dirt_factor().unwrap() > 0.0);

    db.compact().unwrap();
    wait_for(|| db.dirt_factor().unwrap() == 0.0);

    assert_eq!(db.size().unwrap(), size_before);
    for (key, value) in &expected {
        assert_eq!(db.get(*key).unwrap(), Some(*value));
    }
}

#[test]
fn data_survives_reopen_after_a_compaction() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db: Db<String, i64> = Db::open_with(dir.path(), 4, AutoCompact::Off).unwrap();
        for i in 0..50i64 {
            db.put(format!("k{}", i), i).unwrap();
        }
        for i in 0..25i64 {
            db.delete(format!("k{}", i)).unwrap();
        }
        db.compact().unwrap();
        wait_for(|| db.dirt_factor().unwrap() == 0.0);
    }

    let db: Db<String, i64> = Db::open(dir.path()).unwrap();
    assert_eq!(db.size().unwrap(), 25);
    for i in 0..25i64 {
        assert_eq!(db.get(format!("k{}", i)).unwrap(), None);
    }
    for i in 25..50i64 {
        assert_eq!(db.get(format!("k{}", i)).unwrap(), Some(i));
    }
}

#[test]
fn get_and_update_multi_rolls_back_on_user_error() {
    let (_dir, db) = open::<String>(32, AutoCompact::Off);
    db.put("a".into(), 0).unwrap();

    let outcome: cubdb::Result<()> =
        db.get_and_update_multi(vec!["a".into(), "b".into()], |_current| panic!("user fn exploded"));
    assert!(outcome.is_err());

    assert_eq!(db.get("a".into()).unwrap(), Some(0));
    assert!(!db.has_key("b".into()).unwrap());
}

#[test]
fn auto_compact_does_not_fire_below_threshold() {
    let (_dir, db) = open::<String>(32, AutoCompact::On { min_writes: 100, min_dirt_factor: 0.25 });
    let events = db.subscribe().unwrap();

    for i in 0..99i64 {
        db.put(format!("k{}", i), i).unwrap();
    }
    assert!(events.try_recv().is_err(), "no compaction should have started yet");
}

#[test]
fn auto_compact_fires_once_threshold_is_crossed() {
    let (_dir, db) = open::<String>(32, AutoCompact::On { min_writes: 100, min_dirt_factor: 0.25 });
    let events = db.subscribe().unwrap();

    for i in 0..100i64 {
        db.put(format!("k{}", i), i).unwrap();
    }

    let saw_start = (0..50).any(|_| {
        std::thread::sleep(Duration::from_millis(5));
        matches!(events.try_recv(), Ok(Event::CompactionStarted))
    });
    assert!(saw_start, "crossing the dirt_factor threshold should schedule a compaction");
}

#[test]
fn reopen_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db: Db<String, i64> = Db::open(dir.path()).unwrap();
        for i in 0..30i64 {
            db.put(format!("k{}", i), i).unwrap();
        }
        db.delete("k0".into()).unwrap();
    }
    let (size_a, dirt_a) = {
        let db: Db<String, i64> = Db::open(dir.path()).unwrap();
        (db.size().unwrap(), db.dirt_factor().unwrap())
    };
    let (size_b, dirt_b) = {
        let db: Db<String, i64> = Db::open(dir.path()).unwrap();
        (db.size().unwrap(), db.dirt_factor().unwrap())
    };
    assert_eq!(size_a, size_b);
    assert_eq!(dirt_a, dirt_b);
}

#[test]
fn concurrent_select_survives_a_compaction_started_underneath_it() {
    let (_dir, db) = open::<String>(8, AutoCompact::Off);
    for i in 0..200i64 {
        db.put(format!("k{}", i), i).unwrap();
        db.delete(format!("k{}", i)).unwrap();
    }
    for i in 200..220i64 {
        db.put(format!("k{}", i), i).unwrap();
    }

    let reader = db.clone();
    let handle = std::thread::spawn(move || {
        reader.select(Bound::Unbounded, Bound::Unbounded, false, |s| {
            s.map(|(k, v)| {
                std::thread::sleep(Duration::from_millis(2));
                (k, v)
            })
            .collect_vec()
        })
    });

    db.compact().unwrap();
    for i in 220..230i64 {
        db.put(format!("k{}", i), i).unwrap();
    }

    let results = handle.join().unwrap().unwrap();
    assert_eq!(results.len(), 20);
}

fn wait_for(mut pred: impl FnMut() -> bool) {
    for _ in 0..300 {
        if pred() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition never became true within the wait budget");
}
