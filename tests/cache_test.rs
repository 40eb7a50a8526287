use trackstore::cache::{Cache, Table};
use trackstore::db;
use trackstore::storage::StorageLayout;

fn open(dir: &tempfile::TempDir) -> Cache {
    Cache::open(StorageLayout::new(dir.path()).cache_db()).unwrap()
}

#[test]
fn put_get_delete_per_table() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = open(&dir);

    cache.put(Table::TopicToTid, "owntracks/jane/phone", "JP");
    cache.put(Table::Geocode, "owntracks/jane/phone", "{}");
    assert_eq!(cache.get(Table::TopicToTid, "owntracks/jane/phone").as_deref(), Some("JP"));

    cache.put(Table::TopicToTid, "owntracks/jane/phone", "J2");
    assert_eq!(cache.get(Table::TopicToTid, "owntracks/jane/phone").as_deref(), Some("J2"));

    cache.delete(Table::TopicToTid, "owntracks/jane/phone");
    assert!(cache.get(Table::TopicToTid, "owntracks/jane/phone").is_none());
    // tables are independent
    assert_eq!(cache.get(Table::Geocode, "owntracks/jane/phone").as_deref(), Some("{}"));
    assert!(!cache.try_delete(Table::TopicToTid, "owntracks/jane/phone").unwrap());
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let cache = open(&dir);
        cache.put(Table::Geocode, "u15xcf2", r#"{"cc":"NL","tst":1}"#);
    }
    let cache = open(&dir);
    assert_eq!(cache.get(Table::Geocode, "u15xcf2").as_deref(), Some(r#"{"cc":"NL","tst":1}"#));
}

#[test]
fn cache_file_uses_wal() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = StorageLayout::new(dir.path()).cache_db();
    let _cache = Cache::open(&path).unwrap();

    let conn = rusqlite::Connection::open(&path).unwrap();
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[test]
fn dump_and_load_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = open(&dir);
    cache.put(Table::Geocode, "u15xcf2", r#"{"cc":"NL","addr":"Dam 1, Amsterdam","tst":1}"#);
    cache.put(Table::Geocode, "u09tvw0", r#"{"cc":"FR","tst":2}"#);

    let mut dumped = Vec::new();
    assert_eq!(cache.dump(Table::Geocode, &mut dumped).unwrap(), 2);
    let text = String::from_utf8(dumped.clone()).unwrap();
    assert!(text.starts_with("u09tvw0 "), "{text}");

    let other = Cache::in_memory().unwrap();
    assert_eq!(other.load(Table::Geocode, dumped.as_slice()).unwrap(), 2);
    assert_eq!(
        other.get(Table::Geocode, "u15xcf2").as_deref(),
        Some(r#"{"cc":"NL","addr":"Dam 1, Amsterdam","tst":1}"#)
    );
}

#[test]
fn prefix_scan_rewrites_only_returned_values() {
    let cache = Cache::in_memory().unwrap();
    cache.put(Table::Waypoints, "jane/phone/a", "1");
    cache.put(Table::Waypoints, "jane/phone/b", "2");
    cache.put(Table::Waypoints, "jane/tablet/a", "3");

    let mut visited = Vec::new();
    let rewritten = cache.scan_prefix(Table::Waypoints, "jane/phone/", |key, value| {
        visited.push(key.to_string());
        key.ends_with('b').then(|| format!("{value}0"))
    });
    assert_eq!(visited, vec!["jane/phone/a", "jane/phone/b"]);
    assert_eq!(rewritten, 1);
    assert_eq!(cache.get(Table::Waypoints, "jane/phone/a").as_deref(), Some("1"));
    assert_eq!(cache.get(Table::Waypoints, "jane/phone/b").as_deref(), Some("20"));
    assert_eq!(cache.get(Table::Waypoints, "jane/tablet/a").as_deref(), Some("3"));
}

#[test]
fn health_report_counts_tables() {
    let cache = Cache::in_memory().unwrap();
    cache.put(Table::Geocode, "u15xcf2", "{}");
    cache.put(Table::TopicToTid, "owntracks/jane/phone", "JP");

    let report = cache.with_connection(db::check_database_health).unwrap().unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.table_counts.get("geocode"), Some(&1));
    assert_eq!(report.table_counts.get("topic2tid"), Some(&1));
}
