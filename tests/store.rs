use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use local_wikidata::domain::{Claims, Entity, EntityId, EntityKind, Source};
use local_wikidata::store::{EntityStore, SearchSettings};

fn open_store() -> (TempDir, EntityStore) {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = EntityStore::open(root.join("wikidata.db"), SearchSettings::default()).unwrap();
    (dir, store)
}

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, 8, 30, 0).unwrap()
}

fn entity(id: &str, label: &str, description: &str, fetched_at: DateTime<Utc>) -> Entity {
    let id = id.parse().unwrap();
    let mut claims = Claims::default();
    claims.statements.insert(
        "P31".to_string(),
        serde_json::json!([{"mainsnak": {"datavalue": {"value": {"id": "Q5"}}}}]),
    );
    Entity {
        kind: EntityKind::Item,
        id,
        labels: BTreeMap::from([("en".to_string(), label.to_string())]),
        descriptions: BTreeMap::from([("en".to_string(), description.to_string())]),
        aliases: BTreeMap::new(),
        claims,
        modified: Some("2024-11-02T10:00:00Z".to_string()),
        fetched_at,
        source: Source::Dump,
    }
}

#[test]
fn upsert_is_idempotent() {
    let (_dir, store) = open_store();
    let batch = vec![
        entity("Q90", "Paris", "capital of France", at(1)),
        entity("Q64", "Berlin", "capital of Germany", at(1)),
        entity("P31", "instance of", "type relation", at(1)),
    ];
    let mut property = batch[2].clone();
    property.kind = EntityKind::Property;
    let batch = vec![batch[0].clone(), batch[1].clone(), property];

    store.upsert_batch(&batch).unwrap();
    let first_stats = store.stats().unwrap();
    let first_rows = batch
        .iter()
        .map(|e| store.get(&e.id).unwrap())
        .collect::<Vec<_>>();

    store.upsert_batch(&batch).unwrap();
    assert_eq!(store.stats().unwrap(), first_stats);
    let second_rows = batch
        .iter()
        .map(|e| store.get(&e.id).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(first_rows, second_rows);

    assert_eq!(first_stats.total, 3);
    assert_eq!(first_stats.by_kind.get(&EntityKind::Item), Some(&2));
    assert_eq!(first_stats.by_kind.get(&EntityKind::Property), Some(&1));
    assert_eq!(second_rows[0].as_ref(), Some(&batch[0]));
    assert_eq!(store.search("Paris", 10).unwrap().len(), 1);
}

#[test]
fn older_write_does_not_replace_newer_row() {
    let (_dir, store) = open_store();
    let newer = entity("Q90", "Paris", "capital of France", at(5));
    let older = entity("Q90", "Lutetia", "Roman city", at(2));

    let token = store.upsert_batch(std::slice::from_ref(&newer)).unwrap();
    assert_eq!((token.written, token.stale), (1, 0));
    let token = store.upsert_batch(std::slice::from_ref(&older)).unwrap();
    assert_eq!((token.written, token.stale), (0, 1));

    assert_eq!(store.get(&newer.id).unwrap(), Some(newer));
    assert!(store.search("Lutetia", 10).unwrap().is_empty());
}

#[test]
fn replacement_updates_search_terms() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[entity("Q90", "Paris", "capital of France", at(1))])
        .unwrap();
    store
        .upsert_batch(&[entity("Q90", "Lutetia", "Roman city", at(2))])
        .unwrap();

    assert!(store.search("Paris", 10).unwrap().is_empty());
    let hits = store.search("lutetia", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity.label.as_deref(), Some("Lutetia"));
}

#[test]
fn search_orders_by_relevance_then_id() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[
            entity("Q2", "Paris Hilton", "American media personality", at(1)),
            entity("Q1", "Paris", "capital of France", at(1)),
            entity("Q3", "Berlin", "capital of Germany", at(1)),
        ])
        .unwrap();

    let first = store.search("Paris", 10).unwrap();
    let ids = first
        .iter()
        .map(|hit| hit.entity.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, ["Q1", "Q2"]);
    assert!(first[0].score >= first[1].score);

    for _ in 0..5 {
        assert_eq!(store.search("Paris", 10).unwrap(), first);
    }
    assert_eq!(store.search("Paris", 1).unwrap().len(), 1);
}

#[test]
fn equal_scores_fall_back_to_numeric_id() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[
            entity("Q10", "Eiffel Tower", "tower", at(1)),
            entity("Q2", "Eiffel Tower", "tower", at(1)),
            entity("Q100", "Eiffel Tower", "tower", at(1)),
        ])
        .unwrap();

    let ids = store
        .search("eiffel", 10)
        .unwrap()
        .into_iter()
        .map(|hit| hit.entity.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, ["Q2", "Q10", "Q100"]);
}

#[test]
fn search_matches_aliases_and_ignores_syntax() {
    let (_dir, store) = open_store();
    let mut adams = entity("Q42", "Douglas Adams", "English writer", at(1));
    adams
        .aliases
        .insert("en".to_string(), BTreeSet::from(["DNA".to_string()]));
    store.upsert_batch(&[adams]).unwrap();

    assert_eq!(store.search("dna", 5).unwrap().len(), 1);
    assert_eq!(store.search("adams)(", 5).unwrap().len(), 1);
    assert!(store.search("\"*()", 5).unwrap().is_empty());
    assert!(store.search("", 5).unwrap().is_empty());
}

#[test]
fn missing_entity_is_none() {
    let (_dir, store) = open_store();
    assert_eq!(store.get(&"Q404".parse().unwrap()).unwrap(), None);
    assert_eq!(store.stats().unwrap().total, 0);
}

#[test]
fn rebuild_restores_search_index() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[
            entity("Q1", "Paris", "capital of France", at(1)),
            entity("Q2", "Paris Hilton", "American media personality", at(1)),
        ])
        .unwrap();
    let before = store.search("Paris", 10).unwrap();

    assert_eq!(store.rebuild_search_index().unwrap(), 2);
    assert_eq!(store.search("Paris", 10).unwrap(), before);
}

#[test]
fn index_language_filter_limits_search() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let settings = SearchSettings {
        index_languages: Some(vec!["en".to_string()]),
        display_language: "en".to_string(),
    };
    let store = EntityStore::open(root.join("wikidata.db"), settings).unwrap();

    let mut paris = entity("Q90", "Paris", "capital of France", at(1));
    paris
        .labels
        .insert("de".to_string(), "Parisstadt".to_string());
    store.upsert_batch(&[paris]).unwrap();

    assert_eq!(store.search("paris", 5).unwrap().len(), 1);
    assert!(store.search("parisstadt", 5).unwrap().is_empty());
}

#[test]
fn long_description_does_not_bury_exact_label() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[
            entity("Q47899", "Paris Hilton", "", at(1)),
            entity(
                "Q90",
                "Paris",
                "capital and largest city of France, on the Seine, seat of the national government",
                at(1),
            ),
        ])
        .unwrap();

    let ids = store
        .search("paris", 10)
        .unwrap()
        .into_iter()
        .map(|hit| hit.entity.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, ["Q90", "Q47899"]);
}

#[test]
fn equal_scores_group_properties_before_items() {
    let (_dir, store) = open_store();
    let batch = ["Q2", "P10", "Q10", "P2"].map(|id| {
        let mut row = entity(id, "located in", "relation", at(1));
        if id.starts_with('P') {
            row.kind = EntityKind::Property;
        }
        row
    });
    store.upsert_batch(&batch).unwrap();

    let ids = store
        .search("located", 10)
        .unwrap()
        .into_iter()
        .map(|hit| hit.entity.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, ["P2", "P10", "Q2", "Q10"]);
}

#[test]
fn redirect_resolves_to_target_row() {
    let (_dir, store) = open_store();
    let target = entity("Q2", "Earth", "third planet from the Sun", at(1));
    let from: EntityId = "Q1".parse().unwrap();

    let token = store.upsert_redirected(&from, &target).unwrap();
    assert_eq!((token.written, token.stale), (1, 0));
    assert_eq!(store.get(&from).unwrap(), Some(target.clone()));
    assert_eq!(store.get(&target.id).unwrap(), Some(target));
    assert_eq!(store.stats().unwrap().total, 1);
    assert_eq!(store.search("earth", 5).unwrap().len(), 1);

    let own = entity("Q1", "Universe", "totality of space and time", at(2));
    store.upsert_batch(&[own.clone()]).unwrap();
    assert_eq!(store.get(&from).unwrap(), Some(own));
}
