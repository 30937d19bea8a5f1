//! End-to-end scenarios across the registry, reference graph, deriver
//! index, revision index, and ingestion pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::thread;

use strata_store::paths::make_state_path_for_owner;
use strata_store::recipe::recipe_to_string;
use strata_store::{
    LocalStore, Recipe, Revision, StateOutput, StoreConfig, ValidPathInfo,
};

fn open_store() -> (tempfile::TempDir, LocalStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(StoreConfig::under(dir.path()), false).unwrap();
    (dir, store)
}

#[test]
fn register_and_query_a_plain_file() {
    let (dir, store) = open_store();
    let src = dir.path().join("f");
    fs::write(&src, b"hello\n").unwrap();

    let p = store.add_to_store(&src, false, true).unwrap();

    // Shape: <store>/<32-char digest>-f
    let base = p.file_name().unwrap().to_str().unwrap();
    assert_eq!(base.len(), 32 + 2);
    assert!(base.ends_with("-f"));
    assert!(base[..32]
        .bytes()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

    assert!(store.is_valid_path(&p));
    assert_eq!(
        store.query_path_hash(&p).unwrap(),
        strata_store::archive::hash_path(&p).unwrap()
    );
    assert!(store
        .query_references(&p, Revision::LATEST)
        .unwrap()
        .is_empty());
}

#[test]
fn text_blobs_fold_references_into_their_name() {
    let (dir, store) = open_store();
    let src = dir.path().join("dep");
    fs::write(&src, b"dependency").unwrap();
    let a = store.add_to_store(&src, false, true).unwrap();

    let contents = format!("build script mentioning {}", a.display());
    let with_ref = store
        .add_text_to_store("x.recipe", &contents, &BTreeSet::from([a.clone()]))
        .unwrap();
    let without_ref = store
        .add_text_to_store("x.recipe", &contents, &BTreeSet::new())
        .unwrap();

    assert_ne!(with_ref, without_ref);
    assert_eq!(
        store.query_references(&with_ref, Revision::LATEST).unwrap(),
        BTreeSet::from([a])
    );
}

fn state_recipe(
    store: &LocalStore,
    name: &str,
    component: &PathBuf,
    identifier: &str,
    owner: &str,
    extra_output: Option<&str>,
) -> Recipe {
    let component_hash = store.query_path_hash(component).unwrap().to_hex();
    let state_path = make_state_path_for_owner(
        store.config(),
        &component_hash,
        name,
        identifier,
        owner,
    )
    .unwrap();
    let mut outputs = BTreeMap::from([("out".to_owned(), component.clone())]);
    if let Some(extra) = extra_output {
        outputs.insert(extra.to_owned(), component.clone());
    }
    Recipe {
        name: name.to_owned(),
        outputs,
        state_outputs: BTreeMap::from([(
            "state".to_owned(),
            StateOutput {
                state_identifier: identifier.to_owned(),
                owner: owner.to_owned(),
                component_hash,
                state_path,
            },
        )]),
    }
}

fn ingest_recipe(store: &LocalStore, recipe: &Recipe) -> PathBuf {
    store
        .add_text_to_store(
            &format!("{}.recipe", recipe.name),
            &recipe_to_string(recipe).unwrap(),
            &BTreeSet::new(),
        )
        .unwrap()
}

#[test]
fn state_derivers_merge_by_identifier_and_owner() {
    let (dir, store) = open_store();
    let src = dir.path().join("app");
    fs::write(&src, b"the application").unwrap();
    let c = store.add_to_store(&src, false, true).unwrap();

    let r1 = state_recipe(&store, "app", &c, "default", "alice", None);
    let d1 = ingest_recipe(&store, &r1);
    store.add_state_deriver(&c, &d1).unwrap();

    assert!(store.is_state_component(&c));
    assert_eq!(
        store.query_derivers(&c, "default", "alice").unwrap(),
        BTreeSet::from([d1.clone()])
    );

    // Re-registering the identical recipe changes nothing on disk.
    store.add_state_deriver(&c, &d1).unwrap();
    assert!(d1.exists());
    assert_eq!(
        store.query_derivers(&c, "default", "alice").unwrap(),
        BTreeSet::from([d1.clone()])
    );

    // A different recipe for the same (identifier, owner) pair supersedes
    // the old one and deletes its file.
    let r2 = state_recipe(&store, "app", &c, "default", "alice", Some("doc"));
    let d2 = ingest_recipe(&store, &r2);
    assert_ne!(d1, d2);
    store.add_state_deriver(&c, &d2).unwrap();
    assert_eq!(
        store.query_derivers(&c, "default", "alice").unwrap(),
        BTreeSet::from([d2.clone()])
    );
    assert!(!d1.exists());

    // A different identifier coexists; wildcards see everything.
    let r3 = state_recipe(&store, "app", &c, "testing", "alice", None);
    let d3 = ingest_recipe(&store, &r3);
    store.add_state_deriver(&c, &d3).unwrap();
    assert_eq!(
        store.query_derivers(&c, "*", "*").unwrap(),
        BTreeSet::from([d2, d3])
    );
}

#[test]
fn spoofed_state_paths_are_refused_at_registration() {
    let (dir, store) = open_store();
    let src = dir.path().join("app");
    fs::write(&src, b"the application").unwrap();
    let c = store.add_to_store(&src, false, true).unwrap();

    let mut recipe = state_recipe(&store, "app", &c, "default", "alice", None);
    recipe
        .state_outputs
        .get_mut("state")
        .unwrap()
        .state_path = store.config().state_root.join("zzzz-app-default");
    let d = ingest_recipe(&store, &recipe);

    assert!(matches!(
        store.add_state_deriver(&c, &d),
        Err(strata_store::StrataError::SpoofedStatePath { .. })
    ));
}

#[test]
fn state_revision_revert_rewinds_content_and_history() {
    let (_dir, store) = open_store();
    let st = store.config().state_root.join("aaaa-app-default");
    store
        .register_valid_path(&ValidPathInfo::state(st.clone(), PathBuf::new()))
        .unwrap();
    fs::create_dir_all(st.join("data")).unwrap();

    let commit = |comment: &str| {
        let mut commits = BTreeMap::new();
        commits.insert(st.clone(), store.commit_state_path(&st).unwrap());
        store.set_state_revisions(&commits, &st, comment).unwrap();
    };

    fs::write(st.join("data/value"), b"one").unwrap();
    commit("first");
    fs::write(st.join("data/value"), b"two").unwrap();
    commit("second");

    store.revert_to_revision(&st, Revision(1), true).unwrap();
    assert_eq!(fs::read(st.join("data/value")).unwrap(), b"one");

    // The latest cut is now revision 1.
    let latest = store
        .query_state_revisions(&st, Revision::LATEST)
        .unwrap()
        .unwrap();
    assert_eq!(latest.members.len(), 1);
    let infos = store.query_available_state_revisions(&st).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].comment, "first");
}

#[test]
fn alias_chains_are_transparent_for_references() {
    let (dir, store) = open_store();
    let src = dir.path().join("lib");
    fs::write(&src, b"library").unwrap();
    let component = store.add_to_store(&src, false, true).unwrap();

    let p3 = store.config().state_root.join("cccc-app-default");
    let p2 = store.config().state_root.join("bbbb-app-default");
    let p1 = store.config().state_root.join("aaaa-app-default");
    for p in [&p1, &p2, &p3] {
        store
            .register_valid_path(&ValidPathInfo::state(p.clone(), PathBuf::new()))
            .unwrap();
    }
    store.set_shared_state(&p3, &p2).unwrap(); // p2 → p3
    store.set_shared_state(&p2, &p1).unwrap(); // p1 → p2 → p3

    store
        .set_references(
            &p1,
            &BTreeSet::from([component.clone()]),
            &BTreeSet::new(),
            Revision::LATEST,
        )
        .unwrap();

    for p in [&p1, &p2, &p3] {
        assert_eq!(
            store.query_references(p, Revision::LATEST).unwrap(),
            BTreeSet::from([component.clone()]),
            "alias {} must observe the tip's edges",
            p.display()
        );
    }
}

#[test]
fn referrers_and_references_are_dual() {
    let (dir, store) = open_store();

    let mut components = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let src = dir.path().join(name);
        fs::write(&src, name.as_bytes()).unwrap();
        components.push(store.add_to_store(&src, false, true).unwrap());
    }
    let [a, b, c, d] = [
        components[0].clone(),
        components[1].clone(),
        components[2].clone(),
        components[3].clone(),
    ];

    store
        .set_references(&b, &BTreeSet::from([a.clone()]), &BTreeSet::new(), Revision::LATEST)
        .unwrap();
    store
        .set_references(
            &c,
            &BTreeSet::from([a.clone(), b.clone()]),
            &BTreeSet::new(),
            Revision::LATEST,
        )
        .unwrap();
    store
        .set_references(&d, &BTreeSet::from([c.clone()]), &BTreeSet::new(), Revision::LATEST)
        .unwrap();

    for p in &components {
        for q in &components {
            let p_refs_q = store
                .query_references(p, Revision::LATEST)
                .unwrap()
                .contains(q);
            let q_referred_by_p = store
                .query_referrers(q, Revision::LATEST)
                .unwrap()
                .contains(p);
            assert_eq!(
                p_refs_q,
                q_referred_by_p,
                "duality violated for {} -> {}",
                p.display(),
                q.display()
            );
        }
    }

    // Closure over the graph.
    let closure = store
        .compute_fs_closure(&d, true, false, Revision::LATEST)
        .unwrap();
    assert_eq!(closure, BTreeSet::from([a, b, c, d]));
}

#[test]
fn concurrent_adds_materialise_exactly_once() {
    let (dir, store) = open_store();
    let src = dir.path().join("shared-input");
    fs::write(&src, b"raced contents").unwrap();

    let results: Vec<PathBuf> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = &store;
                let src = src.clone();
                scope.spawn(move || store.add_to_store(&src, false, true).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let first = &results[0];
    assert!(results.iter().all(|p| p == first));
    assert!(store.is_valid_path(first));
    assert_eq!(
        store.query_path_hash(first).unwrap(),
        strata_store::archive::hash_path(first).unwrap()
    );

    // Exactly one store entry exists for it.
    let entries: Vec<_> = fs::read_dir(&store.config().store_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path() == *first)
        .collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn scanning_discovers_embedded_digests_and_solid_refs() {
    let (dir, store) = open_store();

    let src = dir.path().join("dep");
    fs::write(&src, b"dependency bytes").unwrap();
    let dep = store.add_to_store(&src, false, true).unwrap();

    let solid = store.config().state_root.join("ssss-app-default");
    store
        .register_valid_path(&ValidPathInfo::state(solid.clone(), PathBuf::new()))
        .unwrap();

    // A component whose bytes mention dep's digest, plus a solid state ref
    // that scanning cannot see.
    let consumer_src = dir.path().join("consumer");
    fs::write(
        &consumer_src,
        format!("exec {}", dep.display()).as_bytes(),
    )
    .unwrap();
    let consumer = store.add_to_store(&consumer_src, false, true).unwrap();
    store
        .set_solid_state_refs(&consumer, &BTreeSet::from([solid.clone()]))
        .unwrap();

    let (found_components, found_states) = store.scan_component_references(&consumer).unwrap();
    assert!(found_components.contains(&dep));
    assert!(found_states.contains(&solid));
}
