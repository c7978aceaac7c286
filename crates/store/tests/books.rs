#![forbid(unsafe_code)]

use std::sync::Arc;

use shoal_core::{key_fn, KeyFn, StoreError};
use shoal_store::{Lister, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Book { author: String, title: String, copies: u32 },
    Magazine { issue: u32 },
}

fn book(author: &str, title: &str, copies: u32) -> Item {
    Item::Book { author: author.into(), title: title.into(), copies }
}

fn book_key() -> KeyFn<Item> {
    key_fn(|it: &Item| match it {
        Item::Book { author, title, .. } => Ok(format!("{}/{}", author, title)),
        Item::Magazine { .. } => Err(StoreError::InvalidObject("not a book".into())),
    })
}

#[test]
fn add_then_lookup_by_object_and_key() {
    let store = ObjectStore::new(book_key());
    let moby = book("Melville", "Moby Dick", 1);
    store.add(moby.clone()).unwrap();
    store.add(book("Dickens", "David Copperfield", 2)).unwrap();

    let got = store.get(&moby).unwrap().expect("moby dick cached");
    assert_eq!(*got, moby);
    let key = store.key_of(&moby).unwrap();
    assert_eq!(key, "Melville/Moby Dick");
    assert_eq!(store.get_by_key(&key).as_deref(), Some(&moby));
    assert!(store.get_by_key("Nobody/Nothing").is_none());
}

#[test]
fn update_replaces_wholesale_under_same_key() {
    let store = ObjectStore::new(book_key());
    store.add(book("Melville", "Moby Dick", 1)).unwrap();
    store.update(book("Melville", "Moby Dick", 7)).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.get_by_key("Melville/Moby Dick").as_deref(), Some(&book("Melville", "Moby Dick", 7)));
}

#[test]
fn delete_then_get_reports_absent() {
    let store = ObjectStore::new(book_key());
    let b = book("Austen", "Emma", 1);
    store.add(b.clone()).unwrap();
    let removed = store.delete(&b).unwrap();
    assert!(removed.is_some());
    assert_eq!(store.get(&b).unwrap(), None);
    // deleting again is a no-op
    assert_eq!(store.delete(&b).unwrap(), None);
}

#[test]
fn key_function_failure_is_invalid_object() {
    let store = ObjectStore::new(book_key());
    let err = store.add(Item::Magazine { issue: 3 }).unwrap_err();
    assert!(matches!(err, StoreError::InvalidObject(_)));
    assert!(store.is_empty());
    assert!(store.get(&Item::Magazine { issue: 3 }).is_err());
}

#[test]
fn list_after_distinct_upserts_has_one_entry_per_key() {
    let store = ObjectStore::new(book_key());
    for i in 0..25u32 {
        store.add(book("Author", &format!("Vol {}", i), i)).unwrap();
    }
    // upserting an existing key does not grow the store
    store.add(book("Author", "Vol 3", 99)).unwrap();
    let listed = store.list();
    assert_eq!(listed.len(), 25);
    let mut keys = store.list_keys();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 25);
}

#[test]
fn replace_is_all_or_nothing() {
    let store = ObjectStore::new(book_key());
    store.add(book("A", "1", 1)).unwrap();
    let bad = vec![book("B", "2", 1), Item::Magazine { issue: 1 }];
    assert!(store.replace(bad).is_err());
    assert_eq!(store.list_keys(), vec!["A/1".to_string()]);

    store.replace(vec![book("B", "2", 1), book("C", "3", 1)]).unwrap();
    let mut keys = store.list_keys();
    keys.sort();
    assert_eq!(keys, vec!["B/2".to_string(), "C/3".to_string()]);
}

#[test]
fn lister_is_a_live_read_only_view() {
    let store = Arc::new(ObjectStore::new(book_key()));
    let lister = Lister::new(Arc::clone(&store));
    assert!(lister.is_empty());
    store.add(book("Tolstoy", "War and Peace", 1)).unwrap();
    assert_eq!(lister.len(), 1);
    assert!(lister.get_by_key("Tolstoy/War and Peace").is_some());
    store.clear();
    assert!(lister.list().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_and_readers() {
    let store = Arc::new(ObjectStore::new(book_key()));
    let mut tasks = Vec::new();
    for w in 0..4u32 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            for i in 0..100u32 {
                store.add(book(&format!("w{}", w), &format!("{}", i), i)).unwrap();
                let _ = store.list();
                tokio::task::yield_now().await;
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(store.len(), 400);
    assert_eq!(store.epoch(), 400);
}
