use std::sync::{Arc, Mutex};
use toodle_core::{ChangeListener, CoreError, ItemSet, LifecyclePhase, Session};

#[derive(Default)]
struct Recorder {
    counts: Mutex<Vec<Option<usize>>>,
}

impl ChangeListener for Recorder {
    fn on_items_changed(&self, items: Option<ItemSet>) {
        self.counts
            .lock()
            .unwrap()
            .push(items.map(ItemSet::release));
    }
}

#[test]
fn repeated_foreground_background_cycles_keep_ledger_balanced() {
    let dir = tempfile::tempdir().unwrap();
    let lists = [
        dir.path().join("home.sqlite3"),
        dir.path().join("work.sqlite3"),
    ];
    let mut session = Session::new();
    for path in &lists {
        session.open_store(path).unwrap();
        session
            .list_manager(path)
            .unwrap()
            .create_item("seed", None)
            .unwrap();
    }

    for cycle in 0..3 {
        assert_eq!(session.enter_background().unwrap(), lists.len());
        let stats = session.stats();
        assert!(stats.is_balanced(), "cycle {cycle}: {stats:?}");
        assert_eq!(stats.cascaded_managers, 0, "cycle {cycle}");

        assert_eq!(session.enter_foreground().unwrap(), lists.len());
        assert_eq!(session.phase(), LifecyclePhase::Foreground);
        for path in &lists {
            let items = session.list_manager(path).unwrap().all_items().unwrap();
            assert_eq!(items.release(), 1);
        }
    }

    session.shutdown().unwrap();
    assert!(session.stats().is_balanced());
    assert_eq!(session.stats().cascaded_managers, 0);
}

#[test]
fn listener_must_register_again_after_background() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("list.sqlite3");
    let listener = Arc::new(Recorder::default());
    let mut session = Session::new();

    session.open_store(&path).unwrap();
    session
        .list_manager(&path)
        .unwrap()
        .register_change_listener(&listener);
    session.enter_background().unwrap();
    session.enter_foreground().unwrap();

    let manager = session.list_manager(&path).unwrap();
    assert_eq!(manager.subscription(), None);
    manager.create_item("unheard", None).unwrap();
    manager.register_change_listener(&listener);
    manager.create_item("heard", None).unwrap();

    assert_eq!(*listener.counts.lock().unwrap(), vec![Some(2)]);
}

#[test]
fn close_store_forgets_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("list.sqlite3");
    let mut session = Session::new();

    session.open_store(&path).unwrap();
    session.list_manager(&path).unwrap();
    session.close_store(&path).unwrap();

    assert!(session.stats().is_balanced());
    assert_eq!(session.stats().cascaded_managers, 0);
    assert!(matches!(
        session.close_store(&path),
        Err(CoreError::NotOpen(_))
    ));
    session.enter_background().unwrap();
    assert_eq!(session.enter_foreground().unwrap(), 0);
}

#[test]
fn unopenable_path_is_not_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("list.sqlite3");
    let mut session = Session::new();

    assert!(matches!(
        session.open_store(&path),
        Err(CoreError::NativeConstruction { .. })
    ));
    assert!(!session.is_open(&path));
    assert_eq!(session.enter_foreground().unwrap(), 0);
}
