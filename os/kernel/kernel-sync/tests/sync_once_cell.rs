use kernel_sync::SyncOnceCell;

#[test]
fn set_publishes_once() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(7u32), Ok(()));
    assert_eq!(cell.set(8u32), Err(8));
    assert_eq!(cell.get(), Some(&7));
}

#[test]
fn get_or_init_runs_initializer_once() {
    let cell = SyncOnceCell::new();
    let mut calls = 0;
    assert_eq!(*cell.get_or_init(|| {
        calls += 1;
        "first"
    }), "first");
    assert_eq!(*cell.get_or_init(|| "second"), "first");
    assert_eq!(calls, 1);
    assert_eq!(cell.set("third"), Err("third"));
}
