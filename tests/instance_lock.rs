use oman_launcher::InstanceLock;

#[cfg(unix)]
#[test]
fn stale_lock_from_dead_launcher_is_taken_over() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("launcher.lock");
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    std::fs::write(&path, format!("{dead_pid}\n")).unwrap();

    let guard = InstanceLock::new(&path).acquire_guard().unwrap();

    assert_eq!(guard.lock().recorded_pid(), Some(std::process::id()));
    drop(guard);
    assert!(!path.exists());
}

#[test]
fn second_guard_in_same_process_reacquires() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("launcher.lock");

    let first = InstanceLock::new(&path).acquire_guard().unwrap();
    // Same pid: the lock is ours already.
    let second = InstanceLock::new(&path).acquire_guard().unwrap();

    drop(second);
    assert!(!path.exists());
    drop(first);
}

#[test]
fn corrupt_lock_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("launcher.lock");
    std::fs::write(&path, "\u{0}\u{0}garbage").unwrap();

    let lock = InstanceLock::new(&path);
    assert!(lock.acquire().unwrap());
    lock.release().unwrap();

    let err = std::fs::read_to_string(&path).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}
