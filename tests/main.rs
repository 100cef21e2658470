// This test suite covers the inotify side end to end. The fanotify side
// needs CAP_SYS_ADMIN to initialize and is covered by its decoder unit
// tests instead.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use notifyfd::errors::Error;
use notifyfd::inotify::{InitFlags, Inotify, WatchMask};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

#[test]
fn it_should_watch_a_file() {
    let mut testdir = TestDir::new();
    let (path, mut file) = testdir.new_file();

    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();
    let watch = inotify.add_watch(&path, WatchMask::MODIFY).unwrap();

    write_to(&mut file);

    let event = inotify.wait(TIMEOUT).unwrap();
    assert_eq!(watch, event.wd);
    assert!(event.is_modify());
}

#[test]
fn it_should_not_return_duplicate_events() {
    let mut testdir = TestDir::new();
    let (path, mut file) = testdir.new_file();

    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();
    inotify.add_watch(&path, WatchMask::MODIFY).unwrap();

    write_to(&mut file);

    inotify.wait(TIMEOUT).unwrap();
    inotify.read_events().unwrap();

    assert_eq!(0, inotify.read_events().unwrap().len());
}

#[test]
fn it_should_return_immediately_if_no_events_are_available() {
    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();

    assert_eq!(0, inotify.read_events().unwrap().len());
}

#[test]
fn it_should_handle_file_names_correctly() {
    let mut testdir = TestDir::new();
    let (path, mut file) = testdir.new_file();
    let file_name = path.file_name().unwrap().to_os_string();

    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();
    inotify.add_watch(testdir.path(), WatchMask::MODIFY).unwrap();

    write_to(&mut file);

    let event = inotify.wait(TIMEOUT).unwrap();
    assert_eq!(Some(file_name), event.name);
}

#[test]
fn it_should_pair_rename_events_with_a_cookie() {
    let mut testdir = TestDir::new();
    let (path, _file) = testdir.new_file();

    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();
    inotify.add_watch(testdir.path(), WatchMask::MOVE).unwrap();

    let target = testdir.path().join("renamed");
    fs::rename(&path, &target).unwrap();

    let from = inotify.wait(TIMEOUT).unwrap();
    let to = inotify.wait(TIMEOUT).unwrap();

    assert!(from.is_moved_from());
    assert!(from.is_move());
    assert!(to.is_moved_to());

    assert_eq!(path.file_name().unwrap(), from.name.as_deref().unwrap());
    assert_eq!(target.file_name().unwrap(), to.name.as_deref().unwrap());

    assert_ne!(0, from.cookie);
    assert_eq!(from.cookie, to.cookie);
}

#[test]
fn it_should_time_out_when_no_event_arrives() {
    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();

    let result = inotify.wait(Some(Duration::from_millis(0)));
    assert!(matches!(result, Err(Error::Timeout)));
}

#[test]
fn it_should_report_nothing_ready_on_a_non_blocking_instance() {
    let mut inotify = Inotify::init(InitFlags::NONBLOCK).unwrap();

    let result = inotify.read_event();
    assert!(matches!(result, Err(Error::WouldBlock)));
}

#[test]
fn it_should_discard_queued_events_on_truncate() {
    let mut testdir = TestDir::new();

    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();
    inotify.add_watch(testdir.path(), WatchMask::CREATE).unwrap();

    // Two distinct names, so the kernel queues two distinct events.
    testdir.new_file();
    testdir.new_file();

    let first = inotify.wait(TIMEOUT).unwrap();
    assert!(first.is_create());

    inotify.truncate();
    assert_eq!(0, inotify.read_events().unwrap().len());
}

#[test]
fn it_should_remove_a_watch() {
    let mut testdir = TestDir::new();
    let (path, mut file) = testdir.new_file();

    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();
    let watch = inotify.add_watch(&path, WatchMask::MODIFY).unwrap();
    inotify.rm_watch(watch).unwrap();

    write_to(&mut file);

    // Only the IGNORED event for the removed watch may show up.
    for event in inotify.read_events().unwrap() {
        assert!(event.is_ignored());
    }

    // The descriptor no longer names a live watch.
    let result = inotify.rm_watch(watch);
    assert!(matches!(result, Err(Error::StaleReference(_))));
}

#[test]
fn it_should_fail_after_close() {
    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();

    inotify.close().unwrap();

    assert!(matches!(inotify.fileno(), Err(Error::InvalidState(_))));
    assert!(matches!(
        inotify.wait(Some(Duration::from_millis(0))),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        inotify.add_watch("/tmp", WatchMask::MODIFY),
        Err(Error::InvalidState(_))
    ));

    // Closing twice is allowed.
    inotify.close().unwrap();
}

#[test]
fn it_should_reject_an_empty_watch_path() {
    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();

    let result = inotify.add_watch("", WatchMask::MODIFY);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn it_should_iterate_over_events() {
    let mut testdir = TestDir::new();
    let (path, mut file) = testdir.new_file();

    let mut inotify = Inotify::init(InitFlags::empty()).unwrap();
    let watch = inotify.add_watch(&path, WatchMask::MODIFY).unwrap();

    write_to(&mut file);

    let event = inotify.events().next().unwrap().unwrap();
    assert_eq!(watch, event.wd);
}

struct TestDir {
    dir: TempDir,
    counter: u32,
}

impl TestDir {
    fn new() -> TestDir {
        TestDir {
            dir: TempDir::new().unwrap(),
            counter: 0,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn new_file(&mut self) -> (PathBuf, File) {
        let id = self.counter;
        self.counter += 1;

        let path = self.dir.path().join(format!("file-{id}"));
        let file = File::create(&path)
            .unwrap_or_else(|error| panic!("Failed to create temporary file: {}", error));

        (path, file)
    }
}

fn write_to(file: &mut File) {
    file.write_all(b"This should trigger an inotify event.")
        .unwrap_or_else(|error| panic!("Failed to write to file: {}", error));
}
