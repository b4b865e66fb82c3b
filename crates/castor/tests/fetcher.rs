mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use castor::{
    SourcetableFetcher, Task, TaskParams, TaskRunner,
    client::{self, ClientSpec},
    livesource::LivesourceState,
    sourcetable::Sourcetable,
};
use common::{TestLoop, caster_with, serve_once, wait_until};

const TABLE_BODY: &str = "STR;MP1;;RTCM 3.2;;;;;;0.00;0.00;0;0;;;;;;\r\nENDSOURCETABLE\r\n";

#[test]
fn sourcetable_happy_path() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);
    let response =
        format!("HTTP/1.1 200 OK\r\nContent-Type: gnss/sourcetable\r\n\r\n{TABLE_BODY}");
    let (port, server) = serve_once(response.into_bytes());

    let fetcher = SourcetableFetcher::new(&caster, "127.0.0.1", port, false, 0, 7);
    fetcher.start().unwrap();

    let table = wait_until(|| caster.sourcetables().table_for("127.0.0.1", port));
    assert_eq!(table.nentries(false), 1);
    assert_eq!(table.priority, 7);
    assert!(table.find_mountpoint("MP1").is_some());

    let head = server.join().unwrap();
    assert!(head.starts_with("GET / HTTP/1.1\r\n"));
    assert!(head.contains("Ntrip-Version: Ntrip/2.0\r\n"));
    assert!(head.contains("Connection: close\r\n"));
}

#[test]
fn sourcetable_chunked_transfer() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);
    let response = format!(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{TABLE_BODY}\r\n0\r\n\r\n",
        TABLE_BODY.len()
    );
    let (port, server) = serve_once(response.into_bytes());

    let fetcher = SourcetableFetcher::new(&caster, "127.0.0.1", port, false, 0, 1);
    fetcher.start().unwrap();

    let table = wait_until(|| caster.sourcetables().table_for("127.0.0.1", port));
    assert_eq!(table.nentries(false), 1);
    server.join().unwrap();
}

#[test]
fn non_200_clears_previous_table() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);
    let (port, server) = serve_once(b"HTTP/1.1 401 Unauthorized\r\n\r\n".to_vec());

    // stale entry from an earlier fetch
    let mut old = Sourcetable::new("127.0.0.1", port, false);
    old.parse_line("STR;MP1;;RTCM 3.2;;;;;;0.00;0.00;0;0;;;;;;");
    caster.sourcetables().replace_host("127.0.0.1", port, Some(old));

    let fetcher = SourcetableFetcher::new(&caster, "127.0.0.1", port, false, 0, 1);
    fetcher.start().unwrap();

    wait_until(|| caster.sourcetables().table_for("127.0.0.1", port).is_none().then_some(()));
    server.join().unwrap();
}

#[test]
fn ntrip1_icy_stream_feeds_livesource() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);

    let payload = b"rtcm-correction-bytes";
    let mut response = b"ICY 200 OK\r\n".to_vec();
    response.extend_from_slice(payload);
    let (port, server) = serve_once(response);

    let livesource = caster.livesources().register("MP1");
    let spec =
        ClientSpec::for_mountpoint("127.0.0.1", port, false, "MP1", livesource.clone(), false, false);
    client::start(&caster, spec).unwrap();

    wait_until(|| (livesource.state() == LivesourceState::Running).then_some(()));
    wait_until(|| (livesource.received_bytes() == payload.len() as u64).then_some(()));
    server.join().unwrap();

    // EOF without redistribute unregisters the livesource
    wait_until(|| caster.livesources().get("MP1").is_none().then_some(()));
}

#[derive(Default)]
struct CountRunner {
    restarts: AtomicUsize,
}

impl TaskRunner for CountRunner {
    fn end(&self, _task: &Arc<Task>, _success: bool) {}

    fn restart(&self, _task: &Arc<Task>) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn refresh_timer_restarts_task() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);

    let mut params = TaskParams::new("127.0.0.1", 9, "/", false);
    params.refresh_delay = 1;
    let task = Task::new(caster, "test_task", params, 0, 1 << 20, None);
    let runner = Arc::new(CountRunner::default());
    task.set_runner(Arc::downgrade(&(runner.clone() as Arc<dyn TaskRunner>)));

    task.reschedule();
    wait_until(|| (runner.restarts.load(Ordering::SeqCst) >= 1).then_some(()));
}

#[test]
fn stop_cancels_refresh_timer() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);

    let mut params = TaskParams::new("127.0.0.1", 9, "/", false);
    params.refresh_delay = 1;
    let task = Task::new(caster, "test_task", params, 0, 1 << 20, None);
    let runner = Arc::new(CountRunner::default());
    task.set_runner(Arc::downgrade(&(runner.clone() as Arc<dyn TaskRunner>)));

    task.reschedule();
    task.stop();
    thread::sleep(Duration::from_millis(1400));
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 0);
}

#[test]
fn rescheduling_twice_arms_a_single_timer() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);

    let mut params = TaskParams::new("127.0.0.1", 9, "/", false);
    params.refresh_delay = 1;
    let task = Task::new(caster, "test_task", params, 0, 1 << 20, None);
    let runner = Arc::new(CountRunner::default());
    task.set_runner(Arc::downgrade(&(runner.clone() as Arc<dyn TaskRunner>)));

    task.reschedule();
    task.reschedule();
    thread::sleep(Duration::from_millis(2500));
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 1);
}

#[test]
fn reload_stops_and_swaps_parameters_without_restarting() {
    let tl = TestLoop::spawn();
    let caster = caster_with(&tl.handle);

    let mut params = TaskParams::new("old.example.com", 2101, "/old", false);
    params.refresh_delay = 1;
    let task = Task::new(caster, "test_task", params, 0, 1 << 20, None);
    let runner = Arc::new(CountRunner::default());
    task.set_runner(Arc::downgrade(&(runner.clone() as Arc<dyn TaskRunner>)));
    task.reschedule();

    let mut fresh = TaskParams::new("new.example.com", 2102, "/new", true);
    fresh.refresh_delay = 0;
    task.reload(fresh, 512, 1 << 16, None);

    let params = task.params();
    assert_eq!(params.host, "new.example.com");
    assert_eq!(params.port, 2102);
    assert_eq!(params.uri, "/new");
    assert!(params.tls);

    // the reschedule timer died with the reload and nothing restarts
    thread::sleep(Duration::from_millis(1400));
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 0);
}
