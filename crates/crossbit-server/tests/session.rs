//! End-to-end sessions against the real worker binary.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbit::bootstrap::LaunchArgs;
use crossbit::bridge::SessionFiles;
use crossbit::{
    BridgeError, ExecutableSpawner, Fault, FormatVersion, Kwargs, PlatformInfo, Session,
    SessionConfig, SpawnError, Value, WorkerSession, WorkerSpawner,
};
use tokio::process::Child;

const SERVER: &str = env!("CARGO_BIN_EXE_crossbit-server");
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

fn config(module: &str) -> SessionConfig {
    SessionConfig::new(module)
        .with_server_exe(SERVER)
        .with_connect_timeout(CONNECT_TIMEOUT)
}

fn args(items: impl IntoIterator<Item = Value>) -> Vec<Value> {
    items.into_iter().collect()
}

/// Remembers the pid and session files of the worker it starts.
struct RecordingSpawner {
    inner: ExecutableSpawner,
    launched: Mutex<Option<(u32, SessionFiles)>>,
}

impl RecordingSpawner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ExecutableSpawner::at(SERVER),
            launched: Mutex::new(None),
        })
    }

    fn launched(&self) -> (u32, SessionFiles) {
        self.launched.lock().unwrap().clone().expect("a worker was spawned")
    }
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(&self, launch: &LaunchArgs, platform: &PlatformInfo) -> Result<Child, SpawnError> {
        let child = self.inner.spawn(launch, platform)?;
        if let Some(pid) = child.id() {
            let files = SessionFiles::for_address(&launch.host, launch.port);
            *self.launched.lock().unwrap() = Some((pid, files));
        }
        Ok(child)
    }
}

#[cfg(unix)]
fn is_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn calculator_round_trip_leaves_no_files() {
    let mut session = WorkerSession::open(config("calculator")).await.unwrap();
    let files = session.files().clone();
    assert!(files.recovery.exists());
    assert!(files.resources.is_dir());
    assert_eq!(session.format(), Some(FormatVersion::Binary));
    assert_eq!(session.host(), Some("127.0.0.1"));
    assert!(session.port() > 0);
    assert_eq!(
        session.metadata().unwrap().resource_dir,
        files.resources
    );

    let sum = session
        .call("add", args([Value::from(2), Value::from(3)]), Kwargs::new())
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(5));

    let err = session
        .call("add", args([Value::from(2), Value::from("x")]), Kwargs::new())
        .await
        .unwrap_err();
    let fault = err.fault().expect("a fault");
    assert_eq!(fault.name, Fault::TYPE_ERROR);
    assert!(fault.message.contains("'int' and 'str'"), "{fault}");

    let calls = session.call("calls", vec![], Kwargs::new()).await.unwrap();
    assert_eq!(calls, Value::Int(2));

    session.close(KILL_TIMEOUT).await;
    assert!(!files.bulk.exists());
    assert!(!files.recovery.exists());
    assert!(!files.resources.exists());
}

#[tokio::test]
async fn worker_faults_are_recoverable() {
    let mut session = crossbit::open(config("calculator")).await.unwrap();

    let err = session.call("nope", vec![], Kwargs::new()).await.unwrap_err();
    assert_eq!(err.fault().unwrap().name, Fault::ATTRIBUTE_ERROR);

    let err = session
        .call("divide", args([Value::from(1), Value::from(0)]), Kwargs::new())
        .await
        .unwrap_err();
    assert_eq!(err.fault().unwrap().name, "ZeroDivisionError");

    let err = session
        .call("parse_int", args([Value::from("twelve")]), Kwargs::new())
        .await
        .unwrap_err();
    assert_eq!(err.fault().unwrap().name, "ParseIntError");

    let quotient = session
        .call("divide", args([Value::from(1), Value::from(4)]), Kwargs::new())
        .await
        .unwrap();
    assert_eq!(quotient, Value::Float(0.25));

    session.close(KILL_TIMEOUT).await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let mut session = crossbit::open(config("calculator")).await.unwrap();
    let first = session.close(KILL_TIMEOUT).await;
    assert!(session.is_closed());
    let second = session.close(KILL_TIMEOUT).await;
    assert_eq!(first, second);

    let err = session.call("add", vec![], Kwargs::new()).await.unwrap_err();
    assert!(matches!(err, BridgeError::Protocol(_)), "{err}");
}

#[tokio::test]
async fn hanging_construction_times_out() {
    let spawner = RecordingSpawner::new();
    let started = Instant::now();
    let err = crossbit::open(
        config("hang_on_construct")
            .with_connect_timeout(Duration::from_secs(1))
            .with_spawner(spawner.clone()),
    )
    .await
    .err()
    .expect("the worker never listens");
    assert!(matches!(err, BridgeError::ConnectionTimeout { .. }), "{err}");
    assert!(err.to_string().starts_with("Timeout after 1.0 second(s)"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));

    let (pid, files) = spawner.launched();
    assert!(!files.recovery.exists());
    assert!(!files.resources.exists());
    #[cfg(unix)]
    assert!(!is_running(pid), "worker {pid} survived");
    #[cfg(not(unix))]
    let _ = pid;
}

#[tokio::test]
async fn slow_member_times_out_and_close_kills() {
    let mut session =
        WorkerSession::open(config("sleeper").with_response_timeout(Duration::from_millis(500)))
            .await
            .unwrap();

    let err = session
        .call("sleep", args([Value::from(30.0)]), Kwargs::new())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, BridgeError::ResponseTimeout { name, .. } if name == "sleep"),
        "{err}"
    );
    assert!(session.try_wait().unwrap().is_none());

    let started = Instant::now();
    session.close(Duration::from_secs(1)).await;
    assert!(session.is_closed());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(session.try_wait().unwrap().is_some(), "the worker is still running");
}

#[tokio::test]
async fn call_after_response_timeout_is_refused() {
    let mut session =
        WorkerSession::open(config("sleeper").with_response_timeout(Duration::from_millis(500)))
            .await
            .unwrap();
    let files = session.files().clone();

    let err = session
        .call("sleep", args([Value::from(0.8)]), Kwargs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ResponseTimeout { .. }), "{err}");

    // Let the late result land in the bulk file.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let err = session
        .call("sleep", args([Value::from(0.05)]), Kwargs::new())
        .await
        .unwrap_err();
    let BridgeError::Protocol(message) = &err else {
        panic!("expected a protocol error, got {err}");
    };
    assert!(message.contains("'sleep'"), "{message}");

    session.close(KILL_TIMEOUT).await;
    assert!(session.is_closed());
    assert!(!files.bulk.exists());
    assert!(!files.recovery.exists());
}

#[tokio::test]
async fn mock_and_worker_agree() {
    let registry = Arc::new(crossbit_server::registry());
    let mut mocked = crossbit::open(SessionConfig::mocked("calculator", registry))
        .await
        .unwrap();
    let mut real = crossbit::open(config("calculator")).await.unwrap();
    assert_eq!(mocked.port(), -1);
    assert_eq!(mocked.host(), None);

    let requests: Vec<(&str, Vec<Value>)> = vec![
        ("add", args([Value::from(2), Value::from(3)])),
        ("add", args([Value::from(2.5), Value::from(1)])),
        ("add", args([Value::from(2), Value::from("x")])),
        ("subtract", args([Value::from(2)])),
        ("divide", args([Value::from(1), Value::from(0)])),
        ("pi", vec![]),
        ("missing", vec![]),
    ];
    for (name, call_args) in requests {
        let m = mocked.call(name, call_args.clone(), Kwargs::new()).await;
        let r = real.call(name, call_args, Kwargs::new()).await;
        match (m, r) {
            (Ok(m), Ok(r)) => assert_eq!(m, r, "{name}"),
            (Err(m), Err(r)) => {
                let (m, r) = (m.fault().unwrap(), r.fault().unwrap());
                assert_eq!((&m.name, &m.message), (&r.name, &r.message), "{name}");
            }
            (m, r) => panic!("{name}: mock {m:?} vs worker {r:?}"),
        }
    }

    mocked.close(KILL_TIMEOUT).await;
    real.close(KILL_TIMEOUT).await;
}

#[tokio::test]
async fn constructor_kwargs_arrive_as_strings() {
    let mut session = crossbit::open(
        config("echo")
            .with_kwarg("scale", 2.5)
            .with_kwarg("count", 3)
            .with_kwarg("name", "pump"),
    )
    .await
    .unwrap();

    let kwargs = session.call("kwargs", vec![], Kwargs::new()).await.unwrap();
    let map = kwargs.as_map().unwrap();
    assert_eq!(map["scale"], Value::from("2.5"));
    assert_eq!(map["count"], Value::from("3"));
    assert_eq!(map["name"], Value::from("pump"));

    session.close(KILL_TIMEOUT).await;
}

#[tokio::test]
async fn json_format_keeps_call_fidelity() {
    let mut session = WorkerSession::open(config("echo").with_format(FormatVersion::Json))
        .await
        .unwrap();
    assert_eq!(session.format(), Some(FormatVersion::Json));

    let mut kwargs = Kwargs::new();
    kwargs.insert("raw".into(), Value::bytes(vec![0u8, 255, 7]));
    kwargs.insert("z".into(), Value::complex(1.5, -2.0));
    let call_args = args([
        Value::from(1),
        Value::from(2.0),
        Value::None,
        Value::from(vec![Value::from(true), Value::from("nested")]),
    ]);

    let echoed = session
        .call("received_data", call_args.clone(), kwargs.clone())
        .await
        .unwrap();
    assert_eq!(
        echoed,
        Value::List(vec![Value::List(call_args), Value::Map(kwargs)])
    );

    session.close(KILL_TIMEOUT).await;
}

#[tokio::test]
async fn unknown_module_reports_search_path() {
    let err = crossbit::open(config("nowhere")).await.err().unwrap();
    let BridgeError::ConnectionTimeout { reason, .. } = &err else {
        panic!("expected a connection timeout, got {err}");
    };
    assert!(reason.contains("No module named 'nowhere'"), "{reason}");
    assert!(reason.contains("The search path is:"), "{reason}");
}

#[tokio::test]
async fn construction_faults_reach_the_controller() {
    let err = crossbit::open(config("fail_on_construct").with_kwarg("scale", "big"))
        .await
        .err()
        .unwrap();
    let reason = match &err {
        BridgeError::ConnectionTimeout { reason, .. } => reason,
        other => panic!("expected a connection timeout, got {other}"),
    };
    assert!(reason.contains("TypeError"), "{reason}");
    assert!(reason.contains("The handler is constructed with"), "{reason}");

    let err = crossbit::open(config("panic_on_construct")).await.err().unwrap();
    assert!(
        err.to_string().contains("the library could not be initialised"),
        "{err}"
    );
}
