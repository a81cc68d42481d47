//! End-to-end runs of the host service against a real guest agent.

use std::sync::Arc;
use std::time::Duration;

use guestctl::{GuestCommand, GuestControl, GuestControlService, ServiceOptions};
use guestctl_guest::{AgentOptions, GuestAgent};
use guestctl_shared::constants::error_code;
use guestctl_shared::protocol::{
    CallbackData, ExecCommand, ExecInput, HostFn, HostMessage, InputStatus, ProcessStatus,
    StreamHandle, codec, flags,
};
use guestctl_shared::{ClientId, GuestCtlError, GuestCtlResult, HgcmTransport};
use tokio::task::JoinHandle;

const LIMIT: Duration = Duration::from_secs(10);

struct Harness {
    control: GuestControl,
    agent: GuestAgent,
    task: JoinHandle<GuestCtlResult<()>>,
    client: ClientId,
}

impl Harness {
    async fn start() -> Self {
        let service = GuestControlService::new(ServiceOptions::default());
        let transport: Arc<dyn HgcmTransport> = Arc::new(service.clone());
        let agent = GuestAgent::new(AgentOptions::default(), transport);
        let task = agent.spawn();

        let client = tokio::time::timeout(LIMIT, async {
            loop {
                if let Some(info) = service.clients().first() {
                    return info.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("agent did not connect");

        Self {
            control: GuestControl::new(service),
            agent,
            task,
            client,
        }
    }

    fn service(&self) -> &GuestControlService {
        self.control.service()
    }

    /// Wait until the agent holds no process sessions.
    async fn guest_released(&self) {
        tokio::time::timeout(LIMIT, async {
            while !self.agent.processes().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("guest kept process sessions");
    }

    async fn stop(self) {
        self.agent.shutdown();
        tokio::time::timeout(LIMIT, self.task)
            .await
            .expect("agent did not stop")
            .expect("agent panicked")
            .expect("agent failed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_collects_output_and_exit() {
    let h = Harness::start().await;

    let process = h
        .control
        .execute(h.client, GuestCommand::new("echo hi"))
        .await
        .unwrap();
    assert!(process.pid() > 0);

    let out = process.collect_output(Some(LIMIT)).await.unwrap();
    assert_eq!(out.stdout, b"hi\n");
    assert!(out.stderr.is_empty());
    assert_eq!(out.exit.status, ProcessStatus::ExitedNormally);
    assert_eq!(out.exit.exit_code(), Some(0));
    assert!(out.exit.success());
    assert!(h.service().sessions().is_empty());
    h.guest_released().await;

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_input_after_eof_is_rejected() {
    let h = Harness::start().await;

    let process = h
        .control
        .execute(h.client, GuestCommand::new("cat"))
        .await
        .unwrap();

    assert_eq!(process.write_stdin(b"ping\n", false).await.unwrap(), 5);
    assert_eq!(process.write_stdin(&[], true).await.unwrap(), 0);
    assert!(matches!(
        process.write_stdin(b"late", false).await,
        Err(GuestCtlError::InputClosed(pid)) if pid == process.pid()
    ));

    // The guest rejects input after EOF on its own as well.
    let (_, completion) = h
        .service()
        .submit(
            h.client,
            HostMessage::Input(ExecInput {
                context: 0,
                pid: process.pid(),
                flags: flags::input::NONE,
                data: b"late".to_vec(),
            }),
        )
        .unwrap();
    let reply = completion.wait(Some(LIMIT)).await.unwrap();
    assert!(matches!(
        reply.data,
        CallbackData::ExecInputStatus {
            status: InputStatus::Terminated,
            ..
        }
    ));

    let out = process.collect_output(Some(LIMIT)).await.unwrap();
    assert_eq!(out.stdout, b"ping\n");
    assert_eq!(out.exit.exit_code(), Some(0));

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_kills_process() {
    let h = Harness::start().await;

    let process = h
        .control
        .execute(
            h.client,
            GuestCommand::new("sleep")
                .arg("10")
                .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let exit = process.wait(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(exit.status, ProcessStatus::TimedOutKilled);

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_executions_are_independent() {
    let h = Harness::start().await;

    let (a, b) = tokio::join!(
        h.control
            .execute(h.client, GuestCommand::new("sh").args(["-c", "exit 3"])),
        h.control
            .execute(h.client, GuestCommand::new("sh").args(["-c", "echo b >&2; exit 4"])),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.context(), b.context());
    assert_ne!(a.pid(), b.pid());

    let (out_a, out_b) = tokio::join!(a.collect_output(Some(LIMIT)), b.collect_output(Some(LIMIT)));
    let (out_a, out_b) = (out_a.unwrap(), out_b.unwrap());
    assert_eq!(out_a.exit.exit_code(), Some(3));
    assert_eq!(out_b.exit.exit_code(), Some(4));
    assert_eq!(out_b.stderr, b"b\n");
    assert!(out_a.stderr.is_empty());

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_env_count_mismatch_is_reported() {
    let h = Harness::start().await;

    let mut params = codec::encode_host(&HostMessage::Execute(ExecCommand {
        command: "/bin/true".into(),
        env: vec!["A=1".into(), "B=2".into()],
        ..Default::default()
    }));
    params[5] = guestctl_shared::protocol::HgcmParam::U32(3);

    let (context, completion) = h
        .service()
        .submit_raw(h.client, HostFn::ExecCmd, params)
        .unwrap();
    let reply = completion.wait(Some(LIMIT)).await.unwrap();
    assert_eq!(reply.context_id(), context);
    match reply.data {
        CallbackData::ExecStatus { status, flags, .. } => {
            assert_eq!(status, ProcessStatus::Error);
            assert_eq!(flags, error_code::INVALID_PARAMETER);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.service().sessions().is_empty());
    assert!(h.agent.processes().is_empty());

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawn_failure_carries_errno() {
    let h = Harness::start().await;

    let err = h
        .control
        .execute(h.client, GuestCommand::new("/nonexistent/guestctl-test-binary"))
        .await
        .unwrap_err();
    match err {
        GuestCtlError::Spawn { code, .. } => assert_eq!(code, 2),
        other => panic!("unexpected {other:?}"),
    }

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_output_stream_reads_in_order() {
    use futures::StreamExt;

    let h = Harness::start().await;
    let process = h
        .control
        .execute(
            h.client,
            GuestCommand::new("sh").args(["-c", "for i in 1 2 3 4 5; do echo line$i; done"]),
        )
        .await
        .unwrap();

    let chunks: Vec<Vec<u8>> = process
        .output_stream(StreamHandle::Stdout)
        .map(|c| c.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.concat(), b"line1\nline2\nline3\nline4\nline5\n");
    assert!(process.wait(Some(LIMIT)).await.unwrap().success());

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_cancel_stops_agent() {
    let mut h = Harness::start().await;

    let process = h
        .control
        .execute(h.client, GuestCommand::new("sleep").arg("10"))
        .await
        .unwrap();

    h.control.cancel_pending_waits(h.client).unwrap();
    tokio::time::timeout(LIMIT, &mut h.task)
        .await
        .expect("agent did not stop")
        .unwrap()
        .unwrap();

    assert!(h.agent.processes().is_empty());
    assert!(!h.service().is_connected(h.client));
    assert!(process.wait(Some(LIMIT)).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_releases_guest_sessions() {
    let h = Harness::start().await;

    for _ in 0..5 {
        let exit = h
            .control
            .execute(h.client, GuestCommand::new("echo unread output"))
            .await
            .unwrap()
            .wait(Some(LIMIT))
            .await
            .unwrap();
        assert!(exit.success());
    }
    assert!(h.service().sessions().is_empty());
    h.guest_released().await;

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_builtin_tools() {
    let h = Harness::start().await;
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a/b");
    let file = nested.join("note.txt");

    let mkdir = h
        .control
        .execute(
            h.client,
            GuestCommand::new("vbox_mkdir")
                .arg("-p")
                .arg(nested.to_str().unwrap()),
        )
        .await
        .unwrap();
    assert!(mkdir.wait(Some(LIMIT)).await.unwrap().success());
    assert!(nested.is_dir());

    let writer = h
        .control
        .execute(
            h.client,
            GuestCommand::new("vbox_cat")
                .arg("-o")
                .arg(file.to_str().unwrap()),
        )
        .await
        .unwrap();
    writer.write_stdin(b"written in the guest", true).await.unwrap();
    assert!(writer.wait(Some(LIMIT)).await.unwrap().success());

    let reader = h
        .control
        .execute(h.client, GuestCommand::new("vbox_cat").arg(file.to_str().unwrap()))
        .await
        .unwrap();
    let out = reader.collect_output(Some(LIMIT)).await.unwrap();
    assert_eq!(out.stdout, b"written in the guest");
    assert!(out.exit.success());

    let missing = h
        .control
        .execute(h.client, GuestCommand::new("vbox_cat /nonexistent/guestctl-file"))
        .await
        .unwrap();
    let out = missing.collect_output(Some(LIMIT)).await.unwrap();
    assert_eq!(out.exit.exit_code(), Some(1));
    assert!(!out.stderr.is_empty());

    h.guest_released().await;
    h.stop().await;
}
