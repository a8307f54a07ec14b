// src/bridge/tests.rs
use super::*;
use crate::attachments::DirAttachmentStore;
use crate::classifier::InteractionState;
use crate::protocol::{InputParams, PhotoParams, SessionRef};
use crate::pty::CliCommand;
use crate::sanitize::StandardSanitizer;
use crate::store::{MemoryStore, SessionRecord, SessionStatus};
use base64::Engine;

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01";

struct Harness {
    bridge: Bridge,
    store: Arc<MemoryStore>,
    workdir: tempfile::TempDir,
    uploads: tempfile::TempDir,
}

async fn harness_with(options: BridgeOptions, store: Arc<MemoryStore>) -> Harness {
    harness_running("sh", options, store).await
}

/// Sessions run `/bin/sh -c <program>`.
async fn harness_running(program: &str, options: BridgeOptions, store: Arc<MemoryStore>) -> Harness {
    let workdir = tempfile::tempdir().unwrap();
    let uploads = tempfile::tempdir().unwrap();
    let options = BridgeOptions {
        spawn: SpawnOptions {
            command: CliCommand {
                shell: "/bin/sh".to_string(),
                program: program.to_string(),
            },
            ..SpawnOptions::default()
        },
        ..options
    };
    let deps = BridgeDeps {
        store: store.clone(),
        sanitizer: Arc::new(StandardSanitizer),
        attachments: Arc::new(DirAttachmentStore::new(uploads.path())),
    };
    let bridge = Bridge::spawn(options, deps).await.unwrap();
    Harness {
        bridge,
        store,
        workdir,
        uploads,
    }
}

async fn harness() -> Harness {
    harness_with(BridgeOptions::default(), Arc::new(MemoryStore::new())).await
}

fn principal() -> Principal {
    Principal {
        user_id: "tester".into(),
        device: "unit".into(),
    }
}

/// Receive broadcast events until `pred` matches or five seconds pass.
async fn recv_until(
    rx: &mut broadcast::Receiver<Arc<ServerEvent>>,
    mut pred: impl FnMut(&ServerEvent) -> bool,
) -> Arc<ServerEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("broker closed"),
            }
        }
    })
    .await
    .expect("expected event within deadline")
}

async fn create(h: &Harness, conn: ConnId, rx: &mut broadcast::Receiver<Arc<ServerEvent>>) -> SessionRecord {
    let replies = h
        .bridge
        .dispatch(
            conn,
            ClientMessage::CreateSession(crate::protocol::CreateSessionParams {
                name: "proj".into(),
                cwd: h.workdir.path().display().to_string(),
            }),
        )
        .await
        .unwrap();
    assert!(replies.is_empty(), "unexpected replies: {replies:?}");
    match recv_until(rx, |e| matches!(e, ServerEvent::SessionCreated(_))).await.as_ref() {
        ServerEvent::SessionCreated(record) => record.clone(),
        _ => unreachable!(),
    }
}

fn output_for<'a>(event: &'a ServerEvent, id: &str) -> Option<&'a str> {
    match event {
        ServerEvent::Output(p) if p.session_id == id => Some(p.content.as_str()),
        _ => None,
    }
}

fn input(id: &str, text: &str) -> ClientMessage {
    ClientMessage::Input(InputParams {
        session_id: id.into(),
        text: text.into(),
    })
}

#[tokio::test]
async fn connect_sends_empty_session_list() {
    let h = harness().await;
    let connected = h.bridge.connect(principal()).await.unwrap();
    assert_eq!(connected.initial, vec![ServerEvent::SessionList(vec![])]);
    assert_eq!(h.bridge.stats().await.unwrap().connections, 1);

    h.bridge.disconnect(connected.conn).await;
    assert_eq!(h.bridge.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn create_broadcasts_created_and_list() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;
    assert_eq!(record.name, "proj");
    assert_eq!(record.status, SessionStatus::Active);

    let listed = recv_until(&mut c.events, |e| matches!(e, ServerEvent::SessionList(_))).await;
    match listed.as_ref() {
        ServerEvent::SessionList(list) => assert!(list.iter().any(|r| r.id == record.id)),
        _ => unreachable!(),
    }
    assert_eq!(h.bridge.stats().await.unwrap().sessions, 1);
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn input_is_echoed_as_output() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    h.bridge.dispatch(c.conn, input(&record.id, "echo bridge-$((40+2))")).await.unwrap();
    recv_until(&mut c.events, |e| {
        output_for(e, &record.id).is_some_and(|s| s.contains("bridge-42"))
    })
    .await;
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn output_is_classified_and_costed() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    h.bridge
        .dispatch(c.conn, input(&record.id, "echo 'Do you want to proceed? (y/n)'"))
        .await
        .unwrap();
    let status = recv_until(&mut c.events, |e| {
        matches!(e, ServerEvent::Status(p) if p.status == InteractionState::ApprovalNeeded)
    })
    .await;
    assert!(matches!(status.as_ref(), ServerEvent::Status(p) if p.session_id == record.id));

    h.bridge
        .dispatch(c.conn, input(&record.id, "echo 'Total cost: $1.42'"))
        .await
        .unwrap();
    recv_until(&mut c.events, |e| matches!(e, ServerEvent::Cost(p) if p.cost == 1.42)).await;

    // Cost reaches the store before the next command is handled.
    h.bridge.dispatch(c.conn, ClientMessage::ListSessions).await.unwrap();
    assert_eq!(h.store.get(&record.id).await.unwrap().unwrap().total_cost, 1.42);
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_session_yields_error_to_sender() {
    let h = harness().await;
    let c = h.bridge.connect(principal()).await.unwrap();

    for message in [
        input("missing", "hello"),
        ClientMessage::Approve(SessionRef { session_id: "missing".into() }),
        ClientMessage::Reject(SessionRef { session_id: "missing".into() }),
        ClientMessage::Interrupt(SessionRef { session_id: "missing".into() }),
        ClientMessage::ResumeSession(SessionRef { session_id: "missing".into() }),
    ] {
        let replies = h.bridge.dispatch(c.conn, message).await.unwrap();
        assert!(
            matches!(replies.as_slice(), [ServerEvent::Error(p)] if p.message.contains("missing")),
            "{replies:?}"
        );
    }

    // Kill and resize of unknown ids are silent.
    let replies = h
        .bridge
        .dispatch(c.conn, ClientMessage::KillSession(SessionRef { session_id: "missing".into() }))
        .await
        .unwrap();
    assert!(replies.is_empty());
}

#[tokio::test]
async fn empty_input_is_ignored() {
    let h = harness().await;
    let c = h.bridge.connect(principal()).await.unwrap();
    // Sanitized to nothing, so not even the session lookup happens.
    let replies = h.bridge.dispatch(c.conn, input("missing", "\x00\x07")).await.unwrap();
    assert!(replies.is_empty());
}

#[tokio::test]
async fn create_rejects_bad_names_and_directories() {
    let h = harness().await;
    let c = h.bridge.connect(principal()).await.unwrap();

    let cases = [
        ("   ", h.workdir.path().display().to_string(), "Invalid session name or directory"),
        ("ok", "/definitely/missing/dir".to_string(), "Directory does not exist"),
    ];
    for (name, cwd, expected) in cases {
        let replies = h
            .bridge
            .dispatch(
                c.conn,
                ClientMessage::CreateSession(crate::protocol::CreateSessionParams {
                    name: name.into(),
                    cwd,
                }),
            )
            .await
            .unwrap();
        assert!(
            matches!(replies.as_slice(), [ServerEvent::Error(p)] if p.message.contains(expected)),
            "{replies:?}"
        );
    }
    assert_eq!(h.bridge.stats().await.unwrap().sessions, 0);
}

#[tokio::test]
async fn kill_broadcasts_terminated_record() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    h.bridge
        .dispatch(c.conn, ClientMessage::KillSession(SessionRef { session_id: record.id.clone() }))
        .await
        .unwrap();
    let updated = recv_until(&mut c.events, |e| matches!(e, ServerEvent::SessionUpdated(_))).await;
    match updated.as_ref() {
        ServerEvent::SessionUpdated(r) => {
            assert_eq!(r.id, record.id);
            assert_eq!(r.status, SessionStatus::Terminated);
        }
        _ => unreachable!(),
    }
    let listed = recv_until(&mut c.events, |e| matches!(e, ServerEvent::SessionList(_))).await;
    assert_eq!(*listed, ServerEvent::SessionList(vec![]));

    // The follow-up exit event of the killed process is not a second teardown.
    let replies = h.bridge.dispatch(c.conn, ClientMessage::ListSessions).await.unwrap();
    assert_eq!(replies, vec![ServerEvent::SessionList(vec![])]);
    assert_eq!(h.bridge.stats().await.unwrap().sessions, 0);
}

#[tokio::test]
async fn spontaneous_exit_is_torn_down() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    h.bridge.dispatch(c.conn, input(&record.id, "exit")).await.unwrap();
    let updated = recv_until(&mut c.events, |e| {
        matches!(e, ServerEvent::SessionUpdated(r) if r.id == record.id)
    })
    .await;
    assert!(matches!(updated.as_ref(), ServerEvent::SessionUpdated(r) if r.status == SessionStatus::Terminated));
    assert_eq!(
        h.store.get(&record.id).await.unwrap().unwrap().status,
        SessionStatus::Terminated
    );
}

#[tokio::test]
async fn new_connection_gets_replay_of_buffered_output() {
    let h = harness().await;
    let mut first = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, first.conn, &mut first.events).await;
    h.bridge.dispatch(first.conn, input(&record.id, "echo replay-me")).await.unwrap();
    recv_until(&mut first.events, |e| {
        output_for(e, &record.id).is_some_and(|s| s.contains("replay-me\r\n"))
    })
    .await;

    let second = h.bridge.connect(principal()).await.unwrap();
    assert!(matches!(&second.initial[0], ServerEvent::SessionList(list) if list.len() == 1));
    let replay = second.initial[1..]
        .iter()
        .find_map(|e| output_for(e, &record.id))
        .expect("replay for live session");
    assert!(replay.contains("replay-me"));

    let resumed = h
        .bridge
        .dispatch(second.conn, ClientMessage::ResumeSession(SessionRef { session_id: record.id.clone() }))
        .await
        .unwrap();
    assert!(matches!(resumed.as_slice(), [e] if output_for(e, &record.id).is_some_and(|s| s.contains("replay-me"))));
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn rate_limit_applies_per_connection() {
    let options = BridgeOptions {
        rate_limit_max: 2,
        ..BridgeOptions::default()
    };
    let h = harness_with(options, Arc::new(MemoryStore::new())).await;
    let a = h.bridge.connect(principal()).await.unwrap();
    let b = h.bridge.connect(principal()).await.unwrap();

    for _ in 0..2 {
        let replies = h.bridge.dispatch(a.conn, ClientMessage::ListSessions).await.unwrap();
        assert!(matches!(replies.as_slice(), [ServerEvent::SessionList(_)]));
    }
    let replies = h.bridge.dispatch(a.conn, ClientMessage::ListSessions).await.unwrap();
    assert_eq!(replies, vec![ServerEvent::error("Rate limit exceeded. Slow down.")]);

    let replies = h.bridge.dispatch(b.conn, ClientMessage::ListSessions).await.unwrap();
    assert!(matches!(replies.as_slice(), [ServerEvent::SessionList(_)]));
}

#[tokio::test]
async fn photo_is_stored_and_referenced() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    let replies = h
        .bridge
        .dispatch(
            c.conn,
            ClientMessage::Photo(PhotoParams {
                session_id: record.id.clone(),
                filename: "my shot.png".into(),
                base64: base64::engine::general_purpose::STANDARD.encode(PNG),
            }),
        )
        .await
        .unwrap();
    assert!(replies.is_empty(), "{replies:?}");

    let stored: Vec<_> = std::fs::read_dir(h.uploads.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].to_string_lossy().ends_with("-my_shot.png"));
    assert_eq!(std::fs::read(&stored[0]).unwrap(), PNG);

    recv_until(&mut c.events, |e| {
        output_for(e, &record.id).is_some_and(|s| s.contains("[Photo uploaded:"))
    })
    .await;
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_photo_is_rejected() {
    let options = BridgeOptions {
        max_upload_bytes: 16,
        ..BridgeOptions::default()
    };
    let h = harness_with(options, Arc::new(MemoryStore::new())).await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    let engine = base64::engine::general_purpose::STANDARD;
    for payload in [
        "!!not base64!!".to_string(),
        engine.encode(b"plain text, not an image"),
        engine.encode([PNG, &[0u8; 64][..]].concat()),
    ] {
        let replies = h
            .bridge
            .dispatch(
                c.conn,
                ClientMessage::Photo(PhotoParams {
                    session_id: record.id.clone(),
                    filename: "x.png".into(),
                    base64: payload,
                }),
            )
            .await
            .unwrap();
        assert_eq!(replies, vec![ServerEvent::error("Invalid or oversized photo")]);
    }
    assert_eq!(std::fs::read_dir(h.uploads.path()).unwrap().count(), 0);
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn spawn_reconciles_orphaned_records() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert(&SessionRecord::new_active("stale".into(), "old".into(), "/tmp".into(), 1))
        .await
        .unwrap();

    let h = harness_with(BridgeOptions::default(), store).await;
    assert_eq!(
        h.store.get("stale").await.unwrap().unwrap().status,
        SessionStatus::Terminated
    );
    let c = h.bridge.connect(principal()).await.unwrap();
    assert_eq!(c.initial, vec![ServerEvent::SessionList(vec![])]);
}

#[tokio::test]
async fn shutdown_drains_sessions_and_stops() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    assert_eq!(h.bridge.shutdown().await.unwrap(), 1);
    assert_eq!(
        h.store.get(&record.id).await.unwrap().unwrap().status,
        SessionStatus::Terminated
    );
    assert!(matches!(
        h.bridge.dispatch(c.conn, ClientMessage::ListSessions).await,
        Err(BridgeError::CoordinatorGone)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn final_output_is_broadcast_before_exit() {
    let h = harness_running(
        "printf 'last-words'",
        BridgeOptions::default(),
        Arc::new(MemoryStore::new()),
    )
    .await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    let mut output = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = c.events.recv().await.unwrap();
            match event.as_ref() {
                ServerEvent::SessionUpdated(r) if r.id == record.id => break,
                e => {
                    if let Some(s) = output_for(e, &record.id) {
                        output.push_str(s);
                    }
                }
            }
        }
    })
    .await
    .expect("session:updated within deadline");
    assert!(output.contains("last-words"), "output before exit: {output:?}");
}

#[tokio::test]
async fn interrupt_stops_foreground_command() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;

    h.bridge.dispatch(c.conn, input(&record.id, "sleep 30")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let replies = h
        .bridge
        .dispatch(c.conn, ClientMessage::Interrupt(SessionRef { session_id: record.id.clone() }))
        .await
        .unwrap();
    assert!(replies.is_empty(), "{replies:?}");

    // Only reachable once `sleep` is gone and the shell reads input again.
    h.bridge.dispatch(c.conn, input(&record.id, "echo after-$((1+1))")).await.unwrap();
    recv_until(&mut c.events, |e| {
        output_for(e, &record.id).is_some_and(|s| s.contains("after-2"))
    })
    .await;
    assert_eq!(h.bridge.stats().await.unwrap().sessions, 1);
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn approve_and_reject_answer_prompts() {
    let h = harness().await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;
    let target = || SessionRef { session_id: record.id.clone() };

    for (message, expected) in [
        (ClientMessage::Approve(target()), "got-y"),
        (ClientMessage::Reject(target()), "got-n"),
    ] {
        h.bridge.dispatch(c.conn, input(&record.id, "read x; echo got-$x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let replies = h.bridge.dispatch(c.conn, message).await.unwrap();
        assert!(replies.is_empty(), "{replies:?}");
        recv_until(&mut c.events, |e| {
            output_for(e, &record.id).is_some_and(|s| s.contains(expected))
        })
        .await;
    }
    h.bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn approve_and_reject_bump_activity_but_interrupt_does_not() {
    // No echo and SIGINT ignored, so none of the writes below produce output
    // that would bump activity on its own.
    let h = harness_running(
        "stty -echo; trap '' INT; sleep 30",
        BridgeOptions::default(),
        Arc::new(MemoryStore::new()),
    )
    .await;
    let mut c = h.bridge.connect(principal()).await.unwrap();
    let record = create(&h, c.conn, &mut c.events).await;
    let target = || SessionRef { session_id: record.id.clone() };
    let (store, id) = (&h.store, record.id.as_str());
    let last_activity = || async move { store.get(id).await.unwrap().unwrap().last_activity };

    tokio::time::sleep(Duration::from_millis(500)).await;
    let before = last_activity().await;

    h.bridge.dispatch(c.conn, ClientMessage::Interrupt(target())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(last_activity().await, before);
    assert_eq!(h.bridge.stats().await.unwrap().sessions, 1);

    h.bridge.dispatch(c.conn, ClientMessage::Approve(target())).await.unwrap();
    let approved = last_activity().await;
    assert!(approved > before);

    h.bridge.dispatch(c.conn, ClientMessage::Reject(target())).await.unwrap();
    assert!(last_activity().await > approved);
    h.bridge.shutdown().await.unwrap();
}
