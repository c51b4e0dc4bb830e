mod common;

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use switch_transport::loopback::loopback;
use switchyard::{
    Controller, ControllerError, ControllerSettings, EventKind, SessionConfig, SessionPhase,
    SwitchEvent, SwitchSession, FAIL_FAST_EXIT_CODE,
};
use tokio::sync::mpsc;

use common::{fast_settings, serve_auto_primary, wait_for_phase};

fn controller() -> Controller {
    Controller::new(ControllerSettings {
        session: fast_settings(),
        ..ControllerSettings::default()
    })
}

#[test_timeout::tokio_timeout_test]
async fn removal_completes_only_after_the_session_exits() {
    let controller = controller();
    let mut handles = Vec::new();
    for name in ["spine1", "spine2"] {
        let (connector, switch) = loopback();
        handles.push(serve_auto_primary(switch));
        let session = controller.new_session(
            name,
            format!("{name}:9559"),
            SessionConfig::builder().build(),
            Arc::new(connector),
        );
        controller.add(session).expect("unique name");
    }
    assert_eq!(controller.len(), 2);

    let running = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run().await }
    });
    for session in controller.sessions() {
        wait_for_phase(&session, SessionPhase::Dispatching).await;
    }
    assert!(controller.is_running());

    let removal = controller.remove("spine1").expect("registered");
    assert!(!removal.is_complete());
    assert_eq!(controller.len(), 2);
    assert_eq!(controller.names(), vec!["spine2".to_string()]);
    assert!(controller.get("spine1").is_none());

    removal.clone().wait().await;
    assert!(removal.is_complete());
    assert_eq!(controller.len(), 1);
    assert!(controller.remove("spine1").is_none());

    controller.stop();
    running
        .await
        .expect("controller task")
        .expect("clean shutdown");
    assert!(!controller.is_running());
    assert_eq!(
        controller.get("spine2").map(|session| session.phase()),
        Some(SessionPhase::Stopped)
    );
    for handle in handles {
        handle.abort();
    }
}

#[test_timeout::tokio_timeout_test]
async fn fail_fast_failure_stops_every_session() {
    let controller = controller();
    controller.init_logging();

    let (healthy, healthy_switch) = loopback();
    let _healthy_switch = serve_auto_primary(healthy_switch);
    let bystander = controller.new_session(
        "leaf-ok",
        "leaf-ok:9559",
        SessionConfig::builder().build(),
        Arc::new(healthy),
    );
    controller.add(bystander.clone()).expect("unique name");

    let (broken, broken_switch) = loopback();
    let _broken_switch = serve_auto_primary(broken_switch);
    let config = SessionConfig::builder()
        .fail_fast(true)
        .ready_hook(|_session: SwitchSession| {
            async { Err::<(), _>(anyhow::anyhow!("flow table out of sync")) }.boxed()
        })
        .build();
    controller
        .add(controller.new_session("leaf-bad", "leaf-bad:9559", config, Arc::new(broken)))
        .expect("unique name");

    let err = controller.run().await.expect_err("fail-fast escalates");
    assert_eq!(err.exit_code(), FAIL_FAST_EXIT_CODE);
    match &err {
        ControllerError::FailFast { name, source } => {
            assert_eq!(name, "leaf-bad");
            assert!(source.is_fatal());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("flow table out of sync"));
    assert_eq!(bystander.phase(), SessionPhase::Stopped);
    assert!(!controller.is_running());
}

#[test_timeout::tokio_timeout_test]
async fn panicking_session_stops_every_session() {
    let controller = controller();
    controller
        .events()
        .on(EventKind::ChannelReady, |event: &SwitchEvent| {
            if event.session().name() == "leaf-panic" {
                panic!("port map listener broke");
            }
        });

    let (healthy, healthy_switch) = loopback();
    let _healthy_switch = serve_auto_primary(healthy_switch);
    let bystander = controller.new_session(
        "leaf-ok",
        "leaf-ok:9559",
        SessionConfig::builder().build(),
        Arc::new(healthy),
    );
    controller.add(bystander.clone()).expect("unique name");

    let (broken, broken_switch) = loopback();
    let _broken_switch = serve_auto_primary(broken_switch);
    controller
        .add(controller.new_session(
            "leaf-panic",
            "leaf-panic:9559",
            SessionConfig::builder().build(),
            Arc::new(broken),
        ))
        .expect("unique name");

    let err = controller.run().await.expect_err("panic escalates");
    assert_eq!(err.exit_code(), FAIL_FAST_EXIT_CODE);
    match &err {
        ControllerError::Panicked { name, message } => {
            assert_eq!(name, "leaf-panic");
            assert!(message.contains("port map listener broke"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(bystander.phase(), SessionPhase::Stopped);
    assert!(!controller.is_running());
    assert_eq!(controller.len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn sessions_see_their_controller_and_shared_listeners() {
    let controller = controller();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::ControllerEnter, EventKind::ChannelReady] {
        let kinds = kinds.clone();
        controller
            .events()
            .on(kind, move |event: &SwitchEvent| kinds.lock().push(event.kind()));
    }

    let (connector, switch) = loopback();
    let _switch = serve_auto_primary(switch);
    let config = SessionConfig::builder()
        .initial_election_id(controller.election_ids().next_id())
        .ready_hook(move |session: SwitchSession| {
            let seen_tx = seen_tx.clone();
            async move {
                let names = Controller::current().map(|controller| controller.names());
                let _ = seen_tx.send((session.name().to_string(), names));
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        })
        .build();
    controller
        .add(controller.new_session("tor1", "tor1:9559", config, Arc::new(connector)))
        .expect("unique name");
    assert!(Controller::current().is_none());

    let running = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run().await }
    });
    let (name, names) = seen_rx.recv().await.expect("ready hook ran");
    assert_eq!(name, "tor1");
    assert_eq!(names, Some(vec!["tor1".to_string()]));
    assert_eq!(
        *kinds.lock(),
        vec![EventKind::ControllerEnter, EventKind::ChannelReady]
    );

    controller.stop();
    running
        .await
        .expect("controller task")
        .expect("clean shutdown");
}

#[test_timeout::tokio_timeout_test]
async fn sessions_added_while_running_start_immediately() {
    let controller = controller();
    let running = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run().await }
    });
    while !controller.is_running() {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        controller.run().await,
        Err(ControllerError::AlreadyRunning)
    ));

    let (connector, switch) = loopback();
    let _switch = serve_auto_primary(switch);
    let session = controller.new_session(
        "edge1",
        "edge1:9559",
        SessionConfig::builder().build(),
        Arc::new(connector),
    );
    controller.add(session.clone()).expect("unique name");
    wait_for_phase(&session, SessionPhase::Dispatching).await;
    assert!(session.is_primary());

    let (other, _other_switch) = loopback();
    let duplicate = controller.new_session(
        "edge1",
        "edge1-b:9559",
        SessionConfig::builder().build(),
        Arc::new(other),
    );
    assert!(matches!(
        controller.add(duplicate),
        Err(ControllerError::Duplicate(ref name)) if name == "edge1"
    ));

    controller.stop();
    running
        .await
        .expect("controller task")
        .expect("clean shutdown");
    assert_eq!(session.phase(), SessionPhase::Stopped);
}

#[test_timeout::timeout(5)]
fn election_ids_are_monotonic() {
    let controller = Controller::default();
    let first = controller.election_ids().next_id();
    let second = controller.election_ids().next_id();
    assert!(second > first);
    assert!(controller.is_empty());
}
