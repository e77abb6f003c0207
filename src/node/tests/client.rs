use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use super::{components, Behavior, FakeEngine, IMAGE, NODE};
use crate::{
    common::{CollaborationId, NodeId, RunId, TaskId},
    coordinator::{
        models::KILLED_BY_USER,
        server::serve,
        CoordinatorHandle,
        CoordinatorService,
        MemberRecord,
        NodeDirectory,
        RunState,
        TaskInput,
        TaskSpec,
        TaskState,
        TaskStatus,
    },
    crypto::{EncryptKeyPair, Keyring, SecureEnvelope, SigningKeyPair, StaticKeyRegistry},
    node::{Executor, NodeClient},
    settings::{ApiSettings, ChannelSettings, SchedulerSettings},
};

fn collaboration() -> CollaborationId {
    CollaborationId::from(1)
}

/// A coordinator and a single node of collaboration 1, connected over TCP.
struct Deployment {
    handle: CoordinatorHandle,
    engine: Arc<FakeEngine>,
    /// The node's own envelope, also used to open results since the node initiates every task.
    envelope: SecureEnvelope,
    shutdown: Option<oneshot::Sender<()>>,
    client: JoinHandle<()>,
    _data_dir: tempfile::TempDir,
}

impl Deployment {
    async fn start(engine: Arc<FakeEngine>) -> Self {
        sodiumoxide::init().unwrap();
        let node_id = NodeId::from(NODE);
        let signing = SigningKeyPair::generate();
        let encrypt = EncryptKeyPair::generate();

        let mut directory = NodeDirectory::default();
        directory.insert(
            collaboration(),
            node_id,
            MemberRecord {
                signing_key: signing.public,
            },
        );
        let mut registry = StaticKeyRegistry::default();
        registry.insert(collaboration(), node_id, encrypt.public);
        let registry = Arc::new(registry);
        let (handle, address) = start_coordinator(directory, registry.clone()).await;

        let mut keyring = Keyring::new(node_id);
        keyring.insert(collaboration(), encrypt);
        let envelope = SecureEnvelope::new(registry).with_keyring(keyring);
        let data_dir = tempfile::tempdir().unwrap();
        let (sandbox, bridge) = components(&engine, &data_dir);
        let client = NodeClient::new(
            ChannelSettings {
                address: address.to_string(),
                max_message_size: 1024 * 1024,
                initial_backoff: 10,
                max_backoff: 100,
            },
            node_id,
            signing,
            vec![collaboration()],
            Executor::new(sandbox, bridge, envelope.clone()),
        );
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let client = tokio::spawn(client.run(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            handle,
            engine,
            envelope,
            shutdown: Some(shutdown),
            client,
            _data_dir: data_dir,
        }
    }

    async fn submit(&self, input: &[u8]) -> (TaskId, RunId) {
        let task_id = self
            .handle
            .create_task(
                TaskSpec {
                    collaboration_id: collaboration(),
                    image: IMAGE.into(),
                    initiator: NodeId::from(NODE),
                    input: TaskInput::Plaintext(input.to_vec()),
                },
                vec![NodeId::from(NODE)],
            )
            .await
            .unwrap();
        let status = self.handle.task_status(task_id).await.unwrap();
        (task_id, status.runs[0].run_id)
    }

    async fn ready(&self, task_id: TaskId) -> TaskStatus {
        tokio::time::timeout(Duration::from_secs(10), self.handle.wait_until_ready(task_id))
            .await
            .expect("task not ready in time")
            .unwrap()
    }

    /// Waits until the coordinator saw the run start.
    async fn running(&self, task_id: TaskId) {
        for _ in 0..500 {
            let status = self.handle.task_status(task_id).await.unwrap();
            if status.runs[0].state == RunState::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never started");
    }

    async fn shut_down(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), &mut self.client)
            .await
            .expect("node did not shut down in time")
            .unwrap();
    }
}

async fn start_coordinator(
    directory: NodeDirectory,
    registry: Arc<StaticKeyRegistry>,
) -> (CoordinatorHandle, SocketAddr) {
    let (service, handle) = CoordinatorService::new(
        directory,
        registry,
        SchedulerSettings {
            dispatch_interval: 1,
            task_timeout: None,
        },
    );
    tokio::spawn(service.run());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(serve(
        listener,
        handle.clone(),
        ApiSettings {
            bind_address: address,
            max_message_size: 1024 * 1024,
            handshake_timeout: 5,
        },
    ));
    (handle, address)
}

#[tokio::test]
async fn test_task_is_executed_by_the_node() {
    let mut deployment =
        Deployment::start(FakeEngine::new().with_image(IMAGE, Behavior::Echo)).await;
    let (task_id, run_id) = deployment.submit(b"patients: 42").await;

    let status = deployment.ready(task_id).await;
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.runs[0].attempts, 1);
    let result = deployment.handle.result(run_id).await.unwrap();
    assert_ne!(result, b"patients: 42".to_vec());
    assert_eq!(
        deployment.envelope.decrypt(collaboration(), &result).unwrap(),
        b"patients: 42".to_vec()
    );

    deployment.shut_down().await;
    assert!(deployment.engine.live_containers().is_empty());
}

#[tokio::test]
async fn test_user_kill_reaches_the_container() {
    let mut deployment =
        Deployment::start(FakeEngine::new().with_image(IMAGE, Behavior::Forever)).await;
    let (task_id, run_id) = deployment.submit(b"input").await;
    deployment
        .engine
        .wait_for_container(&format!("federa-run-{}", run_id))
        .await;
    deployment.running(task_id).await;

    deployment.handle.kill_run(run_id).await.unwrap();
    let status = deployment.ready(task_id).await;
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.runs[0].state, RunState::Failed);
    assert_eq!(status.runs[0].failure_reason.as_deref(), Some(KILLED_BY_USER));
    assert!(deployment.engine.live_containers().is_empty());

    deployment.shut_down().await;
}

#[tokio::test]
async fn test_shutdown_reports_the_killed_runs() {
    let mut deployment =
        Deployment::start(FakeEngine::new().with_image(IMAGE, Behavior::Forever)).await;
    let (task_id, run_id) = deployment.submit(b"input").await;
    deployment
        .engine
        .wait_for_container(&format!("federa-run-{}", run_id))
        .await;
    deployment.running(task_id).await;

    deployment.shut_down().await;
    assert!(deployment.engine.live_containers().is_empty());
    assert!(deployment.engine.state().networks.is_empty());
    let status = deployment.ready(task_id).await;
    assert_eq!(status.runs[0].state, RunState::Failed);
    assert_eq!(
        status.runs[0].failure_reason.as_deref(),
        Some("killed_by:shutdown")
    );
}
