//! `BuildQueue`: the trait the orchestrator-driving loop needs to pull
//! `BuildId`s from, plus one in-memory implementation. Spec.md treats the
//! queue as an external collaborator contract only (§9.1); this crate
//! defines the trait shape and ships a single-process implementation
//! sufficient for the test suite and non-durable deployments. Grounded on
//! `examples/other_examples` oore.build's `recover_pending_builds`: mark
//! builds left `Running` by a prior process as `Failed` ("interrupted"), and
//! re-deliver builds left `Queued`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::{BuildsRepo, Db};
use crate::model::{BuildId, BuildStatus};

#[async_trait]
pub trait BuildQueue: Send + Sync {
    /// Delivers the next build id to drive through `Execute`, or `None` if
    /// the queue has been permanently closed.
    async fn next(&self) -> Option<BuildId>;

    /// Called once at process startup: reconciles builds left in a
    /// non-terminal state by a prior process instance. Builds found
    /// `Running` did not survive the restart and are marked `Failed`;
    /// builds found `Queued` are re-delivered through `next`. Returns the
    /// set of build ids re-enqueued.
    async fn recover_pending(&self) -> Vec<BuildId>;
}

pub struct InMemoryBuildQueue {
    db: Arc<Db>,
    sender: mpsc::UnboundedSender<BuildId>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<BuildId>>,
}

impl InMemoryBuildQueue {
    pub fn new(db: Arc<Db>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { db, sender, receiver: AsyncMutex::new(receiver) }
    }

    /// Enqueues a newly-created build for delivery.
    pub fn push(&self, build_id: BuildId) {
        let _ = self.sender.send(build_id);
    }
}

#[async_trait]
impl BuildQueue for InMemoryBuildQueue {
    async fn next(&self) -> Option<BuildId> {
        self.receiver.lock().await.recv().await
    }

    async fn recover_pending(&self) -> Vec<BuildId> {
        let conn = match self.db.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "recover_pending: failed to check out db connection");
                return Vec::new();
            }
        };

        let pending = match BuildsRepo::get_pending(&conn) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "recover_pending: failed to list pending builds");
                return Vec::new();
            }
        };

        let mut recovered = Vec::new();
        for build_id in pending {
            let Ok(Some(mut build)) = BuildsRepo::get(&conn, build_id) else { continue };
            match build.status {
                BuildStatus::Running => {
                    build.mark_terminal(BuildStatus::Failed, Some("interrupted by process restart".to_string()));
                    if let Err(e) = BuildsRepo::save(&conn, &build) {
                        warn!(build_id = build_id.0, error = %e, "recover_pending: failed to mark interrupted build failed");
                    }
                }
                BuildStatus::Queued => {
                    self.push(build_id);
                    recovered.push(build_id);
                }
                _ => {}
            }
        }

        info!(recovered = recovered.len(), "recover_pending complete");
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Build, Project, ProjectId};

    async fn db_with_project() -> Arc<Db> {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conn = db.checkout().await.unwrap();
        crate::db::ProjectsRepo::insert(
            &conn,
            &Project {
                id: ProjectId(1),
                repo_full_name: "acme/widgets".into(),
                installation_id: None,
                docker_image: None,
                timeout_minutes: 30,
                profile: None,
                available_profiles: vec![],
                notify_on_failure: false,
                secrets: vec![],
                dind: false,
            },
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn push_then_next_delivers_in_order() {
        let db = db_with_project().await;
        let queue = InMemoryBuildQueue::new(db);
        queue.push(BuildId(1));
        queue.push(BuildId(2));
        assert_eq!(queue.next().await, Some(BuildId(1)));
        assert_eq!(queue.next().await, Some(BuildId(2)));
    }

    #[tokio::test]
    async fn recover_pending_fails_running_and_requeues_queued() {
        let db = db_with_project().await;
        {
            let conn = db.checkout().await.unwrap();
            let mut running = Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40));
            running.mark_running();
            BuildsRepo::insert(&conn, &running).unwrap();

            let queued = Build::new(BuildId(2), ProjectId(1), "main".into(), "b".repeat(40));
            BuildsRepo::insert(&conn, &queued).unwrap();
        }

        let queue = InMemoryBuildQueue::new(db.clone());
        let recovered = queue.recover_pending().await;
        assert_eq!(recovered, vec![BuildId(2)]);

        let conn = db.checkout().await.unwrap();
        let running_after = BuildsRepo::get(&conn, BuildId(1)).unwrap().unwrap();
        assert_eq!(running_after.status, BuildStatus::Failed);
        assert_eq!(running_after.error_message.as_deref(), Some("interrupted by process restart"));

        assert_eq!(queue.next().await, Some(BuildId(2)));
    }
}
