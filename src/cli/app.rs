//! Component assembly shared by the CLI commands.

use super::config::SalternConfig;
use saltern::directory::{
    HomeserverView, StaticDirectory, StaticHomeserverView, UserDirectory,
};
use saltern::hasher::{BuiltinHashEngine, HashEngine};
use saltern::jobs::federation::FederationSyncJob;
use saltern::jobs::incremental::IncrementalUserSyncJob;
use saltern::jobs::rotation::PepperRotationJob;
use saltern::peers::{HttpPeerClient, PeerAddress, PeerLookupClient};
use saltern::pool::HashComputationPool;
use saltern::scheduler::{Scheduler, ScheduleIntervals};
use saltern::store::{CatalogStore, PepperSlot, PepperStore, SqliteStore};
use std::sync::Arc;

/// Assembled collaborators for one CLI invocation.
pub struct App {
    pub config: SalternConfig,
    store: Arc<SqliteStore>,
    engine: Arc<BuiltinHashEngine>,
    directory: Arc<dyn UserDirectory>,
    view: Option<Arc<dyn HomeserverView>>,
}

impl App {
    /// Open the database and wire up the collaborators from configuration.
    pub async fn build(config: SalternConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(SqliteStore::open(&config.storage.database).await?);

        let engine = Arc::new(BuiltinHashEngine::new());
        engine.ready().await?;

        let directory = Arc::new(StaticDirectory::new(config.directory.users.clone()))
            as Arc<dyn UserDirectory>;
        let view = config.homeserver_view.as_ref().map(|view| {
            Arc::new(StaticHomeserverView::new(view.users.clone())) as Arc<dyn HomeserverView>
        });

        Ok(Self {
            config,
            store,
            engine,
            directory,
            view,
        })
    }

    fn pool(&self) -> HashComputationPool<SqliteStore, BuiltinHashEngine> {
        HashComputationPool::new(self.store.clone(), self.engine.clone())
    }

    pub fn rotation_job(&self) -> PepperRotationJob<SqliteStore, BuiltinHashEngine> {
        PepperRotationJob::new(
            self.store.clone(),
            self.directory.clone(),
            self.view.clone(),
            self.pool(),
            self.config.identity.server_name.clone(),
        )
    }

    pub fn incremental_job(&self) -> IncrementalUserSyncJob<SqliteStore, BuiltinHashEngine> {
        IncrementalUserSyncJob::new(
            self.store.clone(),
            self.directory.clone(),
            self.view.clone(),
            self.pool(),
            self.config.identity.server_name.clone(),
            self.config.federation.peers_configured(),
        )
    }

    /// One sync job per configured peer list.
    pub fn federation_jobs(
        &self,
    ) -> Result<Vec<FederationSyncJob<BuiltinHashEngine>>, Box<dyn std::error::Error>> {
        let host = self.config.lookup_host()?;
        let client = Arc::new(HttpPeerClient::new()?) as Arc<dyn PeerLookupClient>;

        let lists = [
            ("federation server", &self.config.federation.servers),
            (
                "identity service",
                &self.config.federation.identity_services,
            ),
        ];
        let jobs = lists
            .into_iter()
            .filter(|(_, peers)| !peers.is_empty())
            .map(|(label, peers)| {
                FederationSyncJob::new(
                    label,
                    client.clone(),
                    self.engine.clone(),
                    self.directory.clone(),
                    self.view.clone(),
                    peers.iter().cloned().map(PeerAddress).collect(),
                    host.clone(),
                )
            })
            .collect();
        Ok(jobs)
    }

    pub fn scheduler(
        &self,
        intervals: ScheduleIntervals,
    ) -> Result<Scheduler<SqliteStore, BuiltinHashEngine>, Box<dyn std::error::Error>> {
        Ok(Scheduler::new(
            self.store.clone(),
            self.rotation_job(),
            self.incremental_job(),
            self.federation_jobs()?,
            intervals,
        ))
    }

    /// Run one rotation cycle, bootstrapping on a fresh database.
    pub async fn rotate_once(&self) -> Result<(), Box<dyn std::error::Error>> {
        let job = self.rotation_job();
        let outcome = if self.store.pepper(PepperSlot::Current).await?.is_none() {
            job.bootstrap().await?
        } else {
            job.run_cycle().await?
        };
        println!(
            "Rotation complete: {} rows rebuilt, {} rows retired",
            outcome.rebuilt_rows, outcome.retired_rows
        );
        Ok(())
    }

    /// Run one incremental reconciliation cycle.
    pub async fn sync_once(&self) -> Result<(), Box<dyn std::error::Error>> {
        let outcome = self.incremental_job().run_cycle().await?;
        println!(
            "Sync complete: {} new, {} reactivated, {} deactivated, {} rows hashed",
            outcome.new_users, outcome.reactivated, outcome.deactivated, outcome.hashed_rows
        );
        Ok(())
    }

    /// Run one federation push cycle over both peer lists.
    pub async fn federate_once(&self) -> Result<(), Box<dyn std::error::Error>> {
        let jobs = self.federation_jobs()?;
        if jobs.is_empty() {
            println!("No federation peers configured");
            return Ok(());
        }
        for job in jobs {
            let outcome = job.run_cycle().await?;
            println!(
                "Federation push: {}/{} peers synced, {} pushes sent, {} failed",
                outcome.peers_synced,
                outcome.peers_total,
                outcome.pushes_sent,
                outcome.pushes_failed
            );
        }
        Ok(())
    }

    /// Print a catalog/pepper summary.
    pub async fn status(&self) -> Result<(), Box<dyn std::error::Error>> {
        let current = self.store.pepper(PepperSlot::Current).await?;
        let previous = self.store.pepper(PepperSlot::Previous).await?;
        let hashes = self.store.count_hashes().await?;

        println!("Database: {}", self.config.storage.database.display());
        println!(
            "Current pepper: {}",
            if current.is_some() { "set" } else { "absent" }
        );
        println!(
            "Previous pepper: {}",
            if previous.is_some() { "set" } else { "absent" }
        );
        println!("Hash records: {hashes}");
        println!("Local users: {}", self.config.directory.users.len());
        println!(
            "Peers: {} federation server(s), {} identity service(s)",
            self.config.federation.servers.len(),
            self.config.federation.identity_services.len()
        );
        Ok(())
    }
}
