//! The resource shell: one synchronized account.
//!
//! A [`Resource`] wires the pieces of one instance together: the entity
//! store owned by the pipeline, the `.synchronization` mapping store, the
//! per-type preprocessor registration, query execution, and change
//! replay. Construction mirrors how a concrete resource (a maildir
//! account, a calendar) sets itself up; the plug-in loading surface is
//! the [`ResourceFactory`] registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{info, instrument};

use crate::config::Config;
use crate::domain::EntityType;
use crate::entity::EntityBuffer;
use crate::error::Result;
use crate::pipeline::{
    DefaultIndexUpdater, Notification, Pipeline, PipelineKind, Preprocessor,
};
use crate::query::{LiveQuery, Query, QueryExecutor, ResultSet};
use crate::storage::{AccessMode, Store};
use crate::sync::{ChangeReplay, SynchronizationContext, Synchronizer};
use crate::types::{Revision, Uid};

/// One resource instance: stores, pipeline, synchronization state.
pub struct Resource {
    config: Config,
    pipeline: Pipeline,
    sync_store: Store,
    change_replay: ChangeReplay,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("instance_id", &self.config.instance_id)
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// Opens or creates the resource instance described by the config.
    ///
    /// Every entity type starts with the default index updater on all
    /// three pipelines; [`Resource::add_type`] replaces a type's chain.
    #[instrument(skip(config), fields(instance_id = %config.instance_id))]
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        info!("starting resource");

        let store = Store::open(config.store_path(), AccessMode::ReadWrite)?;
        let sync_store = Store::open(config.synchronization_store_path(), AccessMode::ReadWrite)?;
        let mut pipeline = Pipeline::new(store, &config)?;
        for entity_type in EntityType::ALL {
            for kind in [PipelineKind::New, PipelineKind::Modified, PipelineKind::Deleted] {
                pipeline.set_preprocessors(entity_type, kind, vec![Box::new(DefaultIndexUpdater)]);
            }
        }

        Ok(Self {
            config,
            pipeline,
            sync_store,
            change_replay: ChangeReplay::new(),
        })
    }

    /// Identifier of this instance.
    #[inline]
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// The entity store.
    #[inline]
    pub fn store(&self) -> &Store {
        self.pipeline.store()
    }

    /// The remote-ID mapping store.
    #[inline]
    pub fn synchronization_store(&self) -> &Store {
        &self.sync_store
    }

    /// The ingestion pipeline.
    #[inline]
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// Registers the preprocessor chains for one entity type.
    ///
    /// The builder is invoked once per pipeline kind, mirroring how
    /// resources register the same steps for create, modify, and delete.
    pub fn add_type(
        &mut self,
        entity_type: EntityType,
        mut preprocessors: impl FnMut(PipelineKind) -> Vec<Box<dyn Preprocessor>>,
    ) {
        for kind in [PipelineKind::New, PipelineKind::Modified, PipelineKind::Deleted] {
            self.pipeline
                .set_preprocessors(entity_type, kind, preprocessors(kind));
        }
    }

    /// Ingests a serialized command buffer.
    pub fn ingest(&mut self, buffer: &[u8]) -> Result<Option<Revision>> {
        self.pipeline.ingest(buffer)
    }

    /// Steps the pipeline until no processable state remains.
    pub fn process_all(&mut self) -> Result<()> {
        self.pipeline.drain()
    }

    /// Runs a non-live query.
    ///
    /// Honors `process_all` by draining the pipeline first; a
    /// `sync_on_demand` query is expected to go through
    /// [`Resource::synchronize`] before it is issued here.
    pub fn query(&mut self, query: &Query) -> Result<ResultSet> {
        if query.process_all {
            self.pipeline.drain()?;
        }
        QueryExecutor::new(self.pipeline.store()).execute(query)
    }

    /// Runs the child query for one parent row of a tree query.
    pub fn fetch_children(&self, query: &Query, parent: &Uid) -> Result<ResultSet> {
        QueryExecutor::new(self.pipeline.store()).fetch_children(query, parent)
    }

    /// Starts a live query: a snapshot plus a subscription on the
    /// pipeline's notifications.
    ///
    /// Drive it with [`LiveQuery::process_notifications`] against
    /// [`Resource::store`]. Dropping the live query cancels the
    /// subscription.
    pub fn live_query(&mut self, query: Query) -> Result<LiveQuery> {
        if query.process_all {
            self.pipeline.drain()?;
        }
        let notifications = self.pipeline.subscribe();
        LiveQuery::start(self.pipeline.store(), notifications, query)
    }

    /// Subscribes to raw pipeline notifications.
    pub fn subscribe(&mut self) -> crossbeam_channel::Receiver<Notification> {
        self.pipeline.subscribe()
    }

    /// Runs one synchronization pass.
    ///
    /// The pass sees a read snapshot of the entity store and holds the
    /// mapping store's writer; change replay is disabled for the
    /// duration (replaying would deadlock on the mapping writer). The
    /// mapping transaction commits before the produced commands are
    /// ingested.
    #[instrument(skip_all, fields(instance_id = %self.config.instance_id))]
    pub fn synchronize(&mut self, synchronizer: &mut dyn Synchronizer) -> Result<()> {
        info!("synchronizing");
        self.change_replay.set_enabled(false);

        let commands = {
            let main_txn = self.pipeline.store().begin(AccessMode::ReadOnly)?;
            let sync_txn = self.sync_store.begin(AccessMode::ReadWrite)?;
            let mut commands = Vec::new();
            let mut ctx = SynchronizationContext {
                main_txn: &main_txn,
                sync_txn: &sync_txn,
                commands: &mut commands,
            };
            match synchronizer.synchronize(&mut ctx) {
                Ok(()) => {
                    sync_txn.commit()?;
                    commands
                }
                Err(e) => {
                    sync_txn.abort()?;
                    self.change_replay.set_enabled(true);
                    return Err(e);
                }
            }
        };

        let mut outcome = Ok(());
        for command in commands {
            if let Err(e) = self.pipeline.ingest_command(command) {
                outcome = Err(e);
                break;
            }
        }
        self.change_replay.set_enabled(true);
        info!("done synchronizing");
        outcome
    }

    /// Replays pending local changes to the source.
    ///
    /// Returns 0 while a synchronization pass has replay disabled.
    pub fn replay_changes(
        &mut self,
        replayer: impl FnMut(EntityType, &Uid, &EntityBuffer) -> Result<()>,
    ) -> Result<usize> {
        self.change_replay.replay(self.pipeline.store(), replayer)
    }

    /// Deletes both stores of an instance from disk.
    ///
    /// The instance must not be open.
    pub fn remove_from_disk(config: &Config) -> Result<()> {
        Store::remove_from_disk(config.store_path())?;
        Store::remove_from_disk(config.synchronization_store_path())?;
        Ok(())
    }
}

/// Constructs resource instances for one plug-in.
pub trait ResourceFactory: Send + Sync {
    /// Creates the resource instance described by the config.
    fn create_resource(&self, config: Config) -> Result<Resource>;
}

type FactoryRegistry = Mutex<HashMap<String, Arc<dyn ResourceFactory>>>;

fn registry() -> &'static FactoryRegistry {
    static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a factory under a plug-in name, e.g. `"maildir"`.
pub fn register_factory(name: impl Into<String>, factory: Arc<dyn ResourceFactory>) {
    registry()
        .lock()
        .expect("factory registry poisoned")
        .insert(name.into(), factory);
}

/// Locates a registered factory by plug-in name.
pub fn load(name: &str) -> Option<Arc<dyn ResourceFactory>> {
    registry()
        .lock()
        .expect("factory registry poisoned")
        .get(name)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resource_requires_valid_config() {
        let err = Resource::new(Config::default()).unwrap_err();
        assert!(matches!(err, crate::SiltError::Config { .. }));
    }

    #[test]
    fn test_resource_creates_both_stores() {
        let dir = tempdir().unwrap();
        let config = Config::for_instance(dir.path(), "dummy.instance1");
        let resource = Resource::new(config.clone()).unwrap();

        assert_eq!(resource.instance_id(), "dummy.instance1");
        assert!(config.store_path().join("data.redb").exists());
        assert!(config
            .synchronization_store_path()
            .join("data.redb")
            .exists());
    }

    #[test]
    fn test_remove_from_disk_removes_both_stores() {
        let dir = tempdir().unwrap();
        let config = Config::for_instance(dir.path(), "dummy.instance1");
        {
            let _resource = Resource::new(config.clone()).unwrap();
        }
        Resource::remove_from_disk(&config).unwrap();
        assert!(!config.store_path().exists());
        assert!(!config.synchronization_store_path().exists());
    }

    #[test]
    fn test_add_type_replaces_preprocessor_chain() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(Arc<AtomicUsize>);
        impl Preprocessor for Counting {
            fn name(&self) -> &str {
                "counting"
            }
            fn process(
                &mut self,
                _ctx: &crate::pipeline::PipelineContext<'_>,
            ) -> Result<crate::pipeline::Processing> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(crate::pipeline::Processing::Completed)
            }
        }

        let dir = tempdir().unwrap();
        let mut resource =
            Resource::new(Config::for_instance(dir.path(), "dummy.instance1")).unwrap();

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);
        resource.add_type(EntityType::Event, move |_kind| {
            vec![Box::new(Counting(Arc::clone(&counter)))]
        });

        let payload = crate::domain::Event {
            summary: "standup".into(),
            uid: "u7".into(),
            ..Default::default()
        }
        .encode()
        .unwrap();
        resource
            .pipeline_mut()
            .new_entity(
                EntityType::Event,
                &crate::types::Uid::from_bytes(b"e1"),
                &payload,
                false,
            )
            .unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_factory_registry() {
        struct DummyFactory;
        impl ResourceFactory for DummyFactory {
            fn create_resource(&self, config: Config) -> Result<Resource> {
                Resource::new(config)
            }
        }

        register_factory("dummy", Arc::new(DummyFactory));
        let factory = load("dummy").expect("factory must be registered");

        let dir = tempdir().unwrap();
        let config = Config::for_instance(dir.path(), "dummy.instance1");
        let resource = factory.create_resource(config).unwrap();
        assert_eq!(resource.instance_id(), "dummy.instance1");

        assert!(load("unknown").is_none());
    }
}
