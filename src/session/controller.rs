use std::collections::HashSet;
use std::path::Path;

use futures::future::join_all;

use super::{Backend, Instance, InstanceError, InstanceMetadata, InstanceOptions, Status};
use crate::storage::InstanceStorage;
use crate::tmux::discovery::{self, SessionInfo};
use crate::tmux::{sanitize_name, SESSION_PREFIX};

/// Owns every instance of one kasmos process and keeps them persisted.
pub struct InstanceController {
    instances: Vec<Instance>,
    backend: Backend,
    storage: InstanceStorage,
}

impl InstanceController {
    pub fn new(backend: Backend, storage: InstanceStorage) -> Self {
        Self {
            instances: Vec::new(),
            backend,
            storage,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn storage(&self) -> &InstanceStorage {
        &self.storage
    }

    /// Build an instance on this controller's backend. It is not added.
    pub fn create(&self, opts: InstanceOptions) -> Result<Instance, InstanceError> {
        Instance::new(opts, self.backend.clone())
    }

    fn check_unique(&self, title: &str) -> Result<(), InstanceError> {
        if self.instances.iter().any(|i| i.title() == title) {
            return Err(InstanceError::DuplicateTitle(title.to_string()));
        }
        // Titles differing only in whitespace or dots share a tmux name
        let session = sanitize_name(title);
        if self.instances.iter().any(|i| i.session_name() == session) {
            return Err(InstanceError::SessionCollision {
                title: title.to_string(),
                session,
            });
        }
        Ok(())
    }

    pub fn add(&mut self, instance: Instance) -> Result<&mut Instance, InstanceError> {
        self.check_unique(instance.title())?;
        tracing::debug!("Tracking instance {}", instance.title());
        self.instances.push(instance);
        let last = self.instances.len() - 1;
        Ok(&mut self.instances[last])
    }

    pub fn get(&self, title: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.title() == title)
    }

    pub fn get_mut(&mut self, title: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.title() == title)
    }

    pub fn list(&self) -> &[Instance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Kill the instance and forget it. Kill failures are logged, not
    /// returned: the entry goes either way.
    pub fn remove(&mut self, title: &str) -> Result<Instance, InstanceError> {
        let index = self
            .instances
            .iter()
            .position(|i| i.title() == title)
            .ok_or_else(|| InstanceError::NotFound(title.to_string()))?;

        let mut instance = self.instances.remove(index);
        if let Err(e) = instance.kill() {
            tracing::error!("Failed to kill instance {}: {}", title, e);
        }
        self.save()?;
        Ok(instance)
    }

    pub fn save(&self) -> Result<(), InstanceError> {
        let data: Vec<_> = self.instances.iter().map(Instance::to_data).collect();
        self.storage.save_instances(&data)?;
        Ok(())
    }

    /// Load saved instances and reattach every one that isn't paused.
    /// Returns how many were loaded; reattach failures are logged and the
    /// instance stays in the model unstarted.
    pub fn load(&mut self) -> Result<usize, InstanceError> {
        let saved = self.storage.load_instances()?;
        let mut loaded = 0;

        for data in saved {
            let title = data.title.clone();
            let mut instance = match Instance::from_data(data, self.backend.clone()) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!("Skipping saved instance {:?}: {}", title, e);
                    continue;
                }
            };
            if let Err(e) = self.check_unique(instance.title()) {
                tracing::warn!("Skipping saved instance {:?}: {}", title, e);
                continue;
            }

            let saved_status = instance.status();
            if saved_status != Status::Paused {
                if let Err(e) = instance.start(false) {
                    tracing::warn!("Could not reattach {}: {}", title, e);
                    instance.status = saved_status;
                }
            } else {
                // Paused work only needs `resume`, which requires started
                instance.bind_detached_session();
            }

            self.instances.push(instance);
            loaded += 1;
        }

        tracing::info!("Loaded {} instances", loaded);
        Ok(loaded)
    }

    /// tmux names this model owns.
    pub fn known_session_names(&self) -> HashSet<String> {
        self.instances.iter().map(Instance::session_name).collect()
    }

    /// Prefixed sessions on the server that no instance owns.
    pub fn discover_orphans(&self) -> Result<Vec<SessionInfo>, InstanceError> {
        let known = self.known_session_names();
        Ok(discovery::discover_orphans(self.backend.executor.as_ref(), &known)?)
    }

    /// Bind `session_name` to the unstarted instance that owns that name,
    /// or to a new instance titled after the session.
    pub fn adopt_orphan(
        &mut self,
        session_name: &str,
        path: &Path,
        program: &str,
    ) -> Result<&mut Instance, InstanceError> {
        if let Some(index) = self
            .instances
            .iter()
            .position(|i| !i.started() && i.session_name() == session_name)
        {
            let instance = &mut self.instances[index];
            instance.adopt_orphan_tmux_session(session_name)?;
            return Ok(instance);
        }

        let title = session_name
            .strip_prefix(SESSION_PREFIX)
            .unwrap_or(session_name)
            .to_string();
        let mut instance = self.create(InstanceOptions {
            title,
            path: path.to_path_buf(),
            program: program.to_string(),
            ..Default::default()
        })?;
        instance.adopt_orphan_tmux_session(session_name)?;
        self.add(instance)
    }

    /// Observe every live instance, each on its own blocking worker.
    pub async fn collect_metadata(&self) -> Vec<(String, InstanceMetadata)> {
        let tasks = self.instances.iter().filter_map(|instance| {
            let probe = instance.metadata_probe()?;
            let title = instance.title().to_string();
            Some(async move {
                match tokio::task::spawn_blocking(move || probe.collect()).await {
                    Ok(metadata) => Some((title, metadata)),
                    Err(e) => {
                        tracing::warn!("Metadata worker for {} failed: {}", title, e);
                        None
                    }
                }
            })
        });

        join_all(tasks).await.into_iter().flatten().collect()
    }

    pub fn apply_metadata(&mut self, results: Vec<(String, InstanceMetadata)>) {
        for (title, metadata) in results {
            // Removed while its worker ran
            if let Some(instance) = self.get_mut(&title) {
                instance.apply_metadata(metadata);
            }
        }
    }

    /// One UI tick: collect, then apply.
    pub async fn tick(&mut self) {
        let results = self.collect_metadata().await;
        self.apply_metadata(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fake_backend, init_repo, FakeTmux};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        fake: Arc<FakeTmux>,
        repo: TempDir,
        config: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = TempDir::new().unwrap();
            init_repo(repo.path());
            Self {
                fake: Arc::new(FakeTmux::new()),
                repo,
                config: TempDir::new().unwrap(),
            }
        }

        fn controller(&self) -> InstanceController {
            let (backend, _) = fake_backend(&self.fake);
            let storage = InstanceStorage::new_with_base(self.config.path().to_path_buf()).unwrap();
            InstanceController::new(backend, storage)
        }

        fn options(&self, title: &str) -> InstanceOptions {
            InstanceOptions {
                title: title.to_string(),
                path: self.repo.path().to_path_buf(),
                program: "bash".to_string(),
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_add_rejects_duplicates_and_collisions() {
        let fx = Fixture::new();
        let mut controller = fx.controller();
        let first = controller.create(fx.options("ab")).unwrap();
        controller.add(first).unwrap();

        let dup = controller.create(fx.options("ab")).unwrap();
        assert!(matches!(controller.add(dup), Err(InstanceError::DuplicateTitle(_))));

        let collide = controller.create(fx.options("a b")).unwrap();
        let err = controller.add(collide).unwrap_err();
        assert!(matches!(err, InstanceError::SessionCollision { ref session, .. } if session == "kas_ab"));
        assert_eq!(controller.len(), 1);
    }

    #[test]
    fn test_remove_kills_and_persists() {
        let fx = Fixture::new();
        let mut controller = fx.controller();
        let instance = controller.create(fx.options("doomed")).unwrap();
        controller.add(instance).unwrap().start(true).unwrap();
        controller.save().unwrap();
        assert_eq!(controller.storage().saved_titles().unwrap(), vec!["doomed"]);

        controller.remove("doomed").unwrap();
        assert!(controller.is_empty());
        assert!(fx.fake.sessions().is_empty());
        assert!(!fx.repo.path().join(".worktrees/doomed").exists());
        assert!(controller.storage().saved_titles().unwrap().is_empty());

        assert!(matches!(controller.remove("doomed"), Err(InstanceError::NotFound(_))));
    }

    #[test]
    fn test_save_and_load_reattaches() {
        let fx = Fixture::new();
        {
            let mut controller = fx.controller();
            let live = controller.create(fx.options("live")).unwrap();
            controller.add(live).unwrap().start(true).unwrap();
            let paused = controller.create(fx.options("resting")).unwrap();
            let paused = controller.add(paused).unwrap();
            paused.start(true).unwrap();
            paused.pause().unwrap();
            controller.save().unwrap();
        }

        let mut controller = fx.controller();
        assert_eq!(controller.load().unwrap(), 2);

        let live = controller.get("live").unwrap();
        assert!(live.started());
        assert_eq!(live.status(), Status::Running);
        assert!(live.tmux_session().unwrap().is_attached());

        let resting = controller.get_mut("resting").unwrap();
        assert!(resting.is_paused());
        assert!(resting.started());
        assert!(resting.tmux_session().is_some());
        assert_eq!(resting.session_name(), "kas_resting");
        resting.resume().unwrap();
        assert!(fx.repo.path().join(".worktrees/resting").exists());
    }

    #[test]
    fn test_load_keeps_instance_whose_session_is_gone() {
        let fx = Fixture::new();
        {
            let mut controller = fx.controller();
            let live = controller.create(fx.options("lost")).unwrap();
            controller.add(live).unwrap().start(true).unwrap();
            controller.save().unwrap();
        }
        fx.fake.remove_session("kas_lost");

        let mut controller = fx.controller();
        assert_eq!(controller.load().unwrap(), 1);
        let lost = controller.get("lost").unwrap();
        assert!(!lost.started());
        assert_eq!(lost.status(), Status::Running);
    }

    #[test]
    fn test_discover_and_adopt_orphan() {
        let fx = Fixture::new();
        let mut controller = fx.controller();
        let known = controller.create(fx.options("known")).unwrap();
        controller.add(known).unwrap().start(true).unwrap();
        fx.fake.add_session("kas_stray");
        fx.fake.add_session("other");

        let orphans = controller.discover_orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, "kas_stray");
        assert!(!orphans[0].managed);

        let adopted = controller
            .adopt_orphan("kas_stray", fx.repo.path(), "claude")
            .unwrap();
        assert_eq!(adopted.title(), "stray");
        assert_eq!(adopted.status(), Status::Ready);
        assert!(controller.discover_orphans().unwrap().is_empty());
    }

    #[test]
    fn test_adopt_orphan_into_unstarted_instance() {
        let fx = Fixture::new();
        let mut controller = fx.controller();
        let waiting = controller.create(fx.options("waiting")).unwrap();
        controller.add(waiting).unwrap();
        fx.fake.add_session("kas_waiting");

        controller
            .adopt_orphan("kas_waiting", fx.repo.path(), "bash")
            .unwrap();
        assert_eq!(controller.len(), 1);
        assert!(controller.get("waiting").unwrap().started());
    }

    #[test]
    fn test_discovery_without_server() {
        let fx = Fixture::new();
        fx.fake.set_no_server(true);
        let controller = fx.controller();
        assert!(controller.discover_orphans().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collect_and_apply_metadata() {
        let fx = Fixture::new();
        let mut controller = fx.controller();
        for title in ["one", "two"] {
            let instance = controller.create(fx.options(title)).unwrap();
            controller.add(instance).unwrap().start(true).unwrap();
        }
        let idle = controller.create(fx.options("idle")).unwrap();
        controller.add(idle).unwrap();
        fx.fake.queue_captures(["$ "]);

        let results = controller.collect_metadata().await;
        let mut titles: Vec<_> = results.iter().map(|(t, _)| t.clone()).collect();
        titles.sort();
        assert_eq!(titles, vec!["one", "two"]);
        assert!(results.iter().all(|(_, m)| m.captured && m.tmux_alive));

        controller.apply_metadata(results);
        assert_eq!(controller.get("one").unwrap().cached_content(), Some("$ "));
        assert!(controller.get("idle").unwrap().cached_content().is_none());

        controller.tick().await;
        assert_eq!(controller.get("two").unwrap().status(), Status::Running);
    }
}
