use super::{Backend, Instance, InstanceError, InstanceOptions};
use crate::git::GitWorktree;
use crate::storage::InstanceData;

impl Instance {
    pub fn to_data(&self) -> InstanceData {
        InstanceData {
            title: self.title.clone(),
            path: self.path.clone(),
            branch: self.branch.clone(),
            status: self.status,
            program: self.program.clone(),
            plan_file: self.plan_file.clone().unwrap_or_default(),
            agent_type: self.agent_type,
            implementation_complete: self.implementation_complete,
            wave_number: self.wave_number,
            task_number: self.task_number,
            peer_count: self.peer_count,
            worktree: self
                .worktree
                .as_ref()
                .map(GitWorktree::to_data)
                .unwrap_or_default(),
            shared_worktree: self.shared_worktree,
            skip_permissions: self.skip_permissions,
            auto_yes: self.auto_yes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Rebuild an instance from its saved form. It is not started: call
    /// `start(false)` to reattach to its session.
    pub fn from_data(data: InstanceData, backend: Backend) -> Result<Self, InstanceError> {
        let worktree = (!data.worktree.worktree_path.as_os_str().is_empty())
            .then(|| GitWorktree::from_data(backend.executor.clone(), &data.worktree));

        let mut instance = Instance::new(
            InstanceOptions {
                title: data.title,
                path: data.path,
                program: data.program,
                agent_type: data.agent_type,
                skip_permissions: data.skip_permissions,
                auto_yes: data.auto_yes,
                plan_file: Some(data.plan_file),
                wave: None,
                prompt: None,
            },
            backend,
        )?;

        instance.branch = data.branch;
        instance.status = data.status;
        instance.implementation_complete = data.implementation_complete;
        instance.task_number = data.task_number;
        instance.wave_number = data.wave_number;
        instance.peer_count = data.peer_count;
        instance.worktree = worktree;
        instance.shared_worktree = data.shared_worktree;
        instance.created_at = data.created_at;
        instance.updated_at = data.updated_at;
        Ok(instance)
    }
}
