//! Project registry and build request resolution.

use foreman_core::{BuildParams, Project};

use crate::ProjectNotRunnable;

/// A project ready to be built together with the params recorded on the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProject {
    pub project: Project,
    pub params: BuildParams,
}

/// Static list of the projects a distributor knows about.
#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    projects: Vec<Project>,
}

impl ProjectRegistry {
    pub fn new(projects: Vec<Project>) -> Self {
        Self { projects }
    }

    pub fn get(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Resolve a build request against the registry.
    ///
    /// Unknown and archived projects are rejected. A requested scm revision
    /// pins the returned project to it and is kept in the params.
    pub fn resolve(
        &self,
        project_name: &str,
        params: &BuildParams,
    ) -> Result<ResolvedProject, ProjectNotRunnable> {
        let project = self
            .get(project_name)
            .ok_or_else(|| ProjectNotRunnable::NotFound(project_name.to_string()))?;

        if project.archived {
            return Err(ProjectNotRunnable::Archived(project.name.clone()));
        }

        let project = match &params.scm_rev {
            Some(rev) => project.at_rev(rev),
            None => project.clone(),
        };

        Ok(ResolvedProject {
            project,
            params: params.clone(),
        })
    }
}
