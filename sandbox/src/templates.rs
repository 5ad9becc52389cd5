use std::str::FromStr;

use tracing::info;

use crate::errors::{Result, SandboxError};
use crate::fs::SandboxFs;
use crate::path::RelativePath;

/// Starter project layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectTemplate {
    React,
    Node,
    Python,
}

impl ProjectTemplate {
    pub fn name(self) -> &'static str {
        match self {
            ProjectTemplate::React => "react",
            ProjectTemplate::Node => "node",
            ProjectTemplate::Python => "python",
        }
    }

    fn files(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ProjectTemplate::React => &[
                ("package.json", r#"{"name": "react-app", "version": "1.0.0"}"#),
                (
                    "src/App.js",
                    "import React from \"react\";\n\nfunction App() {\n  return <div>Hello, React!</div>;\n}\n\nexport default App;",
                ),
            ],
            ProjectTemplate::Node => &[
                ("package.json", r#"{"name": "node-app", "version": "1.0.0"}"#),
                ("index.js", "console.log(\"Hello, Node.js!\");"),
            ],
            ProjectTemplate::Python => &[
                ("main.py", "print(\"Hello, Python!\")"),
                ("requirements.txt", ""),
            ],
        }
    }
}

impl FromStr for ProjectTemplate {
    type Err = SandboxError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "react" => Ok(ProjectTemplate::React),
            "node" => Ok(ProjectTemplate::Node),
            "python" => Ok(ProjectTemplate::Python),
            other => Err(SandboxError::InvalidOperation(format!(
                "unknown project template: {other}"
            ))),
        }
    }
}

impl SandboxFs {
    /// Creates `<template>_project` under `parent` and seeds it. Returns the
    /// project's relative path.
    pub async fn create_project(
        &self,
        parent: &str,
        template: ProjectTemplate,
    ) -> Result<RelativePath> {
        let parent_dir = self.resolve_blocking(parent).await?;
        let project = self
            .relative(&parent_dir)?
            .join(&format!("{}_project", template.name()));
        self.create_folder(project.as_str()).await?;
        for (file, content) in template.files() {
            let path = project.join(file);
            self.create_file(path.as_str(), content).await?;
        }
        info!(template = template.name(), project = %project, "project created");
        Ok(project)
    }
}
