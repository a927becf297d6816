//! Availability of the external programs a run depends on.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::config::{Compressor, ToolsConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Tar,
    Compressor,
    Openssl,
    Par2,
    Rsync,
    Ssh,
    Scp,
    Rclone,
    Shred,
}

impl Tool {
    pub const ALL: [Tool; 9] = [
        Self::Tar,
        Self::Compressor,
        Self::Openssl,
        Self::Par2,
        Self::Rsync,
        Self::Ssh,
        Self::Scp,
        Self::Rclone,
        Self::Shred,
    ];
}

/// Program names resolved from config, plus which of them were found.
///
/// Probed once per run before any destination is touched.
#[derive(Debug, Clone)]
pub struct Toolbox {
    programs: ToolsConfig,
    compressor: Compressor,
    available: HashSet<Tool>,
}

impl Toolbox {
    /// Look up every configured program on disk or in `PATH`.
    pub fn probe(programs: &ToolsConfig, compressor: Compressor) -> Self {
        let mut toolbox = Self::with_available(programs, compressor, []);
        for tool in Tool::ALL {
            let program = toolbox.program(tool);
            let found = is_executable_program(program);
            debug!(?tool, program, found, "Probed tool");
            if found {
                toolbox.available.insert(tool);
            }
        }
        toolbox
    }

    /// Build a toolbox with an explicit availability set, skipping the probe.
    pub fn with_available(
        programs: &ToolsConfig,
        compressor: Compressor,
        available: impl IntoIterator<Item = Tool>,
    ) -> Self {
        Self {
            programs: programs.clone(),
            compressor,
            available: available.into_iter().collect(),
        }
    }

    pub fn has(&self, tool: Tool) -> bool {
        self.available.contains(&tool)
    }

    pub fn program(&self, tool: Tool) -> &str {
        match tool {
            Tool::Tar => &self.programs.tar,
            Tool::Compressor => self
                .programs
                .compressor
                .as_deref()
                .unwrap_or(self.compressor.program()),
            Tool::Openssl => &self.programs.openssl,
            Tool::Par2 => &self.programs.par2,
            Tool::Rsync => &self.programs.rsync,
            Tool::Ssh => &self.programs.ssh,
            Tool::Scp => &self.programs.scp,
            Tool::Rclone => &self.programs.rclone,
            Tool::Shred => &self.programs.shred,
        }
    }

    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    pub fn missing(&self) -> Vec<Tool> {
        Tool::ALL.into_iter().filter(|t| !self.has(*t)).collect()
    }
}

/// Resolve `program` the way a shell would: paths are checked directly,
/// bare names are searched in `PATH`.
pub fn is_executable_program(program: &str) -> bool {
    if program.contains('/') {
        return is_executable_file(Path::new(program));
    }

    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };

    std::env::split_paths(&path_var).any(|dir| is_executable_file(&dir.join(program)))
}

fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, Permissions};
    use tempfile::tempdir;

    #[test]
    fn explicit_path_must_be_executable() {
        let temp = tempdir().unwrap();
        let script = temp.path().join("tool");
        fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();

        fs::set_permissions(&script, Permissions::from_mode(0o644)).unwrap();
        assert!(!is_executable_program(script.to_str().unwrap()));

        fs::set_permissions(&script, Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable_program(script.to_str().unwrap()));
    }

    #[test]
    fn bare_names_are_searched_in_path() {
        assert!(is_executable_program("sh"));
        assert!(!is_executable_program("definitely-not-a-real-tool-7f3a"));
    }

    #[test]
    fn compressor_program_follows_selector_unless_overridden() {
        let mut programs = ToolsConfig::default();
        let toolbox = Toolbox::with_available(&programs, Compressor::Zstd, []);
        assert_eq!(toolbox.program(Tool::Compressor), "zstd");

        programs.compressor = Some("/opt/bin/pzstd".to_string());
        let toolbox = Toolbox::with_available(&programs, Compressor::Zstd, []);
        assert_eq!(toolbox.program(Tool::Compressor), "/opt/bin/pzstd");
    }

    #[test]
    fn probe_marks_missing_programs() {
        let programs = ToolsConfig {
            rclone: "definitely-not-a-real-tool-7f3a".to_string(),
            shred: "sh".to_string(),
            ..Default::default()
        };
        let toolbox = Toolbox::probe(&programs, Compressor::Xz);
        assert!(!toolbox.has(Tool::Rclone));
        assert!(toolbox.has(Tool::Shred));
        assert!(toolbox.missing().contains(&Tool::Rclone));
    }
}
