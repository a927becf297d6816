//! Shared fixtures: stub shell scripts standing in for the external tools.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bkpipe::config::{AppConfig, DestinationsConfig, ToolsConfig};
use bkpipe::context::RunContext;
use bkpipe::core::escalation::ScriptedPrompt;
use bkpipe::core::{Epoch, Tool, Toolbox};

pub const EPOCH: i64 = 1_700_000_000;

/// Copies `-in` to `-out`, like an identity cipher.
pub const FAKE_OPENSSL: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in
    -in) in="$2"; shift;;
    -out) out="$2"; shift;;
  esac
  shift
done
cp "$in" "$out""#;

/// Write an executable `/bin/sh` script and return its path.
pub fn stub_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

/// Stub tool set: tar emits a fixed stream, the compressor passes it
/// through, openssl copies its input. No transfer tools.
pub fn stub_tools(bin: &Path) -> ToolsConfig {
    ToolsConfig {
        tar: stub_tool(bin, "tar", "printf 'tar-stream\\n'"),
        compressor: Some(stub_tool(bin, "xz", "exec cat")),
        openssl: stub_tool(bin, "openssl", FAKE_OPENSSL),
        shred: stub_tool(bin, "shred", "exit 0"),
        ..Default::default()
    }
}

pub fn base_config(source: &Path, temp: &Path, local: Vec<PathBuf>, tools: ToolsConfig) -> AppConfig {
    AppConfig {
        sources: vec![source.to_path_buf()],
        temp_dir: temp.to_path_buf(),
        non_interactive: true,
        tools,
        destinations: DestinationsConfig {
            local,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn context(config: AppConfig, available: &[Tool]) -> RunContext {
    let tools = Toolbox::with_available(&config.tools, config.compressor, available.iter().copied());
    RunContext::new(
        config,
        Epoch::from_secs(EPOCH),
        tools,
        Arc::new(ScriptedPrompt::default()),
    )
}

pub const PIPELINE: [Tool; 4] = [Tool::Tar, Tool::Compressor, Tool::Openssl, Tool::Shred];

pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
