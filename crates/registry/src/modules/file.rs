use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use command_tree::{codec, Command, CommandNode, DynValue};
use schema::{CalculateArgs, ModuleManager, StateQueryArgs};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Desired-state file sync: each configured entry names a remote path and a
/// local source; files whose size, mode or checksum differ get re-uploaded.
pub struct FileManager;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Remote file path; may be a template.
    pub remote_path: String,
    /// Local source file; may be a template.
    pub source: String,
    /// Octal mode override; the local file's mode is used when absent.
    #[serde(default)]
    pub permission: Option<String>,
    /// Compare content checksums, not just size and mode.
    #[serde(default = "default_true")]
    pub checksum: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileQuery {
    /// Path → whether a checksum is wanted.
    pub files: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileModuleState {
    pub files: BTreeMap<String, FileInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: u64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// True when the desired file differs from what the host reported.
pub fn needs_upload(desired: &FileInfo, remote: Option<&FileInfo>, use_checksum: bool) -> bool {
    let Some(remote) = remote else { return true };
    if desired.size != remote.size || desired.mode != remote.mode {
        return true;
    }
    if use_checksum {
        return desired.checksum != remote.checksum;
    }
    false
}

fn parse_permission(text: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(text, 8).with_context(|| format!("bad file mode {text:?}"))
}

fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ModuleManager for FileManager {
    fn name(&self) -> &'static str {
        "file"
    }

    fn parse_instance(&self, raw: &serde_json::Value) -> anyhow::Result<DynValue> {
        let config: FileConfig =
            serde_json::from_value(raw.clone()).context("bad file module configuration")?;
        Ok(DynValue::new(config))
    }

    fn requires_query(&self) -> bool {
        true
    }

    async fn state_query(&self, args: StateQueryArgs<'_>) -> anyhow::Result<Option<DynValue>> {
        if args.instances.is_empty() {
            return Ok(None);
        }
        let mut query = FileQuery::default();
        for instance in args.instances {
            let config = instance
                .downcast_ref::<FileConfig>()
                .context("unexpected file module instance type")?;
            let path = args
                .config
                .template_source
                .new_template("file.remote_path", &config.remote_path)?
                .render(args.scope)?;
            query.files.insert(path, config.checksum);
        }
        Ok(Some(DynValue::new(query)))
    }

    async fn get_state(&self, query: DynValue) -> anyhow::Result<DynValue> {
        let query = query
            .downcast_ref::<FileQuery>()
            .context("unexpected file state query type")?;
        let mut state = FileModuleState::default();
        for (path, want_checksum) in &query.files {
            let Ok(meta) = tokio::fs::metadata(path).await else {
                continue;
            };
            let mut info = FileInfo {
                size: meta.len(),
                mode: file_mode(&meta),
                checksum: None,
            };
            if *want_checksum {
                let content = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("could not read {path} for checksumming"))?;
                info.checksum = Some(sha256_hex(&content));
            }
            state.files.insert(path.clone(), info);
        }
        Ok(DynValue::new(state))
    }

    async fn calculate_commands(&self, args: CalculateArgs<'_>) -> anyhow::Result<()> {
        if args.instances.is_empty() {
            return Ok(());
        }
        let state = args
            .state
            .context("no file state was collected for this resource")?
            .downcast_ref::<FileModuleState>()
            .context("unexpected file module state type")?;

        for instance in args.instances {
            let config = instance
                .downcast_ref::<FileConfig>()
                .context("unexpected file module instance type")?;
            let remote_path = args
                .config
                .template_source
                .new_template("file.remote_path", &config.remote_path)?
                .render(args.scope)?;
            let source = args
                .config
                .template_source
                .new_template("file.source", &config.source)?
                .render(args.scope)?;

            let content = tokio::fs::read(&source)
                .await
                .with_context(|| format!("could not read local file {source}"))?;
            let meta = tokio::fs::metadata(&source).await?;
            let mode = match &config.permission {
                Some(permission) => parse_permission(permission)?,
                None => file_mode(&meta),
            };
            let desired = FileInfo {
                size: content.len() as u64,
                mode,
                checksum: config.checksum.then(|| sha256_hex(&content)),
            };

            if !needs_upload(&desired, state.files.get(&remote_path), config.checksum) {
                continue;
            }
            args.remote_commands.add(
                format!("Save {remote_path}"),
                WriteFileCommand::new(remote_path.clone(), content, mode),
            );
        }
        Ok(())
    }

    fn register_wire_types(&self) {
        codec::register_value::<FileQuery>("file_query");
        codec::register_value::<FileModuleState>("file_state");
        codec::register_node::<WriteFileCommand>("write_file");
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

/// Agent-side write: replace the file, create parent directories, set the
/// mode and verify it stuck.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WriteFileCommand {
    command: Command,
    pub path: String,
    #[serde(with = "content_encoding")]
    pub content: Vec<u8>,
    pub mode: u32,
}

impl WriteFileCommand {
    pub fn new(path: String, content: Vec<u8>, mode: u32) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            path,
            content,
            mode,
        })
    }
}

#[async_trait]
impl CommandNode for WriteFileCommand {
    async fn execute(self: Arc<Self>) {
        // replace instead of overwrite so the mode always ends up as requested
        let _ = tokio::fs::remove_file(&self.path).await;
        if let Some(parent) = Path::new(&self.path).parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                self.command.err(format!(
                    "could not create directory structure up to {}: {err}",
                    self.path
                ));
                return;
            }
        }
        if let Err(err) = tokio::fs::write(&self.path, &self.content).await {
            self.command.err(format!(
                "could not write {} bytes to {}: {err}",
                self.content.len(),
                self.path
            ));
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = tokio::fs::set_permissions(
                &self.path,
                std::fs::Permissions::from_mode(self.mode & 0o7777),
            )
            .await
            {
                self.command
                    .err(format!("could not set mode on {}: {err}", self.path));
                return;
            }
        }
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                let actual = file_mode(&meta);
                if actual != self.mode & 0o7777 {
                    self.command.err(format!(
                        "{} changed mode right after writing: {actual:o} instead of {:o}; the file will be re-uploaded on every deploy",
                        self.path, self.mode
                    ));
                }
            }
            Err(err) => {
                self.command
                    .err(format!("could not stat {} after writing: {err}", self.path));
            }
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

mod content_encoding {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_tree::CommandState;

    fn info(size: u64, mode: u32, checksum: Option<&str>) -> FileInfo {
        FileInfo {
            size,
            mode,
            checksum: checksum.map(str::to_string),
        }
    }

    #[test]
    fn matching_files_are_not_reuploaded() {
        let desired = info(10, 0o644, Some("abc"));
        assert!(!needs_upload(&desired, Some(&info(10, 0o644, Some("abc"))), true));
    }

    #[test]
    fn missing_or_differing_files_are_uploaded() {
        let desired = info(10, 0o644, Some("abc"));
        assert!(needs_upload(&desired, None, true));
        assert!(needs_upload(&desired, Some(&info(11, 0o644, Some("abc"))), true));
        assert!(needs_upload(&desired, Some(&info(10, 0o600, Some("abc"))), true));
        assert!(needs_upload(&desired, Some(&info(10, 0o644, Some("xyz"))), true));
    }

    #[test]
    fn checksum_can_be_opted_out() {
        let desired = info(10, 0o644, None);
        assert!(!needs_upload(&desired, Some(&info(10, 0o644, Some("whatever"))), false));
    }

    #[test]
    fn permission_parsing_is_octal() {
        assert_eq!(parse_permission("644").expect("mode"), 0o644);
        assert_eq!(parse_permission("0755").expect("mode"), 0o755);
        assert!(parse_permission("rw-").is_err());
    }

    #[tokio::test]
    async fn get_state_reports_size_mode_and_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("motd");
        std::fs::write(&path, b"welcome").expect("write");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).expect("chmod");
        }

        let mut query = FileQuery::default();
        query.files.insert(path.display().to_string(), true);
        query.files.insert("/does/not/exist".to_string(), true);

        let state = FileManager
            .get_state(DynValue::new(query))
            .await
            .expect("state");
        let state = state.downcast_ref::<FileModuleState>().expect("type");
        assert_eq!(state.files.len(), 1, "missing files are omitted");
        let entry = state.files.get(&path.display().to_string()).expect("entry");
        assert_eq!(entry.size, 7);
        #[cfg(unix)]
        assert_eq!(entry.mode, 0o640);
        assert_eq!(entry.checksum.as_deref(), Some(sha256_hex(b"welcome").as_str()));
    }

    #[tokio::test]
    async fn write_command_sets_content_and_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/dir/target.conf");
        let node = WriteFileCommand::new(path.display().to_string(), b"payload".to_vec(), 0o640);
        node.clone().execute().await;
        assert!(!node.as_command().any_error(), "{:?}", node.as_command().entries());
        assert_eq!(node.as_command().state(), CommandState::Ready);
        assert_eq!(std::fs::read(&path).expect("read"), b"payload");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("stat").permissions().mode() & 0o7777;
            assert_eq!(mode, 0o640);
        }
    }

    #[test]
    fn write_command_survives_the_wire() {
        codec::register_node::<WriteFileCommand>("write_file");
        let node = WriteFileCommand::new("/etc/motd".to_string(), vec![1, 2, 3, 250], 0o600);
        let encoded = codec::encode_node(node.as_ref()).expect("encode");
        let decoded = codec::decode_node(encoded).expect("decode");
        let decoded = decoded
            .as_any()
            .downcast_ref::<WriteFileCommand>()
            .expect("type");
        assert_eq!(decoded.path, "/etc/motd");
        assert_eq!(decoded.content, vec![1, 2, 3, 250]);
        assert_eq!(decoded.mode, 0o600);
    }
}
