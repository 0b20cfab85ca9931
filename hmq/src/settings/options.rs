/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Alternative configuration file.
    pub cfg_name: Option<String>,
    /// Node id override.
    pub node_id: Option<u64>,
    /// Durable-queue directory override.
    pub storage_dir: Option<String>,
}
