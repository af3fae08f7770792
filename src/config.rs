// Configuration management for the path tracer
// Supports CLI arguments, config file (TOML), and environment variables

use crate::decoder::SiteCommunityDecoder;
use crate::domain::BoundaryBlock;
use crate::routes::Protocol;
use crate::routes::lookup::ProtocolTieBreak;
use crate::snapshot::SnapshotSettings;
use crate::walker::WalkSettings;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Network Path Tracer - reconstruct forwarding paths from collected routing state
#[derive(Parser, Debug, Clone)]
#[command(name = "path-tracer")]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", env = "NPT_LOG_LEVEL")]
    pub log_level: String,

    /// Path to configuration file
    #[arg(short, long, env = "NPT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding one JSON snapshot document per device
    #[arg(long, env = "NPT_SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Inventory file (TOML)
    #[arg(long, env = "NPT_INVENTORY")]
    pub inventory: Option<PathBuf>,

    /// Maximum hops per path
    #[arg(long, env = "NPT_MAX_DEPTH")]
    pub max_depth: Option<usize>,

    /// Maximum siblings per ECMP fork
    #[arg(long, env = "NPT_MAX_ECMP_BRANCHES")]
    pub max_ecmp_branches: Option<usize>,

    /// Destination prefix to trace
    #[arg(short, long)]
    pub prefix: Option<String>,

    /// Device to start tracing from
    #[arg(short, long)]
    pub start: Option<String>,

    /// VRF to start in (default table if omitted)
    #[arg(long)]
    pub vrf: Option<String>,

    /// Devices to treat as failed, comma separated
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Source prefix for the reverse direction
    #[arg(long, requires = "reverse_start")]
    pub reverse_prefix: Option<String>,

    /// Device the reverse trace starts from
    #[arg(long, requires = "reverse_prefix")]
    pub reverse_start: Option<String>,

    /// Report the origin classification instead of the full path set
    #[arg(long)]
    pub origin: bool,

    /// Reload the snapshot every N seconds and re-run the request on each new generation
    #[arg(long, env = "NPT_WATCH")]
    pub watch: Option<u64>,
}

/// Configuration file structure (TOML format)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    /// Snapshot source settings
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Walker limits and tie-break policy
    #[serde(default)]
    pub walker: WalkerConfig,

    /// Community decoder settings
    #[serde(default)]
    pub decoder: DecoderConfig,

    /// Address blocks that identify uninventoried boundary devices
    #[serde(default)]
    pub boundary_blocks: Vec<BoundaryBlock>,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_inventory")]
    pub inventory: PathBuf,

    /// Age after which a device's data is reported as stale
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Background reload period; disabled when absent
    #[serde(default)]
    pub reload_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreakMode {
    #[default]
    EqualCost,
    Prefer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkerConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_max_ecmp_branches")]
    pub max_ecmp_branches: usize,

    /// How entries that differ only by protocol are treated
    #[serde(default)]
    pub protocol_tie_break: TieBreakMode,

    /// Preference order for `prefer`, best first
    #[serde(default)]
    pub protocol_order: Vec<Protocol>,

    /// Follow only a device's active entries when it has any
    #[serde(default)]
    pub prefer_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Community value marking the site that originated a prefix
    #[serde(default = "default_oid_marker")]
    pub oid_marker: u32,

    /// Community value marking the site advertising a prefix
    #[serde(default = "default_aid_marker")]
    pub aid_marker: u32,

    /// Region name to the site numbers in it
    #[serde(default = "default_site_regions")]
    pub site_regions: BTreeMap<String, Vec<u32>>,

    /// Region name to per-site failover orders; each chain starts with the deciding site
    #[serde(default = "default_failover_chains")]
    pub failover_chains: BTreeMap<String, Vec<Vec<u32>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}
fn default_inventory() -> PathBuf {
    PathBuf::from("inventory.toml")
}
fn default_stale_after() -> u64 {
    3600
}
fn default_max_depth() -> usize {
    30
}
fn default_max_ecmp_branches() -> usize {
    8
}
fn default_oid_marker() -> u32 {
    1594
}
fn default_aid_marker() -> u32 {
    194
}
fn default_site_regions() -> BTreeMap<String, Vec<u32>> {
    BTreeMap::from([
        ("americas".to_string(), vec![1, 2, 3, 4]),
        ("emea".to_string(), vec![7, 8]),
        ("apac".to_string(), vec![17, 18, 19]),
    ])
}
fn default_failover_chains() -> BTreeMap<String, Vec<Vec<u32>>> {
    SiteCommunityDecoder::default().failover_chains
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            dir: default_snapshot_dir(),
            inventory: default_inventory(),
            stale_after_secs: default_stale_after(),
            reload_secs: None,
        }
    }
}

impl Default for WalkerConfig {
    fn default() -> Self {
        WalkerConfig {
            max_depth: default_max_depth(),
            max_ecmp_branches: default_max_ecmp_branches(),
            protocol_tie_break: TieBreakMode::default(),
            protocol_order: Vec::new(),
            prefer_active: false,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            oid_marker: default_oid_marker(),
            aid_marker: default_aid_marker(),
            site_regions: default_site_regions(),
            failover_chains: default_failover_chains(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

/// What the binary was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestArgs {
    pub prefix: Option<String>,
    pub start: Option<String>,
    pub vrf: Option<String>,
    pub exclude: Vec<String>,
    pub reverse_prefix: Option<String>,
    pub reverse_start: Option<String>,
    pub origin: bool,
}

/// Merged configuration from all sources
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: Level,
    pub snapshot_dir: PathBuf,
    pub inventory_path: PathBuf,
    pub stale_after: chrono::Duration,
    pub reload_interval: Option<Duration>,
    pub walk: WalkSettings,
    pub site_decoder: SiteCommunityDecoder,
    pub boundary_blocks: Vec<BoundaryBlock>,
    pub request: RequestArgs,
}

impl Config {
    /// Load configuration from all sources (CLI args, config file, defaults)
    /// Priority: CLI args > Environment variables > Config file > Defaults
    pub fn load() -> anyhow::Result<Self> {
        let cli_args = CliArgs::parse();

        // Load config file if specified
        let config_file = if let Some(config_path) = &cli_args.config {
            tracing::info!("Loading configuration from: {}", config_path.display());
            let config_content = std::fs::read_to_string(config_path)?;
            toml::from_str::<ConfigFile>(&config_content)?
        } else {
            // Try loading from default locations
            let default_paths = vec![PathBuf::from("path-tracer.toml"), PathBuf::from("config.toml")];

            let mut loaded_config = None;
            for path in default_paths {
                if path.exists() {
                    tracing::info!("Loading configuration from: {}", path.display());
                    let config_content = std::fs::read_to_string(&path)?;
                    loaded_config = Some(toml::from_str::<ConfigFile>(&config_content)?);
                    break;
                }
            }

            loaded_config.unwrap_or_default()
        };

        Self::merge(cli_args, config_file)
    }

    /// Merge parsed CLI args over a config file.
    pub fn merge(cli_args: CliArgs, config_file: ConfigFile) -> anyhow::Result<Self> {
        // The CLI default is "info", so only a non-default CLI level overrides the file
        let level = if cli_args.log_level.eq_ignore_ascii_case("info") {
            config_file.logging.level.as_str()
        } else {
            cli_args.log_level.as_str()
        };
        let log_level = parse_log_level(level)?;

        let walker = &config_file.walker;
        let tie_break = match walker.protocol_tie_break {
            TieBreakMode::EqualCost => ProtocolTieBreak::EqualCost,
            TieBreakMode::Prefer if walker.protocol_order.is_empty() => {
                return Err(anyhow::anyhow!(
                    "protocol_tie_break = \"prefer\" needs a non-empty protocol_order"
                ));
            }
            TieBreakMode::Prefer => ProtocolTieBreak::Prefer {
                order: walker.protocol_order.clone(),
            },
        };
        let walk = WalkSettings {
            max_depth: cli_args.max_depth.unwrap_or(walker.max_depth),
            max_ecmp_branches: cli_args.max_ecmp_branches.unwrap_or(walker.max_ecmp_branches),
            tie_break,
            prefer_active: walker.prefer_active,
        };
        if walk.max_depth == 0 || walk.max_ecmp_branches == 0 {
            return Err(anyhow::anyhow!("max_depth and max_ecmp_branches must be at least 1"));
        }

        let site_regions = config_file
            .decoder
            .site_regions
            .iter()
            .flat_map(|(region, sites)| sites.iter().map(move |site| (*site, region.clone())))
            .collect();
        let site_decoder = SiteCommunityDecoder {
            oid_marker: config_file.decoder.oid_marker,
            aid_marker: config_file.decoder.aid_marker,
            site_regions,
            failover_chains: config_file.decoder.failover_chains.clone(),
        };

        let stale_after = i64::try_from(config_file.snapshot.stale_after_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "stale_after_secs = {} is out of range",
                    config_file.snapshot.stale_after_secs
                )
            })?;
        let reload_interval = cli_args
            .watch
            .or(config_file.snapshot.reload_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Config {
            log_level,
            snapshot_dir: cli_args.snapshot_dir.unwrap_or(config_file.snapshot.dir),
            inventory_path: cli_args.inventory.unwrap_or(config_file.snapshot.inventory),
            stale_after,
            reload_interval,
            walk,
            site_decoder,
            boundary_blocks: config_file.boundary_blocks,
            request: RequestArgs {
                prefix: cli_args.prefix,
                start: cli_args.start,
                vrf: cli_args.vrf,
                exclude: cli_args.exclude,
                reverse_prefix: cli_args.reverse_prefix,
                reverse_start: cli_args.reverse_start,
                origin: cli_args.origin,
            },
        })
    }

    pub fn snapshot_settings(&self) -> SnapshotSettings {
        SnapshotSettings {
            stale_after: self.stale_after,
            boundary_blocks: self.boundary_blocks.clone(),
        }
    }
}

fn parse_log_level(level_str: &str) -> anyhow::Result<Level> {
    match level_str.to_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "trace" => Ok(Level::TRACE),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level_str)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("path-tracer").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();
        assert_eq!(config.walker.max_depth, 30);
        assert_eq!(config.walker.max_ecmp_branches, 8);
        assert_eq!(config.snapshot.stale_after_secs, 3600);
        assert_eq!(config.decoder.oid_marker, 1594);
        assert_eq!(config.decoder.aid_marker, 194);
    }

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_config_file_sections() {
        let file: ConfigFile = toml::from_str(
            r#"
[snapshot]
dir = "/var/lib/npt/snapshots"
stale_after_secs = 600

[walker]
max_depth = 12
protocol_tie_break = "prefer"
protocol_order = ["static", "ebgp"]

[decoder]
site_regions = { americas = [1, 2], emea = [7] }

[[boundary_blocks]]
block = "100.123.0.0/16"
domain = "fw-t2"
role = "t2-fw"
region = "emea"

[logging]
level = "debug"
"#,
        )
        .unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();

        assert_eq!(config.snapshot_dir, PathBuf::from("/var/lib/npt/snapshots"));
        assert_eq!(config.inventory_path, PathBuf::from("inventory.toml"));
        assert_eq!(config.stale_after, chrono::Duration::seconds(600));
        assert_eq!(config.walk.max_depth, 12);
        assert_eq!(
            config.walk.tie_break,
            ProtocolTieBreak::Prefer {
                order: vec![Protocol::Static, Protocol::Ebgp]
            }
        );
        assert_eq!(config.site_decoder.site_regions[&7], "emea");
        assert_eq!(config.boundary_blocks[0].slot_len, 29);
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    fn test_cli_overrides_file() {
        let args = cli(&[
            "--max-depth",
            "5",
            "--snapshot-dir",
            "/tmp/snaps",
            "--prefix",
            "8.8.8.0/24",
            "--start",
            "rr1",
            "--exclude",
            "agg-1,agg-2",
            "--watch",
            "60",
        ]);
        let config = Config::merge(args, ConfigFile::default()).unwrap();

        assert_eq!(config.walk.max_depth, 5);
        assert_eq!(config.snapshot_dir, PathBuf::from("/tmp/snaps"));
        assert_eq!(config.request.prefix.as_deref(), Some("8.8.8.0/24"));
        assert_eq!(config.request.exclude, vec!["agg-1".to_string(), "agg-2".to_string()]);
        assert_eq!(config.reload_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_out_of_range_staleness_is_rejected() {
        let file: ConfigFile = toml::from_str("[snapshot]\nstale_after_secs = 9223372036854776\n").unwrap();
        assert!(Config::merge(cli(&[]), file).is_err());
    }

    #[test]
    fn test_walker_and_decoder_extras() {
        let file: ConfigFile = toml::from_str(
            r#"
[walker]
prefer_active = true

[decoder]
failover_chains = { emea = [[8, 7], [7, 8]] }
"#,
        )
        .unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();
        assert!(config.walk.prefer_active);
        assert_eq!(config.site_decoder.failover_chains["emea"], vec![vec![8, 7], vec![7, 8]]);
        assert!(!config.site_decoder.failover_chains.contains_key("americas"));

        let defaults = Config::merge(cli(&[]), ConfigFile::default()).unwrap();
        assert!(!defaults.walk.prefer_active);
        assert_eq!(defaults.site_decoder.failover_chains["americas"][0], vec![1, 2, 3]);
    }

    #[test]
    fn test_prefer_needs_an_order() {
        let file: ConfigFile = toml::from_str("[walker]\nprotocol_tie_break = \"prefer\"\n").unwrap();
        assert!(Config::merge(cli(&[]), file).is_err());
    }
}
