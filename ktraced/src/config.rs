use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::types::TraceKind;

const DEFAULT_CONFIG_PATH: &str = "/etc/ktrace/ktrace.toml";
const ENV_CONFIG_PATH: &str = "KTRACE_CONFIG";

/// Static catalog entry describing one kernel trace tag.
#[derive(Debug, Deserialize, Clone)]
pub struct TraceTag {
    #[serde(default)]
    pub description: String,
    /// Bit inside the 64-bit enable mask.
    pub bit: u64,
    #[serde(default)]
    pub kind: TagKind,
    /// tracefs-relative nodes written with 1/0 to toggle the tag.
    #[serde(default)]
    pub enable_paths: Vec<String>,
    /// tracefs-relative `format` descriptor files for the tag's events.
    #[serde(default)]
    pub format_paths: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    User,
    #[default]
    Kernel,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ageing: AgeingTable,
    /// Tag catalog, name -> descriptor.
    #[serde(default)]
    pub tags: BTreeMap<String, TraceTag>,
    /// Tag groups, name -> member tag names.
    #[serde(default)]
    pub tag_groups: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `KTRACE_CONFIG` environment variable. If the file is missing or
    /// fails to parse, built-in defaults are returned; the engine never
    /// refuses to start over a bad config.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!(
                        "[config] {} is malformed ({err}); using built-in defaults",
                        path.display()
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        if config.tags.is_empty() {
            config.tags = builtin_tags();
        }
        if config.tag_groups.is_empty() {
            config.tag_groups = builtin_tag_groups();
        }
        config
    }

    pub fn ageing_param(&self, kind: TraceKind) -> &AgeingParam {
        match kind {
            TraceKind::Snapshot => &self.ageing.snapshot,
            TraceKind::Recording => &self.ageing.recording,
            TraceKind::Cache => &self.ageing.cache,
        }
    }

    /// Union of flag bits for the named groups; `None` when a group is
    /// unknown.
    pub fn group_tag_bits(&self, groups: &[String]) -> Option<u64> {
        let mut bits = 0u64;
        for group in groups {
            let members = self.tag_groups.get(group)?;
            for name in members {
                bits |= self.tags.get(name).map(|t| 1u64 << t.bit)?;
            }
        }
        Some(bits)
    }

    /// Union of flag bits for the named tags; `None` when a tag is unknown.
    pub fn tag_bits(&self, names: &[String]) -> Option<u64> {
        let mut bits = 0u64;
        for name in names {
            bits |= self.tags.get(name).map(|t| 1u64 << t.bit)?;
        }
        Some(bits)
    }

    /// Names of the catalog tags selected by an enable mask.
    pub fn tags_for_bits(&self, bits: u64) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, tag)| bits & (1u64 << tag.bit) != 0)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Directory holding trace output files and the dump FIFOs.
    #[serde(default = "default_trace_dir")]
    pub trace_dir: PathBuf,
    /// Hardware-module kernels accept larger ring buffers.
    #[serde(default)]
    pub hardware_module_kernel: bool,
    /// Root builds may disable ageing entirely (see [ageing] overrides).
    #[serde(default)]
    pub root_mode: bool,
    /// Format descriptors always appended to the event dictionary.
    #[serde(default = "default_base_format_paths")]
    pub base_format_paths: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_dir: default_trace_dir(),
            hardware_module_kernel: false,
            root_mode: false,
            base_format_paths: default_base_format_paths(),
        }
    }
}

fn default_trace_dir() -> PathBuf {
    PathBuf::from("/var/log/ktrace")
}

fn default_base_format_paths() -> Vec<String> {
    vec![
        "events/header_page".to_string(),
        "events/ftrace/print/format".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotConfig {
    /// Kernel ring-buffer size applied on open, KiB.
    #[serde(default = "default_snapshot_buffer_kb")]
    pub buffer_size_kb: u64,
    /// Per-file cap for snapshot dumps, KiB.
    #[serde(default = "default_snapshot_file_size_kb")]
    pub file_size_kb: u64,
    #[serde(default = "default_true")]
    pub file_ageing: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            buffer_size_kb: default_snapshot_buffer_kb(),
            file_size_kb: default_snapshot_file_size_kb(),
            file_ageing: default_true(),
        }
    }
}

fn default_snapshot_buffer_kb() -> u64 {
    147_456 // 144 MiB
}

fn default_snapshot_file_size_kb() -> u64 {
    102_400 // 100 MiB
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    /// Per-file cap for recording mode, KiB.
    #[serde(default = "default_recording_file_size_kb")]
    pub file_size_kb: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            file_size_kb: default_recording_file_size_kb(),
        }
    }
}

fn default_recording_file_size_kb() -> u64 {
    102_400 // 100 MiB
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Total size of retained cache files, MiB.
    #[serde(default = "default_cache_total_mb")]
    pub total_file_size_mb: u64,
    /// Seconds of trace per cache file.
    #[serde(default = "default_cache_slice_s")]
    pub slice_duration_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_file_size_mb: default_cache_total_mb(),
            slice_duration_s: default_cache_slice_s(),
        }
    }
}

fn default_cache_total_mb() -> u64 {
    800
}

fn default_cache_slice_s() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgeingTable {
    #[serde(default = "default_snapshot_ageing")]
    pub snapshot: AgeingParam,
    #[serde(default = "default_recording_ageing")]
    pub recording: AgeingParam,
    #[serde(default = "default_cache_ageing")]
    pub cache: AgeingParam,
}

impl Default for AgeingTable {
    fn default() -> Self {
        Self {
            snapshot: default_snapshot_ageing(),
            recording: default_recording_ageing(),
            cache: default_cache_ageing(),
        }
    }
}

/// Retention policy for one trace kind. When both caps are set the size
/// cap wins; a zero cap disables that checker.
#[derive(Debug, Deserialize, Clone)]
pub struct AgeingParam {
    #[serde(default)]
    pub max_file_count: u64,
    #[serde(default)]
    pub max_total_size_kb: u64,
    /// Keep ageing active on root builds.
    #[serde(default = "default_true")]
    pub root_enable: bool,
}

impl Default for AgeingParam {
    fn default() -> Self {
        Self {
            max_file_count: 0,
            max_total_size_kb: 0,
            root_enable: true,
        }
    }
}

fn default_snapshot_ageing() -> AgeingParam {
    AgeingParam {
        max_file_count: 20,
        max_total_size_kb: 0,
        root_enable: true,
    }
}

fn default_recording_ageing() -> AgeingParam {
    AgeingParam {
        max_file_count: 15,
        max_total_size_kb: 0,
        root_enable: true,
    }
}

fn default_cache_ageing() -> AgeingParam {
    AgeingParam {
        max_file_count: 0,
        max_total_size_kb: 800 * 1024,
        root_enable: true,
    }
}

/// Built-in catalog used when no config file provides one. Mirrors the
/// common kernel tag set so a bare install can still capture scheduling
/// and memory activity.
fn builtin_tags() -> BTreeMap<String, TraceTag> {
    let mut tags = BTreeMap::new();
    tags.insert(
        "sched".to_string(),
        TraceTag {
            description: "CPU Scheduling".to_string(),
            bit: 0,
            kind: TagKind::Kernel,
            enable_paths: vec![
                "events/sched/sched_switch/enable".to_string(),
                "events/sched/sched_wakeup/enable".to_string(),
                "events/sched/sched_waking/enable".to_string(),
            ],
            format_paths: vec![
                "events/sched/sched_switch/format".to_string(),
                "events/sched/sched_wakeup/format".to_string(),
                "events/sched/sched_waking/format".to_string(),
            ],
        },
    );
    tags.insert(
        "freq".to_string(),
        TraceTag {
            description: "CPU Frequency".to_string(),
            bit: 1,
            kind: TagKind::Kernel,
            enable_paths: vec![
                "events/power/cpu_frequency/enable".to_string(),
                "events/power/clock_set_rate/enable".to_string(),
            ],
            format_paths: vec!["events/power/cpu_frequency/format".to_string()],
        },
    );
    tags.insert(
        "irq".to_string(),
        TraceTag {
            description: "IRQ Events".to_string(),
            bit: 2,
            kind: TagKind::Kernel,
            enable_paths: vec!["events/irq/enable".to_string()],
            format_paths: vec![
                "events/irq/irq_handler_entry/format".to_string(),
                "events/irq/irq_handler_exit/format".to_string(),
            ],
        },
    );
    tags.insert(
        "mem".to_string(),
        TraceTag {
            description: "Memory".to_string(),
            bit: 3,
            kind: TagKind::Kernel,
            enable_paths: vec!["events/kmem/enable".to_string()],
            format_paths: vec!["events/kmem/mm_page_alloc/format".to_string()],
        },
    );
    tags.insert(
        "app".to_string(),
        TraceTag {
            description: "App trace markers".to_string(),
            bit: 4,
            kind: TagKind::User,
            enable_paths: vec![],
            format_paths: vec![],
        },
    );
    tags
}

fn builtin_tag_groups() -> BTreeMap<String, Vec<String>> {
    let mut groups = BTreeMap::new();
    groups.insert(
        "default".to_string(),
        vec!["sched".to_string(), "freq".to_string(), "app".to_string()],
    );
    groups.insert(
        "scene_performance".to_string(),
        vec![
            "sched".to_string(),
            "freq".to_string(),
            "irq".to_string(),
            "mem".to_string(),
        ],
    );
    groups
}
