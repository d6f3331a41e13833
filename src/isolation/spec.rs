use serde::{Deserialize, Serialize};

/// Requested sandbox for a task.
///
/// Immutable once a task begins. Structural equality is what the standby
/// slot compares against an incoming request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationSpec {
    #[default]
    None,
    Container(ContainerSpec),
    Parallels(ParallelsSpec),
    Tart(TartSpec),
    Vetu(VetuSpec),
}

impl IsolationSpec {
    /// Short family name used in logs and error messages.
    pub fn family(&self) -> &'static str {
        match self {
            IsolationSpec::None => "none",
            IsolationSpec::Container(_) => "container",
            IsolationSpec::Parallels(_) => "parallels",
            IsolationSpec::Tart(_) => "tart",
            IsolationSpec::Vetu(_) => "vetu",
        }
    }

    /// Image (or source VM) requested, if the family has one.
    pub fn image(&self) -> Option<&str> {
        match self {
            IsolationSpec::None => None,
            IsolationSpec::Container(spec) => Some(&spec.image),
            IsolationSpec::Parallels(spec) => Some(&spec.image),
            IsolationSpec::Tart(spec) => Some(&spec.image),
            IsolationSpec::Vetu(spec) => Some(&spec.image),
        }
    }

    /// Volumes requested, for families that support mounts.
    pub fn volumes(&self) -> &[Volume] {
        match self {
            IsolationSpec::Container(spec) => &spec.volumes,
            IsolationSpec::Tart(spec) => &spec.volumes,
            _ => &[],
        }
    }
}

impl std::fmt::Display for IsolationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.image() {
            Some(image) => write!(f, "{}({})", self.family(), image),
            None => write!(f, "{}", self.family()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub image: String,
    /// Number of CPUs, fractional values allowed
    pub cpu: f32,
    /// Memory limit in megabytes, 0 for no limit
    pub memory: u32,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Darwin,
    Linux,
}

impl Platform {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "darwin" | "macos" => Some(Platform::Darwin),
            "linux" => Some(Platform::Linux),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelsSpec {
    pub image: String,
    pub user: String,
    pub password: String,
    pub platform: Platform,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TartSpec {
    pub image: String,
    pub user: String,
    pub password: String,
    /// SSH port inside the guest, 0 means 22
    pub port: u16,
    pub cpu: u32,
    /// Memory in megabytes, 0 keeps the image default
    pub memory: u32,
    pub softnet: bool,
    pub volumes: Vec<Volume>,
    pub display: String,
    /// Disk size in gigabytes, 0 keeps the image default
    pub disk_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetuNetworking {
    #[default]
    Default,
    Bridged {
        interface: String,
    },
    Host,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VetuSpec {
    pub image: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub cpu: u32,
    pub memory: u32,
    pub networking: VetuNetworking,
    pub disk_size: u32,
}
