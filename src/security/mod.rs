//! Security policy gating which isolations a task may request.
//!
//! One [`Security`] object is loaded at startup and read-only afterwards.
//! Each isolation family carries an optional policy:
//!
//! - `None` policy: the family is disabled entirely
//! - policy with empty allow-lists: the family is enabled without restriction
//! - policy with populated allow-lists: requests must match an entry
//!
//! Image and volume entries are shell-style wildcards (`*`, `?`, `[...]`)
//! where `*` never crosses a path separator.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::isolation::{IsolationSpec, Platform, Volume};

/// Host CPU architecture Parallels isolation is supported on.
const PARALLELS_HOST_ARCH: &str = "x86_64";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("{0} isolation is not allowed by this worker's security settings")]
    FamilyDisabled(&'static str),

    #[error("image {image:?} is not in the list of allowed images for {family} isolation")]
    ImageNotAllowed { family: &'static str, image: String },

    #[error("volume {path:?} is not in the list of allowed volumes")]
    VolumeNotAllowed { path: String },

    #[error("volume {path:?} must be mounted read-only")]
    VolumeMustBeReadOnly { path: String },

    #[error("{family} isolation does not support {detail}")]
    UnsupportedPlatform { family: &'static str, detail: String },
}

/// Per-worker security settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    pub allowed_isolations: AllowedIsolations,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowedIsolations {
    pub none: Option<NonePolicy>,
    pub container: Option<ContainerPolicy>,
    pub parallels: Option<ImagePolicy>,
    pub tart: Option<TartPolicy>,
    pub vetu: Option<ImagePolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NonePolicy {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePolicy {
    pub allowed_images: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerPolicy {
    pub allowed_images: Vec<String>,
    pub allowed_volumes: Vec<AllowedVolume>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TartPolicy {
    pub allowed_images: Vec<String>,
    pub allowed_volumes: Vec<AllowedVolume>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowedVolume {
    pub source: String,
    #[serde(default)]
    pub force_read_only: bool,
}

impl Security {
    /// Every family enabled, no allow-lists. Used when no security
    /// section is configured.
    pub fn permissive() -> Self {
        Self {
            allowed_isolations: AllowedIsolations {
                none: Some(NonePolicy {}),
                container: Some(ContainerPolicy::default()),
                parallels: Some(ImagePolicy::default()),
                tart: Some(TartPolicy::default()),
                vetu: Some(ImagePolicy::default()),
            },
        }
    }

    /// Validate a requested isolation against the policy.
    ///
    /// Runs before any resource is allocated for the task.
    pub fn validate(&self, spec: &IsolationSpec) -> Result<(), SecurityError> {
        let policies = &self.allowed_isolations;
        match spec {
            IsolationSpec::None => policies
                .none
                .as_ref()
                .map(|_| ())
                .ok_or(SecurityError::FamilyDisabled("none")),
            IsolationSpec::Container(container) => {
                let policy = policies
                    .container
                    .as_ref()
                    .ok_or(SecurityError::FamilyDisabled("container"))?;
                check_image("container", &policy.allowed_images, &container.image)?;
                check_volumes(&policy.allowed_volumes, &container.volumes)
            }
            IsolationSpec::Parallels(parallels) => {
                let policy = policies
                    .parallels
                    .as_ref()
                    .ok_or(SecurityError::FamilyDisabled("parallels"))?;
                check_image("parallels", &policy.allowed_images, &parallels.image)?;
                check_parallels_platform(parallels.platform, std::env::consts::ARCH)
            }
            IsolationSpec::Tart(tart) => {
                let policy = policies
                    .tart
                    .as_ref()
                    .ok_or(SecurityError::FamilyDisabled("tart"))?;
                check_image("tart", &policy.allowed_images, &tart.image)?;
                check_volumes(&policy.allowed_volumes, &tart.volumes)
            }
            IsolationSpec::Vetu(vetu) => {
                let policy = policies
                    .vetu
                    .as_ref()
                    .ok_or(SecurityError::FamilyDisabled("vetu"))?;
                check_image("vetu", &policy.allowed_images, &vetu.image)
            }
        }
    }
}

/// Returns true if `image` is allowed by `allowed`, an empty list allowing
/// everything.
pub fn image_allowed(allowed: &[String], image: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|pattern| wildcard_match(pattern, image))
}

fn check_image(family: &'static str, allowed: &[String], image: &str) -> Result<(), SecurityError> {
    if image_allowed(allowed, image) {
        Ok(())
    } else {
        Err(SecurityError::ImageNotAllowed {
            family,
            image: image.to_string(),
        })
    }
}

/// Check every requested volume against the allowed-volume list.
///
/// An empty list allows any volume; a populated list denies any volume that
/// does not match an entry.
pub fn check_volumes(allowed: &[AllowedVolume], volumes: &[Volume]) -> Result<(), SecurityError> {
    if allowed.is_empty() {
        return Ok(());
    }

    for volume in volumes {
        let source = clean_path(&volume.source);
        let entry = allowed
            .iter()
            .find(|entry| wildcard_match(&clean_path(&entry.source), &source))
            .ok_or_else(|| SecurityError::VolumeNotAllowed {
                path: volume.source.clone(),
            })?;

        if entry.force_read_only && !volume.read_only {
            return Err(SecurityError::VolumeMustBeReadOnly {
                path: volume.source.clone(),
            });
        }
    }

    Ok(())
}

/// Parallels guests are limited to macOS and Linux, and only on Intel hosts.
pub fn check_parallels_platform(platform: Platform, host_arch: &str) -> Result<(), SecurityError> {
    if host_arch != PARALLELS_HOST_ARCH {
        return Err(SecurityError::UnsupportedPlatform {
            family: "parallels",
            detail: format!("{} hosts", host_arch),
        });
    }

    match platform {
        Platform::Darwin | Platform::Linux => Ok(()),
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(pattern) => pattern.matches_with(value, MATCH_OPTIONS),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Ignoring malformed wildcard pattern");
            false
        }
    }
}

/// Lexically clean a path: unify separators to `/`, collapse repeated
/// separators, and resolve `.` and `..` elements.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let normalized = path.replace('\\', "/");
    let rooted = normalized.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
