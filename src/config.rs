//! Configuration management for unionfs

use crate::branch::{BranchPerm, CreatePolicy};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Longest name the union accepts, whiteout prefix included
pub const DEFAULT_MAX_NAME_LEN: usize = 255;

/// Pseudo-links per hash bucket before a warning is logged
pub const DEFAULT_PLINK_WARN: usize = 50;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Branches, highest priority first
    pub branches: Vec<BranchConfig>,

    /// Policy choosing the branch for new entries
    #[serde(default)]
    pub create_policy: CreatePolicy,

    /// Direct branch access consistency checks
    #[serde(default)]
    pub udba: Udba,

    /// Preserve hard links across copy-up
    #[serde(default = "default_true")]
    pub plink: bool,

    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,

    #[serde(default = "default_plink_warn")]
    pub plink_warn: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_name_len() -> usize {
    DEFAULT_MAX_NAME_LEN
}

fn default_plink_warn() -> usize {
    DEFAULT_PLINK_WARN
}

/// One backing directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub path: PathBuf,
    pub perm: BranchPerm,
}

impl FromStr for BranchConfig {
    type Err = Error;

    /// Parse `path=rw` or `path=ro`; a bare path is read-only
    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('=') {
            Some((path, perm)) if !path.is_empty() => Ok(BranchConfig {
                path: PathBuf::from(path),
                perm: perm.parse()?,
            }),
            Some(_) => Err(Error::InvalidConfig(format!("branch without a path: {}", s))),
            None => Ok(BranchConfig {
                path: PathBuf::from(s),
                perm: BranchPerm::ReadOnly,
            }),
        }
    }
}

/// How much the union distrusts changes made directly on the branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Udba {
    /// Trust cached state
    None,
    /// Re-verify parent and target on the branch before each mutation
    #[default]
    Reval,
}

impl FromStr for Udba {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "none" => Ok(Udba::None),
            "reval" => Ok(Udba::Reval),
            other => Err(Error::InvalidConfig(format!("unknown udba mode: {}", other))),
        }
    }
}

/// Runtime options of a mounted union
#[derive(Debug, Clone)]
pub struct UnionOptions {
    pub create_policy: CreatePolicy,
    pub udba: Udba,
    pub plink: bool,
    pub max_name_len: usize,
    pub plink_warn: usize,
}

impl Default for UnionOptions {
    fn default() -> Self {
        Self {
            create_policy: CreatePolicy::default(),
            udba: Udba::default(),
            plink: true,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            plink_warn: DEFAULT_PLINK_WARN,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let defaults = UnionOptions::default();
        Config {
            branches: Vec::new(),
            create_policy: defaults.create_policy,
            udba: defaults.udba,
            plink: defaults.plink,
            max_name_len: defaults.max_name_len,
            plink_warn: defaults.plink_warn,
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("unionfs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(policy) = var("UNIONFS_CREATE_POLICY") {
            self.create_policy = policy.parse()?;
        }

        if let Some(udba) = var("UNIONFS_UDBA") {
            self.udba = udba.parse()?;
        }

        if let Some(plink) = var("UNIONFS_PLINK") {
            match plink.trim() {
                "1" | "true" | "on" => self.plink = true,
                "0" | "false" | "off" => self.plink = false,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "UNIONFS_PLINK must be a boolean, got {}",
                        other
                    )))
                }
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one branch is required".to_string(),
            ));
        }

        for (i, branch) in self.branches.iter().enumerate() {
            if self.branches[..i].iter().any(|b| b.path == branch.path) {
                return Err(Error::InvalidConfig(format!(
                    "Branch {} listed twice",
                    branch.path.display()
                )));
            }
        }

        if self.max_name_len <= crate::whiteout::WH_PREFIX.len() {
            return Err(Error::InvalidConfig(
                "Maximum name length leaves no room for whiteouts".to_string(),
            ));
        }

        if self.plink_warn == 0 {
            return Err(Error::InvalidConfig(
                "Pseudo-link warning threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Runtime options for a union mounted from this configuration
    pub fn options(&self) -> UnionOptions {
        UnionOptions {
            create_policy: self.create_policy.clone(),
            udba: self.udba,
            plink: self.plink,
            max_name_len: self.max_name_len,
            plink_warn: self.plink_warn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample() -> Config {
        Config {
            branches: vec![
                "/tmp/upper=rw".parse().unwrap(),
                "/tmp/lower=ro".parse().unwrap(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_branch_config_parse() {
        let b: BranchConfig = "/srv/rw=rw".parse().unwrap();
        assert_eq!(b.perm, BranchPerm::ReadWrite);
        assert_eq!(b.path, PathBuf::from("/srv/rw"));

        let bare: BranchConfig = "/srv/base".parse().unwrap();
        assert_eq!(bare.perm, BranchPerm::ReadOnly);

        assert!("/srv/x=rx".parse::<BranchConfig>().is_err());
        assert!("=rw".parse::<BranchConfig>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());
        assert!(Config::default().validate().is_err());

        let mut dup = sample();
        dup.branches.push(dup.branches[0].clone());
        assert!(dup.validate().is_err());

        let mut short = sample();
        short.max_name_len = 4;
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = sample();
        config.create_policy = CreatePolicy::MostFreeSpace { interval_secs: 10 };
        config.udba = Udba::None;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.branches, config.branches);
        assert_eq!(loaded.udba, Udba::None);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config =
            serde_json::from_str(r#"{"branches":[{"path":"/a","perm":"rw"}]}"#).unwrap();
        assert!(config.plink);
        assert_eq!(config.udba, Udba::Reval);
        assert_eq!(config.create_policy, CreatePolicy::TopDownParent);
        assert_eq!(config.max_name_len, DEFAULT_MAX_NAME_LEN);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("UNIONFS_CREATE_POLICY", "rr"),
            ("UNIONFS_UDBA", "none"),
            ("UNIONFS_PLINK", "off"),
        ]
        .into_iter()
        .collect();
        let mut config = sample();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.create_policy, CreatePolicy::RoundRobin);
        assert_eq!(config.udba, Udba::None);
        assert!(!config.plink);

        let opts = config.options();
        assert!(!opts.plink);
        assert_eq!(opts.udba, Udba::None);

        let mut bad = sample();
        assert!(bad
            .apply_overrides(|k| (k == "UNIONFS_PLINK").then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn test_default_path() {
        assert!(Config::default_path().ends_with("unionfs/config.json"));
    }
}
