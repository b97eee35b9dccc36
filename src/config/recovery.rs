use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::TimeLineId;
use crate::transaction::TransactionId;
use crate::utils::timestamp::{format_timestamptz, parse_timestamptz, TimestampTz};

pub const RECOVERY_CONFIG_FILE: &str = "recovery.conf";
pub const RECOVERY_DONE_FILE: &str = "recovery.done";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryTarget {
    /// Replay to the end of available WAL.
    #[default]
    Unset,
    Xid(TransactionId),
    Time(TimestampTz),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetTimeline {
    /// Stay on the timeline of the checkpoint recovery starts from.
    #[default]
    Current,
    /// Follow the newest timeline with a history file in the archive.
    Latest,
    Id(TimeLineId),
}

/// Directives read once at startup from `recovery.conf`. Its presence is what
/// puts the engine into archive recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub standby_mode: bool,
    pub primary_conninfo: Option<String>,
    /// Shell command with `%f` (file name) and `%p` (destination path).
    pub restore_command: Option<String>,
    pub archive_directory: Option<PathBuf>,
    pub target: RecoveryTarget,
    pub target_inclusive: bool,
    pub target_timeline: TargetTimeline,
    pub end_command: Option<String>,
    pub trigger_file: Option<PathBuf>,
    pub retrieve_retry_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            standby_mode: false,
            primary_conninfo: None,
            restore_command: None,
            archive_directory: None,
            target: RecoveryTarget::Unset,
            target_inclusive: true,
            target_timeline: TargetTimeline::Current,
            end_command: None,
            trigger_file: None,
            retrieve_retry_interval: Duration::from_secs(5),
        }
    }
}

impl RecoveryConfig {
    /// Reads `recovery.conf` from the data directory; `Ok(None)` when absent.
    pub fn load(data_dir: &Path) -> WalResult<Option<Self>> {
        let path = data_dir.join(RECOVERY_CONFIG_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(WalError::Fatal(format!(
                    "could not open recovery command file \"{}\": {}",
                    path.display(),
                    err
                )))
            }
        };
        info!("starting archive recovery");
        Self::parse(&text).map(Some)
    }

    pub fn parse(text: &str) -> WalResult<Self> {
        let mut config = RecoveryConfig::default();
        let mut target_xid = None;
        let mut target_time = None;

        for (lineno, raw) in text.lines().enumerate() {
            let Some((key, value)) = parse_line(raw).map_err(|msg| {
                WalError::InvalidConfig(format!("syntax error in recovery command file line {}: {}", lineno + 1, msg))
            })?
            else {
                continue;
            };
            match key {
                "standby_mode" => {
                    config.standby_mode = parse_bool(key, &value)?;
                    debug!("standby_mode = '{}'", value);
                }
                "primary_conninfo" => config.primary_conninfo = Some(value),
                "restore_command" => {
                    debug!("restore_command = '{}'", value);
                    config.restore_command = Some(value);
                }
                "archive_directory" => config.archive_directory = Some(PathBuf::from(value)),
                "recovery_target_xid" => {
                    let xid = value.parse::<TransactionId>().map_err(|_| {
                        WalError::InvalidConfig(format!(
                            "recovery_target_xid is not a valid number: \"{}\"",
                            value
                        ))
                    })?;
                    debug!("recovery_target_xid = {}", xid);
                    target_xid = Some(xid);
                }
                "recovery_target_time" => {
                    let ts = parse_timestamptz(&value)?;
                    debug!("recovery_target_time = '{}'", format_timestamptz(ts));
                    target_time = Some(ts);
                }
                "recovery_target_inclusive" => {
                    config.target_inclusive = parse_bool(key, &value)?;
                }
                "recovery_target_timeline" => {
                    config.target_timeline = if value == "latest" {
                        TargetTimeline::Latest
                    } else {
                        let tli = value.parse::<TimeLineId>().ok().filter(|t| *t != 0).ok_or_else(|| {
                            WalError::InvalidConfig(format!(
                                "recovery_target_timeline is not a valid number: \"{}\"",
                                value
                            ))
                        })?;
                        TargetTimeline::Id(tli)
                    };
                }
                "recovery_end_command" => config.end_command = Some(value),
                "trigger_file" => config.trigger_file = Some(PathBuf::from(value)),
                "wal_retrieve_retry_interval" => {
                    let ms = value.parse::<u64>().map_err(|_| {
                        WalError::InvalidConfig(format!(
                            "wal_retrieve_retry_interval must be milliseconds: \"{}\"",
                            value
                        ))
                    })?;
                    config.retrieve_retry_interval = Duration::from_millis(ms.max(1));
                }
                other => {
                    return Err(WalError::InvalidConfig(format!(
                        "unrecognized recovery parameter \"{}\"",
                        other
                    )))
                }
            }
        }

        // An xid target overrides a time target.
        config.target = match (target_xid, target_time) {
            (Some(xid), _) => RecoveryTarget::Xid(xid),
            (None, Some(ts)) => RecoveryTarget::Time(ts),
            (None, None) => RecoveryTarget::Unset,
        };

        if !config.standby_mode && !config.has_archive_source() {
            return Err(WalError::InvalidConfig(format!(
                "recovery command file \"{}\" must specify restore_command or archive_directory when standby mode is not enabled",
                RECOVERY_CONFIG_FILE
            )));
        }
        Ok(config)
    }

    pub fn has_archive_source(&self) -> bool {
        self.restore_command.is_some() || self.archive_directory.is_some()
    }
}

/// Splits `key = value`; blank lines and comments yield `None`.
fn parse_line(raw: &str) -> Result<Option<(&str, String)>, String> {
    let line = strip_comment(raw).trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| format!("missing \"=\" in \"{}\"", line))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("missing parameter name".to_string());
    }
    let value = value.trim();
    let value = match value.strip_prefix('\'') {
        Some(rest) => rest
            .strip_suffix('\'')
            .ok_or_else(|| format!("unterminated quoted string for \"{}\"", key))?
            .replace("''", "'"),
        None => value.to_string(),
    };
    Ok(Some((key, value)))
}

/// Drops a trailing `#` comment unless the `#` sits inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '\'' => quoted = !quoted,
            '#' if !quoted => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn parse_bool(key: &str, value: &str) -> WalResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(WalError::InvalidConfig(format!(
            "parameter \"{}\" requires a Boolean value",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::timestamp::parse_timestamptz;

    #[test]
    fn parses_all_keys() {
        let text = "\
# archive recovery
restore_command = 'cp /mnt/archive/%f \"%p\"'
recovery_target_time = '2019-07-30 18:26:11.83003+00'
recovery_target_inclusive = off   # stop before
recovery_target_timeline = 'latest'
recovery_end_command = 'echo done'
trigger_file = '/tmp/promote'
wal_retrieve_retry_interval = 250
";
        let config = RecoveryConfig::parse(text).unwrap();
        assert_eq!(
            config.restore_command.as_deref(),
            Some("cp /mnt/archive/%f \"%p\"")
        );
        assert_eq!(
            config.target,
            RecoveryTarget::Time(parse_timestamptz("2019-07-30 18:26:11.83003+00").unwrap())
        );
        assert!(!config.target_inclusive);
        assert_eq!(config.target_timeline, TargetTimeline::Latest);
        assert_eq!(config.trigger_file, Some(PathBuf::from("/tmp/promote")));
        assert_eq!(config.retrieve_retry_interval, Duration::from_millis(250));
        assert!(!config.standby_mode);
    }

    #[test]
    fn xid_target_wins_over_time() {
        let text = "archive_directory = '/a'\nrecovery_target_time = '2020-01-01 00:00:00'\nrecovery_target_xid = 1234\n";
        let config = RecoveryConfig::parse(text).unwrap();
        assert_eq!(config.target, RecoveryTarget::Xid(1234));
        assert!(config.target_inclusive);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(RecoveryConfig::parse("archive_directory='/a'\nbogus = 1\n").is_err());
        assert!(RecoveryConfig::parse("archive_directory='/a'\nstandby_mode = maybe\n").is_err());
        assert!(RecoveryConfig::parse("archive_directory='/a'\nrecovery_target_timeline = 0\n").is_err());
        assert!(RecoveryConfig::parse("archive_directory = '/a\n").is_err());
        // Archive recovery needs somewhere to fetch WAL from.
        assert!(RecoveryConfig::parse("recovery_target_xid = 5\n").is_err());
        let standby = RecoveryConfig::parse("standby_mode = 'on'\nprimary_conninfo = 'host=a'\n").unwrap();
        assert!(standby.standby_mode);
        assert_eq!(standby.target_timeline, TargetTimeline::Current);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(RecoveryConfig::load(dir.path()).unwrap().is_none());
        fs::write(
            dir.path().join(RECOVERY_CONFIG_FILE),
            "recovery_target_timeline = 3\narchive_directory = '/x'\n",
        )
        .unwrap();
        let config = RecoveryConfig::load(dir.path()).unwrap().unwrap();
        assert_eq!(config.target_timeline, TargetTimeline::Id(3));
    }
}
