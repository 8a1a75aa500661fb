use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Build state codes shared with the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum BuildStatus {
    Failure,
    Succeeded,
    Running,
    Pending,
    Skipped,
}

const STATUS_TABLE: [(BuildStatus, i32, &str); 5] = [
    (BuildStatus::Failure, 0, "failure"),
    (BuildStatus::Succeeded, 1, "succeeded"),
    (BuildStatus::Running, 3, "running"),
    (BuildStatus::Pending, 4, "pending"),
    (BuildStatus::Skipped, 5, "skipped"),
];

impl BuildStatus {
    pub fn code(self) -> i32 {
        STATUS_TABLE
            .iter()
            .find(|(s, _, _)| *s == self)
            .map(|(_, code, _)| *code)
            .unwrap_or(-1)
    }

    pub fn as_str(self) -> &'static str {
        STATUS_TABLE
            .iter()
            .find(|(s, _, _)| *s == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("unknown")
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            BuildStatus::Failure | BuildStatus::Succeeded | BuildStatus::Skipped
        )
    }
}

impl TryFrom<i32> for BuildStatus {
    type Error = BackendError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        STATUS_TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(s, _, _)| *s)
            .ok_or(BackendError::UnknownStatus(code))
    }
}

impl From<BuildStatus> for i32 {
    fn from(status: BuildStatus) -> Self {
        status.code()
    }
}

impl FromStr for BuildStatus {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATUS_TABLE
            .iter()
            .find(|(_, _, name)| *name == s)
            .map(|(status, _, _)| *status)
            .ok_or(BackendError::UnknownStatus(-1))
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work pulled from the frontend.
///
/// Binary builds carry a chroot; SRPM builds have none and are routed by the
/// configured SRPM architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub task_id: String,
    pub build_id: u64,
    #[serde(default)]
    pub chroot: Option<String>,
    #[serde(default)]
    pub project_owner: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub source_type: Option<i32>,
    #[serde(default)]
    pub source_json: Option<String>,
    /// Assigned when the task is routed into the queue.
    #[serde(default)]
    pub group_id: u32,
}

impl BuildTask {
    /// Architecture part of the chroot, e.g. `x86_64` for `fedora-39-x86_64`.
    pub fn arch(&self) -> Option<&str> {
        self.chroot
            .as_deref()
            .and_then(|c| c.rsplit('-').next())
            .filter(|a| !a.is_empty())
    }

    pub fn is_srpm(&self) -> bool {
        self.chroot.is_none()
    }
}

/// State change of one task reported back to the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUpdate {
    pub task_id: String,
    pub build_id: u64,
    pub chroot: Option<String>,
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_on: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_on: Option<i64>,
}

impl TaskUpdate {
    pub fn started(task: &BuildTask, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.task_id.clone(),
            build_id: task.build_id,
            chroot: task.chroot.clone(),
            status: BuildStatus::Running,
            result_dir: None,
            started_on: Some(now.timestamp()),
            ended_on: None,
        }
    }

    pub fn ended(
        task: &BuildTask,
        status: BuildStatus,
        result_dir: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            build_id: task.build_id,
            chroot: task.chroot.clone(),
            status,
            result_dir,
            started_on: None,
            ended_on: Some(now.timestamp()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(chroot: Option<&str>) -> BuildTask {
        BuildTask {
            task_id: "12-fedora-39-x86_64".to_string(),
            build_id: 12,
            chroot: chroot.map(str::to_string),
            project_owner: "alice".to_string(),
            project_name: "tools".to_string(),
            source_type: None,
            source_json: None,
            group_id: 0,
        }
    }

    #[test]
    fn test_status_codes_match_frontend() {
        assert_eq!(BuildStatus::Failure.code(), 0);
        assert_eq!(BuildStatus::Succeeded.code(), 1);
        assert_eq!(BuildStatus::Running.code(), 3);
        assert_eq!(BuildStatus::Pending.code(), 4);
        assert_eq!(BuildStatus::Skipped.code(), 5);
        for (status, code, name) in STATUS_TABLE {
            assert_eq!(BuildStatus::try_from(code).unwrap(), status);
            assert_eq!(name.parse::<BuildStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_code_is_rejected() {
        assert!(matches!(
            BuildStatus::try_from(2),
            Err(BackendError::UnknownStatus(2))
        ));
        assert!(serde_json::from_str::<BuildStatus>("42").is_err());
    }

    #[test]
    fn test_status_serializes_as_code() {
        assert_eq!(serde_json::to_string(&BuildStatus::Running).unwrap(), "3");
    }

    #[test]
    fn test_arch_comes_from_chroot_suffix() {
        assert_eq!(task(Some("fedora-39-x86_64")).arch(), Some("x86_64"));
        assert_eq!(task(Some("epel-9-aarch64")).arch(), Some("aarch64"));
        assert_eq!(task(None).arch(), None);
        assert!(task(None).is_srpm());
    }

    #[test]
    fn test_update_omits_unset_times() {
        let t = task(Some("fedora-39-x86_64"));
        let update = TaskUpdate::started(&t, Utc::now());
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["status"], 3);
        assert!(value.get("ended_on").is_none());
        assert!(value.get("result_dir").is_none());
    }

    #[test]
    fn test_task_defaults_missing_fields() {
        let t: BuildTask =
            serde_json::from_str(r#"{"task_id": "7", "build_id": 7}"#).unwrap();
        assert!(t.is_srpm());
        assert_eq!(t.group_id, 0);
    }
}
