//! Naming and storage of observation captures, run records and plans.
//!
//! Captures are referenced from history by path only; no image bytes are
//! ever stored in a [`StepResult`](crate::StepResult).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;

use crate::config::ArtifactsConfig;
use crate::error::ArtifactError;
use crate::history::RunResult;
use crate::plan::TaskPlan;
use crate::types::ActionType;

const SLUG_MAX_CHARS: usize = 30;
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Filesystem-safe short form of a task description.
pub fn task_slug(task: &str) -> String {
    let kept: String = task
        .chars()
        .take(SLUG_MAX_CHARS)
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let slug = kept.trim().replace(' ', "_");
    if slug.is_empty() { "task".to_string() } else { slug }
}

/// `step_<NN>_<action_type>_<slug>_<timestamp>.png`
pub fn observation_file_name(
    step_index: usize,
    action_type: ActionType,
    task: &str,
    at: DateTime<Local>,
) -> String {
    format!(
        "step_{:02}_{}_{}_{}.png",
        step_index,
        action_type,
        task_slug(task),
        at.format(TIMESTAMP_FORMAT)
    )
}

pub fn run_record_file_name(task: &str, at: DateTime<Local>) -> String {
    format!("run_{}_{}.json", task_slug(task), at.format(TIMESTAMP_FORMAT))
}

pub fn plan_file_name(goal: &str, at: DateTime<Local>) -> String {
    format!("plan_{}_{}.json", task_slug(goal), at.format(TIMESTAMP_FORMAT))
}

/// Directories where a run's artifacts land.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    screenshot_dir: PathBuf,
    runs_dir: PathBuf,
    plans_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(config: &ArtifactsConfig) -> Self {
        Self {
            screenshot_dir: config.screenshot_dir.clone(),
            runs_dir: config.runs_dir.clone(),
            plans_dir: config.plans_dir.clone(),
        }
    }

    /// All three directories under one root.
    pub fn under(root: &Path) -> Self {
        Self {
            screenshot_dir: root.join("screenshots"),
            runs_dir: root.join("runs"),
            plans_dir: root.join("plans"),
        }
    }

    pub fn screenshot_dir(&self) -> &Path {
        &self.screenshot_dir
    }

    /// Where the capture for this step should be written.
    pub fn observation_path(
        &self,
        step_index: usize,
        action_type: ActionType,
        task: &str,
    ) -> Result<PathBuf, ArtifactError> {
        std::fs::create_dir_all(&self.screenshot_dir)?;
        Ok(self
            .screenshot_dir
            .join(observation_file_name(step_index, action_type, task, Local::now())))
    }

    pub fn save_run(&self, result: &RunResult) -> Result<PathBuf, ArtifactError> {
        let path = self
            .runs_dir
            .join(run_record_file_name(&result.task, Local::now()));
        write_json(&path, result)?;
        debug!(path = %path.display(), "Saved run record");
        Ok(path)
    }

    pub fn save_plan(&self, plan: &TaskPlan) -> Result<PathBuf, ArtifactError> {
        let path = self.plans_dir.join(plan_file_name(&plan.goal, Local::now()));
        write_json(&path, plan)?;
        debug!(path = %path.display(), "Saved plan");
        Ok(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
    }

    #[test]
    fn test_task_slug() {
        assert_eq!(
            task_slug("Create a new project in Linear"),
            "Create_a_new_project_in_Linear"
        );
        assert_eq!(
            task_slug("navigate to example.com!"),
            "navigate_to_examplecom"
        );
        assert_eq!(task_slug("   "), "task");
        assert_eq!(task_slug("??"), "task");
        assert_eq!(
            task_slug("a very long task description that keeps going").len(),
            30
        );
    }

    #[test]
    fn test_observation_file_name() {
        let name = observation_file_name(
            3,
            ActionType::CaptureScreenshot,
            "Open the settings page",
            at(),
        );
        assert_eq!(
            name,
            "step_03_capture_screenshot_Open_the_settings_page_20260304_050607.png"
        );
    }

    #[test]
    fn test_record_file_names() {
        assert_eq!(
            run_record_file_name("go", at()),
            "run_go_20260304_050607.json"
        );
        assert_eq!(plan_file_name("go", at()), "plan_go_20260304_050607.json");
    }

    #[test]
    fn test_observation_path_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::under(dir.path());
        let path = store.observation_path(1, ActionType::Navigate, "go home").unwrap();
        assert!(store.screenshot_dir().is_dir());
        assert!(path.starts_with(store.screenshot_dir()));
        let file_name = path.file_name().unwrap().to_string_lossy();
        assert!(file_name.starts_with("step_01_navigate_go_home_"));
    }
}
