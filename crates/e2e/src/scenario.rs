//! Declarative YAML scenarios
//!
//! A scenario is one UI test: a name, tags for filtering and an ordered list
//! of steps. String fields may carry `{{...}}` placeholders that the step
//! executor expands at run time (see [`crate::steps`]).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::driver::{LoadState, WaitState};
use crate::error::{E2eError, E2eResult};

/// A complete test scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name; also decides whether the test gets a stored session
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Whether the test depends on a logged-in customer.
    ///
    /// Defaults to whether any step is `user_login`.
    #[serde(default)]
    pub requires_login: Option<bool>,

    /// Start without the worker's stored session, for flows that end it
    #[serde(default)]
    pub fresh_context: bool,

    pub steps: Vec<Step>,
}

/// A single step in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL; relative URLs resolve against the base URL
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: LoadState,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    /// Ensure the page is logged in, restoring or performing a login
    UserLogin,

    /// Submit the login form from the home page
    Login {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_true")]
        expect_success: bool,
    },

    /// Register a freshly generated customer
    Register {
        #[serde(default)]
        username_prefix: Option<String>,
    },

    Click {
        selector: String,
        #[serde(default)]
        has_text: Option<String>,
        /// Reload and retry once on timeout; disable for side-effecting submits
        #[serde(default = "default_true")]
        retry_on_timeout: bool,
    },

    Fill {
        selector: String,
        value: String,
    },

    /// Choose an option of a script-populated dropdown
    Select {
        selector: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        index: Option<usize>,
        #[serde(default = "default_min_options")]
        min_options: usize,
    },

    /// Wait until a dropdown offers enough real options
    WaitForOptions {
        selector: String,
        #[serde(default = "default_min_options")]
        min_options: usize,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Wait {
        selector: String,
        #[serde(default)]
        has_text: Option<String>,
        #[serde(default)]
        state: WaitState,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Assert {
        selector: String,
        #[serde(default)]
        has_text: Option<String>,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Assert the current URL matches a regex
    AssertUrl {
        pattern: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Check for the internal-error page explicitly
    CheckInternalError {
        #[serde(default)]
        requires_login: Option<bool>,
    },

    Sleep {
        ms: u64,
    },

    Log {
        message: String,
    },

    /// Stop here and report the test as skipped
    Skip {
        reason: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_min_options() -> usize {
    1
}

impl Step {
    /// Short label used in logs and failure messages
    pub fn describe(&self) -> String {
        match self {
            Step::Navigate { url, .. } => format!("navigate:{}", url),
            Step::UserLogin => "user_login".to_string(),
            Step::Login { .. } => "login".to_string(),
            Step::Register { .. } => "register".to_string(),
            Step::Click { selector, .. } => format!("click:{}", selector),
            Step::Fill { selector, .. } => format!("fill:{}", selector),
            Step::Select { selector, .. } => format!("select:{}", selector),
            Step::WaitForOptions { selector, .. } => format!("wait_for_options:{}", selector),
            Step::Wait { selector, .. } => format!("wait:{}", selector),
            Step::Assert { selector, .. } => format!("assert:{}", selector),
            Step::AssertUrl { pattern, .. } => format!("assert_url:{}", pattern),
            Step::CheckInternalError { .. } => "check_internal_error".to_string(),
            Step::Sleep { ms } => format!("sleep:{}", ms),
            Step::Log { .. } => "log".to_string(),
            Step::Skip { .. } => "skip".to_string(),
        }
    }
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::ScenarioParse(format!("{}: {}", path.display(), e)))
    }

    /// Load every `.yaml`/`.yml` under `dir`, ordered by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        let mut scenarios = Vec::with_capacity(paths.len());
        for path in paths {
            scenarios.push(Self::from_file(&path)?);
        }

        let mut names = std::collections::HashSet::new();
        for scenario in &scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(E2eError::ScenarioParse(format!(
                    "duplicate scenario name '{}'",
                    scenario.name
                )));
            }
        }
        Ok(scenarios)
    }

    fn validate(&self) -> E2eResult<()> {
        if self.name.trim().is_empty() {
            return Err(E2eError::ScenarioParse("scenario name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(E2eError::ScenarioParse(format!("{} has no steps", self.name)));
        }
        for step in &self.steps {
            if let Step::Select {
                selector,
                label,
                value,
                index,
                ..
            } = step
            {
                let choices = [label.is_some(), value.is_some(), index.is_some()]
                    .iter()
                    .filter(|b| **b)
                    .count();
                if choices > 1 {
                    return Err(E2eError::ScenarioParse(format!(
                        "{}: select on {} sets more than one of label/value/index",
                        self.name, selector
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn requires_login(&self) -> bool {
        self.requires_login
            .unwrap_or_else(|| self.steps.iter().any(|s| matches!(s, Step::UserLogin)))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Round-robin slice `index` of `total`
    pub fn shard(scenarios: Vec<Self>, index: usize, total: usize) -> Vec<Self> {
        if total <= 1 {
            return scenarios;
        }
        scenarios
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % total == index)
            .map(|(_, s)| s)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transfer_scenario() {
        let yaml = r##"
name: transfer_funds
description: Move money between two accounts
tags: [smoke, banking]
steps:
  - action: user_login
  - action: navigate
    url: transfer.htm
  - action: wait_for_options
    selector: '#toAccountId'
  - action: fill
    selector: '#amount'
    value: "25"
  - action: select
    selector: '#fromAccountId'
    index: 0
  - action: click
    selector: 'input[value="Transfer"]'
    retry_on_timeout: false
  - action: assert
    selector: '#showResult h1.title'
    text: Transfer Complete!
"##;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        assert_eq!(scenario.steps.len(), 7);
        assert!(scenario.requires_login());
        assert!(scenario.has_tag("smoke"));
        match &scenario.steps[2] {
            Step::WaitForOptions { min_options, timeout_ms, .. } => {
                assert_eq!(*min_options, 1);
                assert!(timeout_ms.is_none());
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &scenario.steps[5] {
            Step::Click { retry_on_timeout, .. } => assert!(!retry_on_timeout),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_login_defaults() {
        let yaml = r#"
name: login_invalid
steps:
  - action: navigate
    url: ""
  - action: login
    username: nobody
    password: wrong
    expect_success: false
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        assert!(!scenario.requires_login());
        match &scenario.steps[1] {
            Step::Login { expect_success, username, .. } => {
                assert!(!expect_success);
                assert_eq!(username.as_deref(), Some("nobody"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_rejects_ambiguous_select() {
        let yaml = r#"
name: open_account
steps:
  - action: select
    selector: '#type'
    label: SAVINGS
    index: 1
"#;
        assert!(matches!(
            Scenario::from_yaml(yaml),
            Err(E2eError::ScenarioParse(_))
        ));
    }

    #[test]
    fn test_rejects_empty_steps() {
        assert!(Scenario::from_yaml("name: nothing\nsteps: []\n").is_err());
    }

    #[test]
    fn test_load_all_sorted_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "name: b\nsteps:\n  - action: log\n    message: hi\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "name: a\nsteps:\n  - action: sleep\n    ms: 1\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scenarios = Scenario::load_all(dir.path()).unwrap();
        let names: Vec<_> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        std::fs::write(
            dir.path().join("c.yaml"),
            "name: a\nsteps:\n  - action: sleep\n    ms: 1\n",
        )
        .unwrap();
        assert!(Scenario::load_all(dir.path()).is_err());
    }

    #[test]
    fn test_bundled_scenarios_parse() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/../../scenarios");
        let scenarios = Scenario::load_all(Path::new(dir)).unwrap();
        let find = |name: &str| scenarios.iter().find(|s| s.name == name).unwrap();

        for name in [
            "test_request_loan_denied_insufficient_funds",
            "test_find_transactions_by_amount",
            "test_find_transactions_by_id_invalid",
            "test_update_contact_info_validation",
            "test_footer_services_navigation",
            "test_header_contact_link",
        ] {
            assert!(find(name).requires_login(), "{} should need a login", name);
        }

        let journey = find("test_e2e_happy_path_workflow");
        assert!(journey.fresh_context);
        assert!(journey.requires_login());
        assert!(!journey.steps.iter().any(|s| matches!(s, Step::UserLogin)));
        assert!(find("test_logout_successful").fresh_context);
    }

    #[test]
    fn test_shard_round_robin() {
        let scenarios: Vec<_> = (0..5)
            .map(|i| Scenario {
                name: format!("s{}", i),
                description: String::new(),
                tags: vec![],
                requires_login: None,
                fresh_context: false,
                steps: vec![Step::Sleep { ms: 1 }],
            })
            .collect();
        let shard: Vec<_> = Scenario::shard(scenarios.clone(), 1, 2)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(shard, vec!["s1", "s3"]);
        assert_eq!(Scenario::shard(scenarios, 0, 1).len(), 5);
    }
}
