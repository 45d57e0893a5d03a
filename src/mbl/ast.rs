use serde::{Deserialize, Serialize};

/// A parsed MBL task: name, declared inputs, steps, optional handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub file_name: String,
    pub inputs: Vec<String>,
    pub steps: Vec<Step>,
    pub on_timeout: Option<ErrorHandler>,
    pub on_error: Option<ErrorHandler>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub timeout_seconds: Option<u64>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Expect {
        description: String,
    },
    Click {
        target: String,
    },
    DoubleClick {
        target: String,
    },
    RightClick {
        target: String,
    },
    Type {
        value: String,
        is_param: bool,
        target: String,
        append: bool,
    },
    Select {
        value: String,
        is_param: bool,
        target: String,
    },
    Key {
        key_combo: String,
    },
    Extract {
        variable: String,
        source: String,
    },
    Output {
        variable: String,
    },
    Screenshot,
    Abort {
        message: String,
    },
    IfScreenShows {
        condition: String,
        then_actions: Vec<Action>,
        else_actions: Option<Vec<Action>>,
    },
}

impl Action {
    /// Short verb used in log entries.
    pub fn verb(&self) -> &'static str {
        match self {
            Action::Expect { .. } => "expect",
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double-click",
            Action::RightClick { .. } => "right-click",
            Action::Type { .. } => "type",
            Action::Select { .. } => "select",
            Action::Key { .. } => "key",
            Action::Extract { .. } => "extract",
            Action::Output { .. } => "output",
            Action::Screenshot => "screenshot",
            Action::Abort { .. } => "abort",
            Action::IfScreenShows { .. } => "if-screen-shows",
        }
    }
}
